//! Seam between a mount and the platform's filesystem driver.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::database::models::MountFlags;
use crate::fuse::{MountInodeId, MountResult};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The filesystem is still in use.
    #[error("Session is busy")]
    Busy,

    /// No driver is installed or it refused to start.
    #[error("Filesystem driver is unavailable")]
    Unavailable,

    #[error("Session failed: {0}")]
    Failed(String),
}

impl From<SessionError> for MountResult {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Busy => MountResult::Busy,
            SessionError::Unavailable => MountResult::BackendUnavailable,
            SessionError::Failed(_) => MountResult::Failed,
        }
    }
}

/// A live driver session serving one mount.
///
/// Invalidations tell the kernel to drop what it cached about an inode.
/// They may be issued from any thread.
pub trait Session: Send + Sync {
    fn invalidate_attributes(&self, id: MountInodeId);

    /// Drop cached content, all of it when `range` is `None`.
    fn invalidate_data(&self, id: MountInodeId, range: Option<(u64, u64)>);

    /// Drop the directory entry `name` below `parent`. `child` is the inode
    /// the entry referred to, when known.
    fn invalidate_entry(&self, name: &str, child: Option<MountInodeId>, parent: MountInodeId);

    /// Driver file descriptor, on platforms that have one.
    fn descriptor(&self) -> Option<i64> {
        None
    }

    /// Detach the filesystem from its mount point.
    fn unmount(&self) -> Result<(), SessionError>;
}

/// Starts driver sessions.
pub trait Platform: Send + Sync {
    fn mount(&self, path: &Path, flags: &MountFlags) -> Result<Arc<dyn Session>, SessionError>;
}
