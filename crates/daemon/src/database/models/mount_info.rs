use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::fuse::NodeHandle;

/// User-facing properties of a mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountFlags {
    /// Unique, user-visible name. Mounts are addressed by it.
    pub name: String,
    /// Enable the mount when the service starts.
    pub enable_at_startup: bool,
    /// Keep the mount across restarts. Transient mounts are pruned at startup.
    pub persistent: bool,
    /// Reject every mutating operation.
    pub read_only: bool,
}

impl MountFlags {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A mount as stored in the database: which cloud directory appears where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    /// Cloud directory exposed by the mount.
    pub handle: NodeHandle,
    /// Local directory the mount is attached to.
    pub path: PathBuf,
    pub flags: MountFlags,
}

impl MountInfo {
    pub fn new(handle: NodeHandle, path: impl Into<PathBuf>, flags: MountFlags) -> Self {
        Self {
            handle,
            path: path.into(),
            flags,
        }
    }

    pub fn name(&self) -> &str {
        &self.flags.name
    }
}
