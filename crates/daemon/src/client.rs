//! The cloud client as seen by the filesystem core.
//!
//! Node storage, transfers and event delivery live behind [`Client`]; the
//! core only needs to query the tree, mutate it and hand work back to the
//! client's own execution context.

use std::path::Path;

use common::task::{Task, TaskFunction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fuse::{MountEvent, NodeHandle};

/// Access rights on a cloud node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permissions {
    ReadOnly,
    Full,
}

/// Snapshot of a cloud node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub handle: NodeHandle,
    /// `None` for roots.
    pub parent: Option<NodeHandle>,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    /// Modification time in seconds since the epoch.
    pub modified: i64,
    pub permissions: Permissions,
}

/// Errors reported by the cloud client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Node not found")]
    NotFound,

    #[error("Access denied")]
    AccessDenied,

    #[error("Node already exists")]
    Exists,

    #[error("Storage quota exceeded")]
    OverQuota,

    #[error("Cloud is unavailable")]
    Unavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ClientError {
    pub fn errno(&self) -> i32 {
        match self {
            ClientError::NotFound => libc::ENOENT,
            ClientError::AccessDenied => libc::EACCES,
            ClientError::Exists => libc::EEXIST,
            ClientError::OverQuota => libc::ENOSPC,
            ClientError::Unavailable => libc::EAGAIN,
            ClientError::Io(error) => error.raw_os_error().unwrap_or(libc::EIO),
            ClientError::Other(_) => libc::EIO,
        }
    }
}

pub trait Client: Send + Sync {
    /// Describe the node `handle`, if it exists.
    fn get(&self, handle: NodeHandle) -> Option<NodeInfo>;

    /// Describe the child of `parent` called `name`, if any.
    fn lookup(&self, parent: NodeHandle, name: &str) -> Option<NodeInfo>;

    /// Resolve an absolute cloud path such as `/photos/2024`.
    fn handle(&self, path: &str) -> Option<NodeHandle>;

    fn children(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>, ClientError>;

    fn exists(&self, handle: NodeHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Whether `path` is free of any sync configuration, so that mounting
    /// over it cannot conflict with one.
    fn syncable(&self, path: &Path) -> bool;

    fn make_directory(&self, parent: NodeHandle, name: &str) -> Result<NodeInfo, ClientError>;

    /// Store the contents of `content` as `name` under `parent`, replacing
    /// any existing file of that name.
    fn upload(&self, parent: NodeHandle, name: &str, content: &Path) -> Result<NodeInfo, ClientError>;

    /// Write the contents of `handle` to `destination`.
    fn download(&self, handle: NodeHandle, destination: &Path) -> Result<(), ClientError>;

    /// Move and/or rename a node.
    fn move_node(&self, handle: NodeHandle, parent: NodeHandle, name: &str) -> Result<(), ClientError>;

    fn remove(&self, handle: NodeHandle) -> Result<(), ClientError>;

    /// Report a mount lifecycle change.
    fn emit_event(&self, event: MountEvent);

    /// Run `function` on the client's execution context.
    ///
    /// The default runs it immediately on the calling thread.
    fn execute(&self, function: TaskFunction) -> Task {
        let task = Task::new(function);
        task.complete();
        task
    }
}
