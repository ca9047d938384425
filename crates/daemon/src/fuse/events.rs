//! Events crossing the boundary between the cloud client and the
//! filesystem core.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::client::NodeInfo;
use crate::fuse::{MountResult, NodeHandle};

/// Which lifecycle operation a [`MountEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountEventKind {
    Added,
    Changed,
    Disabled,
    Enabled,
    Removed,
}

/// Emitted to the client after every mount lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEvent {
    pub kind: MountEventKind,
    pub name: String,
    pub path: PathBuf,
    pub result: MountResult,
}

/// Change to the cloud tree reported by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Added(NodeInfo),
    /// Content or attributes changed.
    Modified(NodeInfo),
    Moved {
        info: NodeInfo,
        from_parent: NodeHandle,
        from_name: String,
    },
    Removed {
        handle: NodeHandle,
        parent: NodeHandle,
        name: String,
    },
}

impl NodeEvent {
    pub fn handle(&self) -> NodeHandle {
        match self {
            NodeEvent::Added(info) | NodeEvent::Modified(info) | NodeEvent::Moved { info, .. } => info.handle,
            NodeEvent::Removed { handle, .. } => *handle,
        }
    }
}
