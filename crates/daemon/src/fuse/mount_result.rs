use serde::{Deserialize, Serialize};

/// Outcome of a mount lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountResult {
    Success,
    /// The platform driver is not available.
    BackendUnavailable,
    /// The mount is in use.
    Busy,
    /// The platform driver refused the request.
    Failed,
    LocalExists,
    /// The local path is not a directory.
    LocalFile,
    /// The local path is claimed by a sync.
    LocalSyncing,
    /// Another enabled mount claims the local path.
    LocalTaken,
    /// The local path does not exist.
    LocalUnknown,
    NameTaken,
    NameTooLong,
    NoName,
    /// The cloud node is not a directory.
    RemoteFile,
    /// The cloud node does not exist.
    RemoteUnknown,
    Unexpected,
    /// No mount has the given name.
    Unknown,
    Unsupported,
    /// The operation was abandoned during shutdown.
    Aborted,
}

impl MountResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountResult::Success => "success",
            MountResult::BackendUnavailable => "backend_unavailable",
            MountResult::Busy => "busy",
            MountResult::Failed => "failed",
            MountResult::LocalExists => "local_exists",
            MountResult::LocalFile => "local_file",
            MountResult::LocalSyncing => "local_syncing",
            MountResult::LocalTaken => "local_taken",
            MountResult::LocalUnknown => "local_unknown",
            MountResult::NameTaken => "name_taken",
            MountResult::NameTooLong => "name_too_long",
            MountResult::NoName => "no_name",
            MountResult::RemoteFile => "remote_file",
            MountResult::RemoteUnknown => "remote_unknown",
            MountResult::Unexpected => "unexpected",
            MountResult::Unknown => "unknown",
            MountResult::Unsupported => "unsupported",
            MountResult::Aborted => "aborted",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == MountResult::Success
    }
}

impl std::fmt::Display for MountResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
