//! Filesystem core shared by every platform driver.
//!
//! # Architecture
//!
//! - `InodeDb`: process-wide index of live inodes, backed by the cloud client
//! - `Inode`: a file or directory; directory and file operations live in
//!   `directory` and `file`
//! - `InodeCache` / `FileCache`: keep recently used inodes and staged file
//!   content around
//! - `Mount` / `MountDb`: live driver sessions and the table of enabled mounts
//! - `Unmounter`: detaches mounts on the task executor
//!
//! # Change propagation
//!
//! Cloud changes are translated by the `InodeDb` into `InodeChange`s, which
//! each mount forwards to its driver session as invalidations, in order.

mod directory;
mod error;
mod events;
mod file;
mod file_cache;
mod inode;
mod inode_cache;
mod inode_db;
mod inode_id;
mod invalidator;
mod mount;
mod mount_db;
mod mount_result;
mod session;
mod unmounter;

pub use directory::{DirectoryInode, MAX_NAME_LENGTH};
pub use error::FsError;
pub use events::{MountEvent, MountEventKind, NodeEvent};
pub use file::{FileHandle, FileInode};
pub use file_cache::{FileCache, FileExtension, FileExtensionDb, FileInfo};
pub use inode::{Inode, InodeInfo, InodeKind, InodeRef};
pub use inode_cache::{InodeCache, InodeCacheConfig};
pub use inode_db::{InodeChange, InodeDb};
pub use inode_id::{InodeId, InodeIdMap, MountInodeId, NodeHandle};
pub use invalidator::Invalidation;
pub use mount::{Mount, MountEntry};
pub use mount_db::MountDb;
pub use mount_result::MountResult;
pub use session::{Platform, Session, SessionError};
pub use unmounter::{UnmountPolicy, Unmounter};
