//! In-memory representation of files and directories.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;

use crate::client::{NodeInfo, Permissions};
use crate::fuse::{DirectoryInode, FileInode, FsError, InodeDb, InodeId, NodeHandle};

/// Shared reference to an inode. The inode lives as long as any reference.
pub type InodeRef = Arc<Inode>;

/// Point-in-time description of an inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeInfo {
    pub id: InodeId,
    /// Cloud node backing the inode; `None` until a local file is flushed.
    pub handle: Option<NodeHandle>,
    pub parent: Option<InodeId>,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: i64,
    pub permissions: Permissions,
}

#[derive(Debug, Clone)]
pub(crate) struct Description {
    pub(crate) name: String,
    pub(crate) parent: Option<InodeId>,
    pub(crate) handle: Option<NodeHandle>,
    pub(crate) size: u64,
    pub(crate) modified: i64,
    pub(crate) permissions: Permissions,
}

impl Description {
    pub(crate) fn from_node(info: &NodeInfo, parent: Option<InodeId>) -> Self {
        Self {
            name: info.name.clone(),
            parent,
            handle: Some(info.handle),
            size: info.size,
            modified: info.modified,
            permissions: info.permissions,
        }
    }
}

pub enum InodeKind {
    Directory(DirectoryInode),
    File(FileInode),
}

/// A file or directory known to the filesystem.
///
/// Removal is one-way: once [`Inode::removed`] is true the inode only lives
/// on until the last reference to it is dropped, at which point it is
/// erased from the [`InodeDb`] index.
pub struct Inode {
    id: InodeId,
    db: Weak<InodeDb>,
    description: Mutex<Description>,
    removed: AtomicBool,
    kind: InodeKind,
}

impl Inode {
    pub(crate) fn new(id: InodeId, db: Weak<InodeDb>, description: Description, kind: InodeKind) -> Self {
        Self {
            id,
            db,
            description: Mutex::new(description),
            removed: AtomicBool::new(false),
            kind,
        }
    }

    pub fn info(&self) -> InodeInfo {
        let description = self.description.lock().clone();

        let size = match self.file() {
            Ok(file) => file.staged_size().unwrap_or(description.size),
            Err(_) => description.size,
        };

        InodeInfo {
            id: self.id,
            handle: description.handle,
            parent: description.parent,
            name: description.name,
            is_directory: self.is_directory(),
            size,
            modified: description.modified,
            permissions: description.permissions,
        }
    }

    /// Re-read the inode's description from the cloud.
    ///
    /// Marks the inode removed and fails with [`FsError::NotFound`] if its
    /// node no longer exists. Local files are returned as they are.
    pub fn refresh(&self) -> Result<InodeInfo, FsError> {
        if self.removed() {
            return Err(FsError::NotFound);
        }

        let Some(handle) = self.handle() else {
            return Ok(self.info());
        };

        let db = self.db()?;

        match db.client().get(handle) {
            Some(node) => {
                let parent = node.parent.map(|parent| db.id_of(parent));
                self.update(&node, parent);
                Ok(self.info())
            }
            None => {
                self.set_removed();
                Err(FsError::NotFound)
            }
        }
    }

    /* Getters */

    pub fn id(&self) -> InodeId {
        self.id
    }

    pub fn name(&self) -> String {
        self.description.lock().name.clone()
    }

    pub fn parent(&self) -> Option<InodeId> {
        self.description.lock().parent
    }

    pub fn handle(&self) -> Option<NodeHandle> {
        self.description.lock().handle
    }

    pub fn permissions(&self) -> Permissions {
        self.description.lock().permissions
    }

    pub fn modified(&self) -> i64 {
        self.description.lock().modified
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, InodeKind::Directory(_))
    }

    pub fn removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> &InodeKind {
        &self.kind
    }

    pub(crate) fn directory(&self) -> Result<&DirectoryInode, FsError> {
        match &self.kind {
            InodeKind::Directory(directory) => Ok(directory),
            InodeKind::File(_) => Err(FsError::NotDirectory),
        }
    }

    pub(crate) fn file(&self) -> Result<&FileInode, FsError> {
        match &self.kind {
            InodeKind::File(file) => Ok(file),
            InodeKind::Directory(_) => Err(FsError::IsDirectory),
        }
    }

    pub(crate) fn db(&self) -> Result<Arc<InodeDb>, FsError> {
        self.db.upgrade().ok_or(FsError::Detached)
    }

    pub(crate) fn set_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub(crate) fn describe<R>(&self, f: impl FnOnce(&mut Description) -> R) -> R {
        f(&mut self.description.lock())
    }

    pub(crate) fn update(&self, node: &NodeInfo, parent: Option<InodeId>) {
        self.describe(|description| {
            description.name.clone_from(&node.name);
            description.parent = parent;
            description.handle = Some(node.handle);
            description.size = node.size;
            description.modified = node.modified;
            description.permissions = node.permissions;
        });
    }

    /// Fail unless new entries may be created below or removed from this
    /// directory.
    pub(crate) fn check_writable(&self) -> Result<(), FsError> {
        if self.removed() {
            return Err(FsError::NotFound);
        }
        match self.permissions() {
            Permissions::Full => Ok(()),
            Permissions::ReadOnly => Err(FsError::ReadOnly),
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if let Some(db) = self.db.upgrade() {
            db.forget(self.id);
        }
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = self.description.lock();
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("name", &description.name)
            .field("parent", &description.parent)
            .field("directory", &self.is_directory())
            .field("removed", &self.removed())
            .finish()
    }
}
