//! Directory operations.
//!
//! Each directory carries a [`SharedMutex`]: listing and lookup hold it
//! shared, anything that changes the set of children holds it exclusively.
//! Moves between two directories take both locks in id order.

use std::sync::Arc;

use common::sync::{ExclusiveGuard, SharedMutex};

use crate::client::Permissions;
use crate::fuse::inode::Description;
use crate::fuse::{file, FsError, Inode, InodeDb, InodeRef};

/// Longest name, in bytes, a directory entry may have.
pub const MAX_NAME_LENGTH: usize = 255;

#[derive(Debug, Default)]
pub struct DirectoryInode {
    lock: SharedMutex<()>,
}

pub(crate) fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

impl Inode {
    /// Every entry of this directory, ordered by name.
    pub fn children(&self) -> Result<Vec<InodeRef>, FsError> {
        let directory = self.directory()?;
        if self.removed() {
            return Err(FsError::NotFound);
        }

        let db = self.db()?;
        let _guard = directory.lock.lock_shared();
        self.children_unlocked(&db)
    }

    /// The entry called `name`.
    pub fn child(&self, name: &str) -> Result<InodeRef, FsError> {
        let directory = self.directory()?;
        if self.removed() {
            return Err(FsError::NotFound);
        }

        let db = self.db()?;
        let _guard = directory.lock.lock_shared();
        self.child_unlocked(&db, name).ok_or(FsError::NotFound)
    }

    pub fn has_children(&self) -> Result<bool, FsError> {
        let directory = self.directory()?;
        let db = self.db()?;
        let _guard = directory.lock.lock_shared();
        self.has_children_unlocked(&db)
    }

    /// Create a subdirectory in the cloud.
    pub fn make_directory(&self, name: &str) -> Result<InodeRef, FsError> {
        validate_name(name)?;
        let directory = self.directory()?;
        self.check_writable()?;

        let db = self.db()?;
        let handle = self.handle().ok_or(FsError::NotFound)?;

        let _guard = directory.lock.lock();

        if self.child_unlocked(&db, name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let node = db.client().make_directory(handle, name)?;
        Ok(db.create_or_update(&node))
    }

    /// Create an empty local file. It reaches the cloud when flushed.
    pub fn make_file(&self, name: &str) -> Result<InodeRef, FsError> {
        validate_name(name)?;
        let directory = self.directory()?;
        self.check_writable()?;

        let db = self.db()?;
        let _guard = directory.lock.lock();

        if self.child_unlocked(&db, name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let parent = self.id();
        let modified = file::now();
        let inode = db.create_local(parent, name, |_| Description {
            name: name.to_string(),
            parent: Some(parent),
            handle: None,
            size: 0,
            modified,
            permissions: Permissions::Full,
        });

        if let Err(error) = inode.stage_empty() {
            let released = db.remove_local(parent, name);
            inode.set_removed();
            drop(released);
            return Err(error);
        }

        Ok(inode)
    }

    /// Move the entry `name` to `new_name` below `target`, replacing a file
    /// or an empty directory already there.
    pub fn move_child(&self, name: &str, target: &Inode, new_name: &str) -> Result<(), FsError> {
        validate_name(new_name)?;
        let source_directory = self.directory()?;
        let target_directory = target.directory()?;

        if self.removed() || target.removed() {
            return Err(FsError::NotFound);
        }

        let db = self.db()?;

        let _guards = lock_pair(self, source_directory, target, target_directory);

        let source = self.child_unlocked(&db, name).ok_or(FsError::NotFound)?;

        self.check_writable()?;
        target.check_writable()?;

        if source.is_directory() {
            let mut cursor = Some(target.id());
            while let Some(id) = cursor {
                if id == source.id() {
                    return Err(FsError::InvalidArgument);
                }
                cursor = db.get(id).and_then(|ancestor| ancestor.parent());
            }
        }

        if let Some(existing) = target.child_unlocked(&db, new_name) {
            if Arc::ptr_eq(&existing, &source) {
                return Ok(());
            }

            match (source.is_directory(), existing.is_directory()) {
                (true, false) => return Err(FsError::NotDirectory),
                (false, true) => return Err(FsError::IsDirectory),
                (true, true) if existing.has_children_unlocked(&db)? => {
                    return Err(FsError::NotEmpty)
                }
                _ => {}
            }

            target.remove_child_unlocked(&db, &existing, new_name)?;
        }

        match source.handle() {
            Some(handle) => {
                let parent = target.handle().ok_or(FsError::NotFound)?;
                db.client().move_node(handle, parent, new_name)?;
            }
            None => {
                if let Some(local) = db.remove_local(self.id(), name) {
                    let displaced = db.insert_local(target.id(), new_name, local);
                    drop(displaced);
                }
            }
        }

        source.describe(|description| {
            description.name = new_name.to_string();
            description.parent = Some(target.id());
        });

        Ok(())
    }

    /// Remove the entry `name` once `predicate` accepts it. Directories must
    /// be empty.
    pub fn unlink<P>(&self, name: &str, predicate: P) -> Result<(), FsError>
    where
        P: FnOnce(&Inode) -> Result<(), FsError>,
    {
        let directory = self.directory()?;
        if self.removed() {
            return Err(FsError::NotFound);
        }

        let db = self.db()?;
        let _guard = directory.lock.lock();

        let child = self.child_unlocked(&db, name).ok_or(FsError::NotFound)?;

        if self.permissions() == Permissions::ReadOnly {
            return Err(FsError::ReadOnly);
        }

        predicate(&child)?;

        if child.is_directory() && child.has_children_unlocked(&db)? {
            return Err(FsError::NotEmpty);
        }

        self.remove_child_unlocked(&db, &child, name)
    }

    fn children_unlocked(&self, db: &Arc<InodeDb>) -> Result<Vec<InodeRef>, FsError> {
        let mut children: Vec<InodeRef> = match self.handle() {
            Some(handle) => db
                .client()
                .children(handle)?
                .iter()
                .map(|node| db.create_or_update(node))
                .collect(),
            None => Vec::new(),
        };

        children.extend(db.local_children(self.id()));
        children.retain(|child| !child.removed());
        children.sort_by_key(|child| child.name());

        Ok(children)
    }

    fn child_unlocked(&self, db: &Arc<InodeDb>, name: &str) -> Option<InodeRef> {
        if let Some(local) = db.local_child(self.id(), name) {
            return Some(local);
        }

        let node = db.client().lookup(self.handle()?, name)?;
        let child = db.create_or_update(&node);
        (!child.removed()).then_some(child)
    }

    fn has_children_unlocked(&self, db: &Arc<InodeDb>) -> Result<bool, FsError> {
        if !db.local_children(self.id()).is_empty() {
            return Ok(true);
        }

        match self.handle() {
            Some(handle) => Ok(!db.client().children(handle)?.is_empty()),
            None => Ok(false),
        }
    }

    fn remove_child_unlocked(&self, db: &Arc<InodeDb>, child: &InodeRef, name: &str) -> Result<(), FsError> {
        let released = match child.handle() {
            Some(handle) => {
                db.client().remove(handle)?;
                db.remove_local(self.id(), name)
            }
            None => db.remove_local(self.id(), name),
        };

        child.set_removed();
        let cached = db.cache().remove(child.id());

        drop(released);
        drop(cached);

        Ok(())
    }
}

/// Exclusively lock one or two directories, lowest id first.
fn lock_pair<'a>(
    a: &Inode,
    a_directory: &'a DirectoryInode,
    b: &Inode,
    b_directory: &'a DirectoryInode,
) -> (ExclusiveGuard<'a, ()>, Option<ExclusiveGuard<'a, ()>>) {
    if a.id() == b.id() {
        (a_directory.lock.lock(), None)
    } else if a.id() < b.id() {
        let first = a_directory.lock.lock();
        (first, Some(b_directory.lock.lock()))
    } else {
        let first = b_directory.lock.lock();
        (first, Some(a_directory.lock.lock()))
    }
}
