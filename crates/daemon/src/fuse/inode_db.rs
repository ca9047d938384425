//! Process-wide index of live inodes.
//!
//! Every inode is reachable here by id for as long as somebody holds a
//! reference to it. Cloud-backed inodes are built on demand from the
//! client; local files (created but not yet flushed) are held by the index
//! itself since nothing else could bring them back.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use common::sync::SharedMutex;
use tracing::{debug, trace};

use crate::client::{Client, NodeInfo};
use crate::fuse::inode::Description;
use crate::fuse::{
    DirectoryInode, FileCache, FileInode, Inode, InodeCache, InodeCacheConfig, InodeId, InodeKind,
    InodeRef, NodeEvent, NodeHandle,
};

/// Invalidation a cloud change requires from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeChange {
    Attributes(InodeId),
    Data(InodeId),
    /// The name `name` below `parent` changed meaning. `child` is the inode
    /// it referred to, if known.
    Entry {
        parent: InodeId,
        name: String,
        child: Option<InodeId>,
    },
}

#[derive(Default)]
struct Index {
    inodes: HashMap<InodeId, Weak<Inode>>,
    /// Cloud handles produced by flushing local files.
    bindings: HashMap<NodeHandle, InodeId>,
    bound: HashMap<InodeId, NodeHandle>,
    /// Local files by parent and name.
    local: HashMap<InodeId, BTreeMap<String, InodeRef>>,
}

pub struct InodeDb {
    client: Arc<dyn Client>,
    cache: InodeCache,
    files: FileCache,
    index: SharedMutex<Index>,
    next_synthetic: AtomicU64,
}

impl InodeDb {
    /// `next_synthetic` is the first synthetic id this database may issue.
    pub fn new(
        client: Arc<dyn Client>,
        cache: InodeCacheConfig,
        files: FileCache,
        next_synthetic: InodeId,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            cache: InodeCache::new(cache),
            files,
            index: SharedMutex::default(),
            next_synthetic: AtomicU64::new(next_synthetic.ordinal().unwrap_or(0)),
        })
    }

    /// The inode `id`, loading it from the cloud if necessary.
    pub fn get(self: &Arc<Self>, id: InodeId) -> Option<InodeRef> {
        if let Some(inode) = self.in_memory(id) {
            self.cache.add(inode.clone());
            return Some(inode);
        }

        let handle = self.handle_of(id)?;
        let node = self.client.get(handle)?;
        Some(self.create_or_update(&node))
    }

    /// The inode describing the cloud node `handle`.
    pub fn get_by_handle(self: &Arc<Self>, handle: NodeHandle) -> Option<InodeRef> {
        self.get(self.id_of(handle))
    }

    /// The inode `id` if it is currently in memory.
    pub fn in_memory(&self, id: InodeId) -> Option<InodeRef> {
        // The reference may be the last one: release it outside the lock.
        let inode = self.index.lock_shared().inodes.get(&id).and_then(Weak::upgrade);
        inode.filter(|inode| !inode.removed())
    }

    /// Id of the inode describing `handle`.
    pub fn id_of(&self, handle: NodeHandle) -> InodeId {
        self.index
            .lock_shared()
            .bindings
            .get(&handle)
            .copied()
            .unwrap_or_else(|| InodeId::from(handle))
    }

    /// Cloud handle backing `id`, if any.
    pub fn handle_of(&self, id: InodeId) -> Option<NodeHandle> {
        self.index
            .lock_shared()
            .bound
            .get(&id)
            .copied()
            .or_else(|| id.handle())
    }

    /// Translate a cloud event into the kernel invalidations it requires,
    /// updating any affected inode that is in memory.
    pub fn updated(self: &Arc<Self>, event: &NodeEvent) -> Vec<InodeChange> {
        let id = self.id_of(event.handle());
        let inode = self.in_memory(id);

        trace!(%id, in_memory = inode.is_some(), ?event, "cloud node changed");

        match event {
            NodeEvent::Added(node) => {
                let Some(parent) = node.parent.map(|parent| self.id_of(parent)) else {
                    return Vec::new();
                };
                vec![
                    InodeChange::Entry {
                        parent,
                        name: node.name.clone(),
                        child: None,
                    },
                    InodeChange::Attributes(parent),
                ]
            }
            NodeEvent::Modified(node) => {
                let mut changes = vec![InodeChange::Attributes(id)];
                if let Some(inode) = &inode {
                    let parent = node.parent.map(|parent| self.id_of(parent));
                    inode.update(node, parent);
                }
                if !node.is_directory {
                    changes.push(InodeChange::Data(id));
                }
                changes
            }
            NodeEvent::Moved {
                info: node,
                from_parent,
                from_name,
            } => {
                let parent = node.parent.map(|parent| self.id_of(parent));
                if let Some(inode) = &inode {
                    inode.update(node, parent);
                }

                let mut changes = vec![InodeChange::Entry {
                    parent: self.id_of(*from_parent),
                    name: from_name.clone(),
                    child: Some(id),
                }];
                if let Some(parent) = parent {
                    changes.push(InodeChange::Entry {
                        parent,
                        name: node.name.clone(),
                        child: None,
                    });
                }
                changes.push(InodeChange::Attributes(id));
                changes
            }
            NodeEvent::Removed { parent, name, .. } => {
                if let Some(inode) = &inode {
                    inode.set_removed();
                    let cached = self.cache.remove(id);
                    drop(cached);
                }
                vec![
                    InodeChange::Entry {
                        parent: self.id_of(*parent),
                        name: name.clone(),
                        child: Some(id),
                    },
                    InodeChange::Attributes(self.id_of(*parent)),
                ]
            }
        }
    }

    /// Drop every reference held by the inode cache.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /* Getters */

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn cache(&self) -> &InodeCache {
        &self.cache
    }

    pub fn files(&self) -> &FileCache {
        &self.files
    }

    /// First synthetic id not yet issued.
    pub fn next_synthetic(&self) -> InodeId {
        InodeId::synthetic(self.next_synthetic.load(Ordering::SeqCst))
    }

    /// Number of inodes currently in memory.
    pub fn len(&self) -> usize {
        self.index
            .lock_shared()
            .inodes
            .values()
            .filter(|inode| inode.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /* Crate internals used by the inode operations */

    /// Build or refresh the inode describing `node`.
    pub(crate) fn create_or_update(self: &Arc<Self>, node: &NodeInfo) -> InodeRef {
        let id = self.id_of(node.handle);
        let parent = node.parent.map(|parent| self.id_of(parent));

        let existing = self.index.lock_shared().inodes.get(&id).and_then(Weak::upgrade);
        if let Some(inode) = existing {
            inode.update(node, parent);
            self.cache.add(inode.clone());
            return inode;
        }

        let kind = if node.is_directory {
            InodeKind::Directory(DirectoryInode::default())
        } else {
            InodeKind::File(FileInode::default())
        };

        let fresh = Arc::new(Inode::new(
            id,
            Arc::downgrade(self),
            Description::from_node(node, parent),
            kind,
        ));

        let mut index = self.index.lock();
        let raced = index.inodes.get(&id).and_then(Weak::upgrade);

        let inode = match raced {
            Some(inode) => {
                drop(index);
                drop(fresh);
                inode.update(node, parent);
                inode
            }
            None => {
                index.inodes.insert(id, Arc::downgrade(&fresh));
                drop(index);
                fresh
            }
        };

        self.cache.add(inode.clone());
        inode
    }

    /// Create a local file called `name` below `parent`.
    pub(crate) fn create_local(
        self: &Arc<Self>,
        parent: InodeId,
        name: &str,
        description: impl FnOnce(InodeId) -> Description,
    ) -> InodeRef {
        let id = InodeId::synthetic(self.next_synthetic.fetch_add(1, Ordering::SeqCst));

        let inode = Arc::new(Inode::new(
            id,
            Arc::downgrade(self),
            description(id),
            InodeKind::File(FileInode::default()),
        ));

        let mut index = self.index.lock();
        index.inodes.insert(id, Arc::downgrade(&inode));
        index
            .local
            .entry(parent)
            .or_default()
            .insert(name.to_string(), inode.clone());
        drop(index);

        debug!(%id, %parent, name, "local file created");
        inode
    }

    pub(crate) fn local_child(&self, parent: InodeId, name: &str) -> Option<InodeRef> {
        self.index
            .lock_shared()
            .local
            .get(&parent)
            .and_then(|children| children.get(name).cloned())
    }

    pub(crate) fn local_children(&self, parent: InodeId) -> Vec<InodeRef> {
        self.index
            .lock_shared()
            .local
            .get(&parent)
            .map(|children| children.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stop holding the local file `name` below `parent`.
    ///
    /// The reference is returned so it is released after the index lock.
    pub(crate) fn remove_local(&self, parent: InodeId, name: &str) -> Option<InodeRef> {
        let mut index = self.index.lock();
        let children = index.local.get_mut(&parent)?;
        let inode = children.remove(name);
        if children.is_empty() {
            index.local.remove(&parent);
        }
        inode
    }

    pub(crate) fn insert_local(&self, parent: InodeId, name: &str, inode: InodeRef) -> Option<InodeRef> {
        self.index
            .lock()
            .local
            .entry(parent)
            .or_default()
            .insert(name.to_string(), inode)
    }

    /// Record that the local file `inode` now lives in the cloud as `node`.
    pub(crate) fn bind(&self, inode: &Inode, node: &NodeInfo) -> Option<InodeRef> {
        let id = inode.id();
        let (parent, name) = inode.describe(|description| {
            description.handle = Some(node.handle);
            description.size = node.size;
            description.modified = node.modified;
            description.permissions = node.permissions;
            (description.parent, description.name.clone())
        });

        let released = parent.and_then(|parent| self.remove_local(parent, &name));

        if id.is_synthetic() || id.handle() != Some(node.handle) {
            let mut index = self.index.lock();
            if let Some(previous) = index.bound.insert(id, node.handle) {
                index.bindings.remove(&previous);
            }
            index.bindings.insert(node.handle, id);
        }

        debug!(%id, handle = %node.handle, "inode bound to cloud node");
        released
    }

    /// Erase the index entry of a dropped inode.
    pub(crate) fn forget(&self, id: InodeId) {
        let mut index = self.index.lock();
        if index
            .inodes
            .get(&id)
            .is_some_and(|inode| inode.strong_count() == 0)
        {
            index.inodes.remove(&id);
        }
    }
}

impl std::fmt::Debug for InodeDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeDb")
            .field("live", &self.len())
            .field("cached", &self.cache.len())
            .field("next_synthetic", &self.next_synthetic())
            .finish()
    }
}

#[cfg(all(test, feature = "testkit"))]
mod tests {
    use super::*;
    use crate::testkit::{self, MemoryClient};

    fn fixture() -> (Arc<MemoryClient>, Arc<InodeDb>) {
        let client = MemoryClient::new();
        let db = testkit::inode_db(client.clone(), InodeCacheConfig::default()).unwrap();
        (client, db)
    }

    #[test]
    fn test_get_loads_from_client_once() {
        let (client, db) = fixture();
        let handle = client.add_directory(client.root(), "photos");

        let first = db.get(InodeId::from(handle)).unwrap();
        let second = db.get_by_handle(handle).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "photos");
        assert!(first.is_directory());
        assert_eq!(first.parent(), Some(InodeId::from(client.root())));
        assert!(db.cache().contains(first.id()));
    }

    #[test]
    fn test_unknown_handle() {
        let (_client, db) = fixture();
        assert!(db.get(InodeId::from(NodeHandle::new(0xdead))).is_none());
        assert!(db.get(InodeId::synthetic(7)).is_none());
    }

    #[test]
    fn test_inode_forgotten_after_last_reference() {
        let (client, db) = fixture();
        let handle = client.add_file(client.root(), "a.txt", b"a");
        let id = InodeId::from(handle);

        let inode = db.get(id).unwrap();
        db.clear();
        assert_eq!(db.len(), 1);

        drop(inode);

        assert!(db.in_memory(id).is_none());
        assert!(db.is_empty());
    }

    #[test]
    fn test_removed_event_marks_inode() {
        let (client, db) = fixture();
        let handle = client.add_file(client.root(), "gone.txt", b"x");
        let inode = db.get_by_handle(handle).unwrap();

        let event = client.delete(handle).unwrap();
        let changes = db.updated(&event);

        assert!(inode.removed());
        assert!(!db.cache().contains(inode.id()));
        assert!(db.in_memory(inode.id()).is_none());
        assert!(changes.contains(&InodeChange::Entry {
            parent: InodeId::from(client.root()),
            name: "gone.txt".to_string(),
            child: Some(inode.id()),
        }));
    }

    #[test]
    fn test_modified_event_refreshes_description() {
        let (client, db) = fixture();
        let handle = client.add_file(client.root(), "notes.txt", b"old");
        let inode = db.get_by_handle(handle).unwrap();

        let event = client.modify(handle, b"much newer").unwrap();
        let changes = db.updated(&event);

        assert_eq!(inode.info().size, 10);
        assert_eq!(
            changes,
            vec![InodeChange::Attributes(inode.id()), InodeChange::Data(inode.id())]
        );
    }

    #[test]
    fn test_local_files_get_synthetic_ids() {
        let (client, db) = fixture();
        let root = db.get_by_handle(client.root()).unwrap();

        let first = root.make_file("one.txt").unwrap();
        let second = root.make_file("two.txt").unwrap();

        assert!(first.id().is_synthetic());
        assert_ne!(first.id(), second.id());
        assert_eq!(first.handle(), None);
        assert_eq!(db.next_synthetic(), InodeId::synthetic(2));
        assert_eq!(db.local_children(root.id()).len(), 2);
    }
}
