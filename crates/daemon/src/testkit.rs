//! In-memory stand-ins for the cloud client and the filesystem driver.
//!
//! [`MemoryClient`] keeps a whole cloud tree in memory and records every
//! [`MountEvent`] it is sent. [`RecordingPlatform`] hands out
//! [`RecordingSession`]s that record invalidations and can be told to
//! report themselves busy a number of times before unmounting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::{Client, ClientError, NodeInfo, Permissions};
use crate::database::models::MountFlags;
use crate::fuse::{
    FileCache, FsError, InodeCacheConfig, InodeDb, InodeId, Invalidation, MountEvent, MountInodeId, NodeEvent,
    NodeHandle, Platform, Session, SessionError,
};

/// An inode database over `client` staging content in a temporary
/// directory.
pub fn inode_db(client: Arc<MemoryClient>, cache: InodeCacheConfig) -> Result<Arc<InodeDb>, FsError> {
    Ok(InodeDb::new(client, cache, FileCache::temporary()?, InodeId::synthetic(0)))
}

struct Node {
    info: NodeInfo,
    content: Vec<u8>,
}

struct Tree {
    nodes: HashMap<NodeHandle, Node>,
    next: u64,
}

impl Tree {
    fn allocate(&mut self) -> NodeHandle {
        self.next += 1;
        NodeHandle::new(self.next)
    }

    fn child(&self, parent: NodeHandle, name: &str) -> Option<&Node> {
        self.nodes
            .values()
            .find(|node| node.info.parent == Some(parent) && node.info.name == name)
    }

    fn insert(&mut self, parent: NodeHandle, name: &str, is_directory: bool, content: Vec<u8>) -> NodeInfo {
        let info = NodeInfo {
            handle: self.allocate(),
            parent: Some(parent),
            name: name.to_string(),
            is_directory,
            size: content.len() as u64,
            modified: chrono::Utc::now().timestamp(),
            permissions: Permissions::Full,
        };
        self.nodes.insert(
            info.handle,
            Node {
                info: info.clone(),
                content,
            },
        );
        info
    }

    fn remove(&mut self, handle: NodeHandle) {
        let children: Vec<NodeHandle> = self
            .nodes
            .values()
            .filter(|node| node.info.parent == Some(handle))
            .map(|node| node.info.handle)
            .collect();

        for child in children {
            self.remove(child);
        }

        self.nodes.remove(&handle);
    }
}

/// A cloud held entirely in memory.
pub struct MemoryClient {
    root: NodeHandle,
    tree: Mutex<Tree>,
    events: Mutex<Vec<MountEvent>>,
    unsyncable: Mutex<Vec<PathBuf>>,
}

impl MemoryClient {
    /// A cloud holding only an empty root directory.
    pub fn new() -> Arc<Self> {
        let root = NodeHandle::new(0x100);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                info: NodeInfo {
                    handle: root,
                    parent: None,
                    name: String::new(),
                    is_directory: true,
                    size: 0,
                    modified: 0,
                    permissions: Permissions::Full,
                },
                content: Vec::new(),
            },
        );

        Arc::new(Self {
            root,
            tree: Mutex::new(Tree {
                nodes,
                next: root.get(),
            }),
            events: Mutex::new(Vec::new()),
            unsyncable: Mutex::new(Vec::new()),
        })
    }

    pub fn root(&self) -> NodeHandle {
        self.root
    }

    pub fn add_directory(&self, parent: NodeHandle, name: &str) -> NodeHandle {
        self.tree.lock().insert(parent, name, true, Vec::new()).handle
    }

    pub fn add_file(&self, parent: NodeHandle, name: &str, content: &[u8]) -> NodeHandle {
        self.tree.lock().insert(parent, name, false, content.to_vec()).handle
    }

    pub fn content(&self, handle: NodeHandle) -> Option<Vec<u8>> {
        self.tree.lock().nodes.get(&handle).map(|node| node.content.clone())
    }

    pub fn set_permissions(&self, handle: NodeHandle, permissions: Permissions) {
        if let Some(node) = self.tree.lock().nodes.get_mut(&handle) {
            node.info.permissions = permissions;
        }
    }

    /// Replace a file's content as another device would, returning the
    /// matching event.
    pub fn modify(&self, handle: NodeHandle, content: &[u8]) -> Option<NodeEvent> {
        let mut tree = self.tree.lock();
        let node = tree.nodes.get_mut(&handle)?;
        node.content = content.to_vec();
        node.info.size = content.len() as u64;
        node.info.modified += 1;
        Some(NodeEvent::Modified(node.info.clone()))
    }

    /// Remove a node as another device would, returning the matching event.
    pub fn delete(&self, handle: NodeHandle) -> Option<NodeEvent> {
        let mut tree = self.tree.lock();
        let info = tree.nodes.get(&handle)?.info.clone();
        tree.remove(handle);
        Some(NodeEvent::Removed {
            handle,
            parent: info.parent?,
            name: info.name,
        })
    }

    /// Claim `path` for a sync so mounts may not overlap it.
    pub fn claim(&self, path: impl Into<PathBuf>) {
        self.unsyncable.lock().push(path.into());
    }

    /// Every mount event received so far.
    pub fn events(&self) -> Vec<MountEvent> {
        self.events.lock().clone()
    }
}

impl Client for MemoryClient {
    fn get(&self, handle: NodeHandle) -> Option<NodeInfo> {
        self.tree.lock().nodes.get(&handle).map(|node| node.info.clone())
    }

    fn lookup(&self, parent: NodeHandle, name: &str) -> Option<NodeInfo> {
        self.tree.lock().child(parent, name).map(|node| node.info.clone())
    }

    fn handle(&self, path: &str) -> Option<NodeHandle> {
        let tree = self.tree.lock();
        let mut current = self.root;
        for name in path.split('/').filter(|name| !name.is_empty()) {
            current = tree.child(current, name)?.info.handle;
        }
        Some(current)
    }

    fn children(&self, parent: NodeHandle) -> Result<Vec<NodeInfo>, ClientError> {
        let tree = self.tree.lock();
        if !tree.nodes.contains_key(&parent) {
            return Err(ClientError::NotFound);
        }

        let mut children: Vec<NodeInfo> = tree
            .nodes
            .values()
            .filter(|node| node.info.parent == Some(parent))
            .map(|node| node.info.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn syncable(&self, path: &Path) -> bool {
        !self
            .unsyncable
            .lock()
            .iter()
            .any(|claimed| claimed.starts_with(path) || path.starts_with(claimed))
    }

    fn make_directory(&self, parent: NodeHandle, name: &str) -> Result<NodeInfo, ClientError> {
        let mut tree = self.tree.lock();
        if !tree.nodes.contains_key(&parent) {
            return Err(ClientError::NotFound);
        }
        if tree.child(parent, name).is_some() {
            return Err(ClientError::Exists);
        }
        Ok(tree.insert(parent, name, true, Vec::new()))
    }

    fn upload(&self, parent: NodeHandle, name: &str, content: &Path) -> Result<NodeInfo, ClientError> {
        let content = std::fs::read(content)?;
        let mut tree = self.tree.lock();

        if !tree.nodes.contains_key(&parent) {
            return Err(ClientError::NotFound);
        }

        let existing = tree.child(parent, name).map(|node| node.info.handle);
        let Some(handle) = existing else {
            return Ok(tree.insert(parent, name, false, content));
        };

        let node = tree.nodes.get_mut(&handle).ok_or(ClientError::NotFound)?;
        if node.info.is_directory {
            return Err(ClientError::Exists);
        }

        node.info.size = content.len() as u64;
        node.info.modified = chrono::Utc::now().timestamp();
        node.content = content;
        Ok(node.info.clone())
    }

    fn download(&self, handle: NodeHandle, destination: &Path) -> Result<(), ClientError> {
        let content = self.content(handle).ok_or(ClientError::NotFound)?;
        std::fs::write(destination, content)?;
        Ok(())
    }

    fn move_node(&self, handle: NodeHandle, parent: NodeHandle, name: &str) -> Result<(), ClientError> {
        let mut tree = self.tree.lock();
        if !tree.nodes.contains_key(&parent) {
            return Err(ClientError::NotFound);
        }
        if tree
            .child(parent, name)
            .is_some_and(|node| node.info.handle != handle)
        {
            return Err(ClientError::Exists);
        }

        let node = tree.nodes.get_mut(&handle).ok_or(ClientError::NotFound)?;
        node.info.parent = Some(parent);
        node.info.name = name.to_string();
        Ok(())
    }

    fn remove(&self, handle: NodeHandle) -> Result<(), ClientError> {
        let mut tree = self.tree.lock();
        if !tree.nodes.contains_key(&handle) {
            return Err(ClientError::NotFound);
        }
        tree.remove(handle);
        Ok(())
    }

    fn emit_event(&self, event: MountEvent) {
        self.events.lock().push(event);
    }
}

/// Driver session that records what it is asked to do. Unmounting it a
/// second time fails.
pub struct RecordingSession {
    path: PathBuf,
    flags: MountFlags,
    invalidations: Mutex<Vec<Invalidation>>,
    busy: AtomicU32,
    attempts: AtomicU32,
    unmounted: AtomicBool,
}

impl RecordingSession {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> &MountFlags {
        &self.flags
    }

    pub fn invalidations(&self) -> Vec<Invalidation> {
        self.invalidations.lock().clone()
    }

    /// Report busy for the next `count` unmount attempts.
    pub fn set_busy(&self, count: u32) {
        self.busy.store(count, Ordering::SeqCst);
    }

    pub fn unmount_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn unmounted(&self) -> bool {
        self.unmounted.load(Ordering::SeqCst)
    }
}

impl Session for RecordingSession {
    fn invalidate_attributes(&self, id: MountInodeId) {
        self.invalidations.lock().push(Invalidation::Attributes(id));
    }

    fn invalidate_data(&self, id: MountInodeId, _range: Option<(u64, u64)>) {
        self.invalidations.lock().push(Invalidation::Data(id));
    }

    fn invalidate_entry(&self, name: &str, child: Option<MountInodeId>, parent: MountInodeId) {
        self.invalidations.lock().push(Invalidation::Entry {
            parent,
            name: name.to_string(),
            child,
        });
    }

    fn unmount(&self) -> Result<(), SessionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.unmounted.load(Ordering::SeqCst) {
            return Err(SessionError::Failed("not mounted".to_string()));
        }

        let busy = self
            .busy
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |busy| busy.checked_sub(1));
        if busy.is_ok() {
            return Err(SessionError::Busy);
        }

        self.unmounted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`RecordingSession`]s.
#[derive(Default)]
pub struct RecordingPlatform {
    sessions: Mutex<Vec<Arc<RecordingSession>>>,
    unavailable: AtomicBool,
    busy: AtomicU32,
}

impl RecordingPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse every new session as if no driver were installed.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// New sessions report busy for their first `count` unmount attempts.
    pub fn set_busy(&self, count: u32) {
        self.busy.store(count, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<Arc<RecordingSession>> {
        self.sessions.lock().clone()
    }

    /// The most recent session started at `path`.
    pub fn session(&self, path: &Path) -> Option<Arc<RecordingSession>> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|session| session.path == path)
            .cloned()
    }
}

impl Platform for RecordingPlatform {
    fn mount(&self, path: &Path, flags: &MountFlags) -> Result<Arc<dyn Session>, SessionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable);
        }

        let session = Arc::new(RecordingSession {
            path: path.to_path_buf(),
            flags: flags.clone(),
            invalidations: Mutex::new(Vec::new()),
            busy: AtomicU32::new(self.busy.load(Ordering::SeqCst)),
            attempts: AtomicU32::new(0),
            unmounted: AtomicBool::new(false),
        });

        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}
