//! A live mount: one driver session exposing a cloud directory.
//!
//! The driver addresses inodes by [`MountInodeId`] and keeps referring to
//! them between calls, so every inode handed to it through `lookup`,
//! `mkdir` or `create` is pinned until the driver forgets it. Cloud changes
//! are only forwarded for inodes the driver knows about.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::sync::{ActivityMonitor, SharedMutex};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::database::models::{MountFlags, MountInfo};
use crate::fuse::invalidator::{Invalidation, Invalidator};
use crate::fuse::{
    FileHandle, FsError, InodeChange, InodeDb, InodeId, InodeIdMap, InodeInfo, InodeRef, MountInodeId, NodeHandle,
    Session, SessionError,
};

/// An inode as reported to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub id: MountInodeId,
    pub info: InodeInfo,
}

struct Pin {
    inode: InodeRef,
    count: u64,
}

pub struct Mount {
    handle: NodeHandle,
    path: PathBuf,
    flags: SharedMutex<MountFlags>,
    session: Arc<dyn Session>,
    db: Arc<InodeDb>,
    root: InodeRef,
    ids: InodeIdMap,
    pins: Mutex<HashMap<InodeId, Pin>>,
    contexts: Mutex<HashMap<u64, Arc<FileHandle>>>,
    next_context: AtomicU64,
    activities: ActivityMonitor,
    invalidator: Invalidator,
}

impl Mount {
    pub fn new(info: MountInfo, session: Arc<dyn Session>, db: Arc<InodeDb>, root: InodeRef) -> Self {
        let invalidator = Invalidator::new(info.name(), session.clone());

        Self {
            handle: info.handle,
            path: info.path,
            flags: SharedMutex::new(info.flags),
            session,
            db,
            ids: InodeIdMap::new(root.id()),
            root,
            pins: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
            activities: ActivityMonitor::new(),
            invalidator,
        }
    }

    /* Driver entry points */

    /// Resolve `name` below `parent`, pinning the result.
    pub fn lookup(&self, parent: MountInodeId, name: &str) -> Result<MountEntry, FsError> {
        let _activity = self.activities.begin();
        let child = self.inode(parent)?.child(name)?;
        Ok(self.pin(&child))
    }

    /// Current attributes of `id`, refreshed from the cloud.
    pub fn getattr(&self, id: MountInodeId) -> Result<InodeInfo, FsError> {
        let _activity = self.activities.begin();
        self.inode(id)?.refresh()
    }

    /// Entries of the directory `id`. Listing does not pin.
    pub fn readdir(&self, id: MountInodeId) -> Result<Vec<MountEntry>, FsError> {
        let _activity = self.activities.begin();
        Ok(self
            .inode(id)?
            .children()?
            .iter()
            .map(|child| MountEntry {
                id: self.ids.to_mount(child.id()),
                info: child.info(),
            })
            .collect())
    }

    pub fn mkdir(&self, parent: MountInodeId, name: &str) -> Result<MountEntry, FsError> {
        let _activity = self.activities.begin();
        self.check_writable()?;
        let directory = self.inode(parent)?.make_directory(name)?;
        Ok(self.pin(&directory))
    }

    /// Create and open a new file. Returns its entry and open context.
    pub fn create(&self, parent: MountInodeId, name: &str) -> Result<(MountEntry, u64), FsError> {
        let _activity = self.activities.begin();
        self.check_writable()?;
        let file = self.inode(parent)?.make_file(name)?;
        let context = self.register(file.open(true, false)?);
        Ok((self.pin(&file), context))
    }

    /// Open `id`, returning a context for subsequent reads and writes.
    pub fn open(&self, id: MountInodeId, writable: bool, truncate: bool) -> Result<u64, FsError> {
        let _activity = self.activities.begin();
        if writable || truncate {
            self.check_writable()?;
        }
        let handle = self.inode(id)?.open(writable, truncate)?;
        Ok(self.register(handle))
    }

    pub fn read(&self, context: u64, offset: u64, size: usize) -> Result<Vec<u8>, FsError> {
        let _activity = self.activities.begin();
        self.context(context)?.read(offset, size)
    }

    pub fn write(&self, context: u64, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let _activity = self.activities.begin();
        self.context(context)?.write(offset, data)
    }

    pub fn flush(&self, context: u64) -> Result<(), FsError> {
        let _activity = self.activities.begin();
        self.context(context)?.flush()
    }

    /// Close `context`, uploading any changes.
    pub fn release(&self, context: u64) -> Result<(), FsError> {
        let _activity = self.activities.begin();
        let handle = self
            .contexts
            .lock()
            .remove(&context)
            .ok_or(FsError::BadHandle)?;
        handle.flush()
    }

    pub fn unlink(&self, parent: MountInodeId, name: &str) -> Result<(), FsError> {
        let _activity = self.activities.begin();
        self.check_writable()?;
        self.inode(parent)?.unlink(name, |child| {
            if child.is_directory() {
                Err(FsError::IsDirectory)
            } else {
                Ok(())
            }
        })
    }

    pub fn rmdir(&self, parent: MountInodeId, name: &str) -> Result<(), FsError> {
        let _activity = self.activities.begin();
        self.check_writable()?;
        self.inode(parent)?.unlink(name, |child| {
            if child.is_directory() {
                Ok(())
            } else {
                Err(FsError::NotDirectory)
            }
        })
    }

    pub fn rename(
        &self,
        parent: MountInodeId,
        name: &str,
        new_parent: MountInodeId,
        new_name: &str,
    ) -> Result<(), FsError> {
        let _activity = self.activities.begin();
        self.check_writable()?;
        let source = self.inode(parent)?;
        let target = self.inode(new_parent)?;
        source.move_child(name, &target, new_name)
    }

    /// The driver dropped `count` references to `id`.
    pub fn forget(&self, id: MountInodeId, count: u64) {
        self.unpin(id, count);
    }

    /* Pinning */

    /// Keep `inode` alive until the driver forgets it.
    pub fn pin(&self, inode: &InodeRef) -> MountEntry {
        let id = inode.id();

        if id != self.root.id() {
            self.pins
                .lock()
                .entry(id)
                .or_insert_with(|| Pin {
                    inode: inode.clone(),
                    count: 0,
                })
                .count += 1;
        }

        MountEntry {
            id: self.ids.to_mount(id),
            info: inode.info(),
        }
    }

    pub fn unpin(&self, id: MountInodeId, count: u64) {
        let id = self.ids.to_inode(id);

        let released = {
            let mut pins = self.pins.lock();
            let remaining = match pins.get_mut(&id) {
                Some(pin) => {
                    pin.count = pin.count.saturating_sub(count);
                    pin.count
                }
                None => return,
            };
            if remaining == 0 {
                pins.remove(&id)
            } else {
                None
            }
        };

        if released.is_some() {
            trace!(%id, "inode unpinned");
        }
        drop(released);
    }

    /// Drop the pin on `id` and tell the driver to forget what it cached.
    pub fn invalidate_pin(&self, id: InodeId) {
        let released = self.pins.lock().remove(&id);
        if let Some(pin) = released {
            self.post_forget(&pin.inode);
        }
    }

    /// [`Mount::invalidate_pin`] for every pinned inode.
    pub fn invalidate_pins(&self) {
        let released: Vec<Pin> = self.pins.lock().drain().map(|(_, pin)| pin).collect();

        debug!(mount = %self.name(), pins = released.len(), "invalidating pins");

        for pin in &released {
            self.post_forget(&pin.inode);
        }
    }

    /// Block until every posted invalidation reached the driver.
    pub fn flush_invalidations(&self) {
        self.invalidator.flush();
    }

    /// Forward the cloud changes that concern inodes the driver knows.
    pub fn changed(&self, changes: &[InodeChange]) {
        let posts: Vec<Invalidation> = {
            let pins = self.pins.lock();
            let known = |id: InodeId| id == self.root.id() || pins.contains_key(&id);

            changes
                .iter()
                .filter_map(|change| match change {
                    InodeChange::Attributes(id) if known(*id) => {
                        Some(Invalidation::Attributes(self.ids.to_mount(*id)))
                    }
                    InodeChange::Data(id) if known(*id) => Some(Invalidation::Data(self.ids.to_mount(*id))),
                    InodeChange::Entry { parent, name, child } if known(*parent) => Some(Invalidation::Entry {
                        parent: self.ids.to_mount(*parent),
                        name: name.clone(),
                        child: child.filter(|child| known(*child)).map(|child| self.ids.to_mount(child)),
                    }),
                    _ => None,
                })
                .collect()
        };

        for post in posts {
            self.invalidator.post(post);
        }
    }

    /* Lifecycle */

    /// Describe the inode at `relative` below the mount's root.
    pub fn describe(&self, relative: &Path) -> Result<InodeInfo, FsError> {
        let _activity = self.activities.begin();
        let mut inode = self.root.clone();

        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str().ok_or(FsError::InvalidArgument)?;
                    inode = inode.child(name)?;
                }
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => return Err(FsError::InvalidArgument),
            }
        }

        Ok(inode.info())
    }

    /// Detach the session from the mount point.
    pub fn unmount(&self) -> Result<(), SessionError> {
        self.session.unmount()
    }

    /// Drop everything the mount holds once its session is gone.
    pub fn release_all(&self) {
        self.invalidator.stop();

        let contexts: Vec<_> = self.contexts.lock().drain().collect();
        let pins: Vec<_> = self.pins.lock().drain().collect();

        debug!(
            mount = %self.name(),
            contexts = contexts.len(),
            pins = pins.len(),
            "mount released"
        );

        drop(contexts);
        drop(pins);
    }

    /* Getters */

    pub fn name(&self) -> String {
        self.flags.lock_shared().name.clone()
    }

    pub fn flags(&self) -> MountFlags {
        self.flags.lock_shared().clone()
    }

    pub fn set_flags(&self, flags: MountFlags) {
        *self.flags.lock() = flags;
    }

    pub fn info(&self) -> MountInfo {
        MountInfo {
            handle: self.handle,
            path: self.path.clone(),
            flags: self.flags(),
        }
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &InodeRef {
        &self.root
    }

    pub fn ids(&self) -> &InodeIdMap {
        &self.ids
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Driver callbacks in progress.
    pub fn activities(&self) -> &ActivityMonitor {
        &self.activities
    }

    pub fn pinned(&self) -> usize {
        self.pins.lock().len()
    }

    pub fn open_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn pending_invalidations(&self) -> usize {
        self.invalidator.pending()
    }

    fn inode(&self, id: MountInodeId) -> Result<InodeRef, FsError> {
        let id = self.ids.to_inode(id);

        if id == self.root.id() {
            return Ok(self.root.clone());
        }

        let pinned = self.pins.lock().get(&id).map(|pin| pin.inode.clone());
        match pinned {
            Some(inode) if !inode.removed() => Ok(inode),
            Some(_) => Err(FsError::NotFound),
            None => self.db.get(id).ok_or(FsError::NotFound),
        }
    }

    fn context(&self, context: u64) -> Result<Arc<FileHandle>, FsError> {
        self.contexts
            .lock()
            .get(&context)
            .cloned()
            .ok_or(FsError::BadHandle)
    }

    fn register(&self, handle: FileHandle) -> u64 {
        let context = self.next_context.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().insert(context, Arc::new(handle));
        context
    }

    fn check_writable(&self) -> Result<(), FsError> {
        if self.flags.lock_shared().read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn post_forget(&self, inode: &InodeRef) {
        let id = self.ids.to_mount(inode.id());
        self.invalidator.post(Invalidation::Attributes(id));

        if let Some(parent) = inode.parent() {
            self.invalidator.post(Invalidation::Entry {
                parent: self.ids.to_mount(parent),
                name: inode.name(),
                child: Some(id),
            });
        }
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("name", &self.name())
            .field("handle", &self.handle)
            .field("path", &self.path)
            .field("pinned", &self.pinned())
            .finish()
    }
}

#[cfg(all(test, feature = "testkit"))]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::fuse::{InodeCacheConfig, Platform};
    use crate::testkit::{self, MemoryClient, RecordingPlatform, RecordingSession};

    struct Fixture {
        client: Arc<MemoryClient>,
        db: Arc<InodeDb>,
        session: Arc<RecordingSession>,
        mount: Mount,
    }

    impl Fixture {
        fn new(read_only: bool) -> Self {
            let client = MemoryClient::new();
            let db = testkit::inode_db(client.clone(), InodeCacheConfig::default()).unwrap();
            let platform = RecordingPlatform::new();

            let mut flags = MountFlags::new("x");
            flags.read_only = read_only;
            let info = MountInfo::new(client.root(), "/mnt/x", flags);

            let session = platform.mount(&info.path, &info.flags).unwrap();
            let recording = platform.session(&info.path).unwrap();
            let root = db.get_by_handle(client.root()).unwrap();
            let mount = Mount::new(info, session, db.clone(), root);

            Self {
                client,
                db,
                session: recording,
                mount,
            }
        }

        fn id(&self, handle: NodeHandle) -> MountInodeId {
            self.mount.ids().to_mount(self.db.id_of(handle))
        }

        fn invalidations(&self) -> Vec<Invalidation> {
            self.mount.flush_invalidations();
            self.session.invalidations()
        }
    }

    #[test]
    fn test_root_attributes() {
        let fx = Fixture::new(false);

        let info = fx.mount.getattr(MountInodeId::ROOT).unwrap();
        assert!(info.is_directory);
        assert_eq!(info.handle, Some(fx.client.root()));
        assert_eq!(fx.mount.name(), "x");
        assert_eq!(fx.mount.path(), Path::new("/mnt/x"));
    }

    #[test]
    fn test_lookup_pins_until_forgotten() {
        let fx = Fixture::new(false);
        let handle = fx.client.add_file(fx.client.root(), "a.txt", b"a");

        let entry = fx.mount.lookup(MountInodeId::ROOT, "a.txt").unwrap();
        assert_eq!(entry.id, fx.id(handle));
        assert_eq!(entry.info.size, 1);
        fx.mount.lookup(MountInodeId::ROOT, "a.txt").unwrap();
        assert_eq!(fx.mount.pinned(), 1);

        fx.db.clear();
        fx.mount.forget(entry.id, 1);
        assert_eq!(fx.mount.pinned(), 1);
        assert!(fx.db.in_memory(fx.db.id_of(handle)).is_some());

        fx.mount.forget(entry.id, 1);
        assert_eq!(fx.mount.pinned(), 0);
        assert!(fx.db.in_memory(fx.db.id_of(handle)).is_none());
    }

    #[test]
    fn test_readdir_does_not_pin() {
        let fx = Fixture::new(false);
        fx.client.add_file(fx.client.root(), "b.txt", b"b");
        fx.client.add_directory(fx.client.root(), "a");

        let entries = fx.mount.readdir(MountInodeId::ROOT).unwrap();
        let names: Vec<_> = entries.iter().map(|entry| entry.info.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b.txt"]);
        assert_eq!(fx.mount.pinned(), 0);
    }

    #[test]
    fn test_changes_forwarded_for_known_inodes() {
        let fx = Fixture::new(false);
        let known = fx.client.add_file(fx.client.root(), "a.txt", b"a");
        let unknown = fx.client.add_file(fx.client.root(), "b.txt", b"b");
        fx.mount.lookup(MountInodeId::ROOT, "a.txt").unwrap();

        let known_id = fx.db.id_of(known);
        let unknown_id = fx.db.id_of(unknown);

        fx.mount.changed(&[
            InodeChange::Attributes(known_id),
            InodeChange::Attributes(unknown_id),
            InodeChange::Data(unknown_id),
            InodeChange::Data(known_id),
            InodeChange::Entry {
                parent: fx.mount.root().id(),
                name: "b.txt".to_string(),
                child: Some(unknown_id),
            },
            InodeChange::Entry {
                parent: unknown_id,
                name: "c.txt".to_string(),
                child: None,
            },
        ]);

        assert_eq!(
            fx.invalidations(),
            vec![
                Invalidation::Attributes(fx.id(known)),
                Invalidation::Data(fx.id(known)),
                Invalidation::Entry {
                    parent: MountInodeId::ROOT,
                    name: "b.txt".to_string(),
                    child: None,
                },
            ]
        );
        assert_eq!(fx.mount.pending_invalidations(), 0);
    }

    #[test]
    fn test_invalidate_pins() {
        let fx = Fixture::new(false);
        let handle = fx.client.add_file(fx.client.root(), "a.txt", b"a");
        fx.mount.lookup(MountInodeId::ROOT, "a.txt").unwrap();

        fx.mount.invalidate_pins();

        assert_eq!(fx.mount.pinned(), 0);
        assert_eq!(
            fx.invalidations(),
            vec![
                Invalidation::Attributes(fx.id(handle)),
                Invalidation::Entry {
                    parent: MountInodeId::ROOT,
                    name: "a.txt".to_string(),
                    child: Some(fx.id(handle)),
                },
            ]
        );
    }

    #[test]
    fn test_read_only_mount() {
        let fx = Fixture::new(true);
        let handle = fx.client.add_file(fx.client.root(), "a.txt", b"a");
        let id = fx.mount.lookup(MountInodeId::ROOT, "a.txt").unwrap().id;

        assert!(matches!(fx.mount.mkdir(MountInodeId::ROOT, "d"), Err(FsError::ReadOnly)));
        assert!(matches!(fx.mount.create(MountInodeId::ROOT, "n"), Err(FsError::ReadOnly)));
        assert!(matches!(fx.mount.open(id, true, false), Err(FsError::ReadOnly)));
        assert!(matches!(fx.mount.unlink(MountInodeId::ROOT, "a.txt"), Err(FsError::ReadOnly)));
        assert!(matches!(
            fx.mount.rename(MountInodeId::ROOT, "a.txt", MountInodeId::ROOT, "b.txt"),
            Err(FsError::ReadOnly)
        ));

        let context = fx.mount.open(id, false, false).unwrap();
        assert_eq!(fx.mount.read(context, 0, 10).unwrap(), b"a");
        fx.mount.release(context).unwrap();
        assert!(fx.client.exists(handle));
    }

    #[test]
    fn test_create_write_release_uploads() {
        let fx = Fixture::new(false);

        let (entry, context) = fx.mount.create(MountInodeId::ROOT, "new.txt").unwrap();
        assert_eq!(fx.mount.pinned(), 1);
        assert_eq!(fx.mount.open_contexts(), 1);

        assert_eq!(fx.mount.write(context, 0, b"data").unwrap(), 4);
        assert_eq!(fx.mount.getattr(entry.id).unwrap().size, 4);

        fx.mount.release(context).unwrap();
        assert_eq!(fx.mount.open_contexts(), 0);

        let node = fx.client.lookup(fx.client.root(), "new.txt").unwrap();
        assert_eq!(fx.client.content(node.handle).unwrap(), b"data");

        assert!(matches!(fx.mount.release(context), Err(FsError::BadHandle)));
        assert!(matches!(fx.mount.read(context, 0, 1), Err(FsError::BadHandle)));
    }

    #[test]
    fn test_unlink_and_rmdir_check_kind() {
        let fx = Fixture::new(false);
        let file = fx.client.add_file(fx.client.root(), "a.txt", b"a");
        let directory = fx.client.add_directory(fx.client.root(), "dir");

        assert!(matches!(fx.mount.unlink(MountInodeId::ROOT, "dir"), Err(FsError::IsDirectory)));
        assert!(matches!(fx.mount.rmdir(MountInodeId::ROOT, "a.txt"), Err(FsError::NotDirectory)));

        fx.mount.unlink(MountInodeId::ROOT, "a.txt").unwrap();
        fx.mount.rmdir(MountInodeId::ROOT, "dir").unwrap();
        assert!(!fx.client.exists(file));
        assert!(!fx.client.exists(directory));
    }

    #[test]
    fn test_rename() {
        let fx = Fixture::new(false);
        let file = fx.client.add_file(fx.client.root(), "a.txt", b"a");
        let target = fx.mount.mkdir(MountInodeId::ROOT, "target").unwrap();

        fx.mount
            .rename(MountInodeId::ROOT, "a.txt", target.id, "b.txt")
            .unwrap();

        let node = fx.client.get(file).unwrap();
        assert_eq!(node.name, "b.txt");
        assert_eq!(node.parent, target.info.handle);
    }

    #[test]
    fn test_describe() {
        let fx = Fixture::new(false);
        let docs = fx.client.add_directory(fx.client.root(), "docs");
        fx.client.add_file(docs, "a.txt", b"abc");

        let info = fx.mount.describe(Path::new("docs/a.txt")).unwrap();
        assert_eq!(info.name, "a.txt");
        assert_eq!(info.size, 3);

        assert!(fx.mount.describe(Path::new("")).unwrap().is_directory);
        assert!(matches!(fx.mount.describe(Path::new("docs/missing")), Err(FsError::NotFound)));
        assert!(matches!(
            fx.mount.describe(Path::new("../docs")),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn test_release_drops_everything() {
        let fx = Fixture::new(false);
        fx.client.add_file(fx.client.root(), "a.txt", b"a");
        let id = fx.mount.lookup(MountInodeId::ROOT, "a.txt").unwrap().id;
        fx.mount.open(id, false, false).unwrap();

        fx.mount.unmount().unwrap();
        fx.mount.release_all();

        assert!(fx.session.unmounted());
        assert_eq!(fx.mount.pinned(), 0);
        assert_eq!(fx.mount.open_contexts(), 0);
    }
}
