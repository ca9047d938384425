//! Keeps recently used inodes alive.
//!
//! Inodes are reference counted and vanish when nobody holds them. The
//! cache holds one reference per recently used inode so that repeated
//! lookups do not have to rebuild them from the cloud client. A background
//! thread periodically drops the references of entries that are old enough
//! once the cache grows beyond its size threshold.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::fuse::{InodeId, InodeRef};

/// Eviction policy of an [`InodeCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeCacheConfig {
    /// Entries used more recently than this are never evicted. Zero
    /// disables the age check.
    pub clean_age_threshold: Duration,
    /// Time between background cleaning passes.
    pub clean_interval: Duration,
    /// Cleaning stops once the cache holds at most this many entries.
    pub clean_size_threshold: usize,
}

impl Default for InodeCacheConfig {
    fn default() -> Self {
        Self {
            clean_age_threshold: Duration::from_secs(5 * 60),
            clean_interval: Duration::from_secs(5 * 60),
            clean_size_threshold: 64 * 1024,
        }
    }
}

type Key = (Instant, u64);

struct CacheState {
    order: BTreeMap<Key, InodeRef>,
    positions: HashMap<InodeId, Key>,
    sequence: u64,
    config: InodeCacheConfig,
    terminating: bool,
}

impl CacheState {
    fn key(&mut self) -> Key {
        self.sequence += 1;
        (Instant::now(), self.sequence)
    }

    /// Remove entries that may be evicted. Returned references must be
    /// dropped after the state lock is released.
    fn reduce(&mut self) -> Vec<InodeRef> {
        let size = self.config.clean_size_threshold;
        let age = self.config.clean_age_threshold;
        let now = Instant::now();

        let mut evicted = Vec::new();
        let mut remaining = self.order.len();
        let mut candidates = Vec::new();

        for (key, inode) in &self.order {
            if remaining <= size {
                break;
            }

            if !age.is_zero() && now.saturating_duration_since(key.0) < age {
                break;
            }

            // Someone else still uses the inode: evicting it would not free it.
            if Arc::strong_count(inode) > 1 {
                continue;
            }

            candidates.push(*key);
            remaining -= 1;
        }

        for key in candidates {
            if let Some(inode) = self.order.remove(&key) {
                self.positions.remove(&inode.id());
                evicted.push(inode);
            }
        }

        evicted
    }
}

struct Shared {
    state: Mutex<CacheState>,
    wakeup: Condvar,
}

/// Recency-ordered set of inode references with background eviction.
pub struct InodeCache {
    shared: Arc<Shared>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl InodeCache {
    /// Create the cache and start its cleaner thread.
    pub fn new(config: InodeCacheConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState {
                order: BTreeMap::new(),
                positions: HashMap::new(),
                sequence: 0,
                config,
                terminating: false,
            }),
            wakeup: Condvar::new(),
        });

        let cleaner = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("inode-cache".to_string())
                .spawn(move || Self::clean_loop(shared))
        };

        let cleaner = match cleaner {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(%error, "unable to start inode cache cleaner");
                None
            }
        };

        Self {
            shared,
            cleaner: Mutex::new(cleaner),
        }
    }

    /// Insert `inode` or mark it as just used.
    pub fn add(&self, inode: InodeRef) {
        let mut state = self.shared.state.lock();
        let key = state.key();

        let previous = match state.positions.insert(inode.id(), key) {
            Some(previous) => state.order.remove(&previous),
            None => None,
        };

        state.order.insert(key, inode);
        drop(state);

        drop(previous);
    }

    /// Forget `id`, returning the cache's reference to it.
    pub fn remove(&self, id: InodeId) -> Option<InodeRef> {
        let mut state = self.shared.state.lock();
        let key = state.positions.remove(&id)?;
        state.order.remove(&key)
    }

    pub fn contains(&self, id: InodeId) -> bool {
        self.shared.state.lock().positions.contains_key(&id)
    }

    /// Run one eviction pass now. Returns the number of entries evicted.
    pub fn clean(&self) -> usize {
        let evicted = self.shared.state.lock().reduce();
        let count = evicted.len();
        drop(evicted);
        count
    }

    /// Drop every reference held by the cache.
    pub fn clear(&self) {
        let order = {
            let mut state = self.shared.state.lock();
            state.positions.clear();
            std::mem::take(&mut state.order)
        };

        debug!(entries = order.len(), "inode cache cleared");
        drop(order);
    }

    pub fn config(&self) -> InodeCacheConfig {
        self.shared.state.lock().config.clone()
    }

    /// Replace the eviction policy and wake the cleaner so a shorter
    /// interval takes effect immediately.
    pub fn set_config(&self, config: InodeCacheConfig) {
        self.shared.state.lock().config = config;
        self.shared.wakeup.notify_all();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clean_loop(shared: Arc<Shared>) {
        let mut state = shared.state.lock();

        while !state.terminating {
            let interval = state.config.clean_interval;
            let timed_out = shared.wakeup.wait_for(&mut state, interval).timed_out();

            if state.terminating {
                break;
            }

            if !timed_out {
                continue;
            }

            let evicted = state.reduce();
            if !evicted.is_empty() {
                trace!(evicted = evicted.len(), remaining = state.order.len(), "inode cache cleaned");
            }

            parking_lot::MutexGuard::unlocked(&mut state, move || drop(evicted));
        }
    }
}

impl Drop for InodeCache {
    fn drop(&mut self) {
        self.shared.state.lock().terminating = true;
        self.shared.wakeup.notify_all();

        if let Some(handle) = self.cleaner.lock().take() {
            // The last inode can be released by the cleaner itself.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("inode cache cleaner panicked");
            }
        }

        self.clear();
    }
}

#[cfg(all(test, feature = "testkit"))]
mod tests {
    use super::*;
    use crate::fuse::{InodeDb, NodeHandle};
    use crate::testkit::{self, MemoryClient};

    fn config(age: Duration, size: usize) -> InodeCacheConfig {
        InodeCacheConfig {
            clean_age_threshold: age,
            clean_interval: Duration::from_secs(3600),
            clean_size_threshold: size,
        }
    }

    fn fixture(count: usize, cache: InodeCacheConfig) -> (Arc<MemoryClient>, Arc<InodeDb>, Vec<NodeHandle>) {
        let client = MemoryClient::new();
        let db = testkit::inode_db(client.clone(), cache).unwrap();
        let handles = (0..count)
            .map(|n| client.add_file(client.root(), &format!("file-{n}"), b"data"))
            .collect::<Vec<_>>();

        for handle in &handles {
            db.get_by_handle(*handle).unwrap();
        }

        (client, db, handles)
    }

    #[test]
    fn test_clean_evicts_unreferenced_inodes() {
        let (_client, db, _handles) = fixture(3, config(Duration::ZERO, 0));

        assert_eq!(db.cache().len(), 3);
        assert_eq!(db.len(), 3);

        assert_eq!(db.cache().clean(), 3);
        assert!(db.cache().is_empty());
        assert!(db.is_empty());
    }

    #[test]
    fn test_clean_skips_referenced_inodes() {
        let (_client, db, handles) = fixture(3, config(Duration::ZERO, 0));
        let held = db.get_by_handle(handles[1]).unwrap();

        assert_eq!(db.cache().clean(), 2);
        assert!(db.cache().contains(held.id()));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_clean_stops_at_size_threshold() {
        let (_client, db, handles) = fixture(5, config(Duration::ZERO, 2));

        assert_eq!(db.cache().clean(), 3);
        assert_eq!(db.cache().len(), 2);

        // Oldest entries go first.
        assert!(!db.cache().contains(InodeId::from(handles[0])));
        assert!(db.cache().contains(InodeId::from(handles[3])));
        assert!(db.cache().contains(InodeId::from(handles[4])));
    }

    #[test]
    fn test_use_moves_entry_to_back() {
        let (_client, db, handles) = fixture(3, config(Duration::ZERO, 2));

        db.get_by_handle(handles[0]).unwrap();

        assert_eq!(db.cache().clean(), 1);
        assert!(db.cache().contains(InodeId::from(handles[0])));
        assert!(!db.cache().contains(InodeId::from(handles[1])));
        assert!(db.cache().contains(InodeId::from(handles[2])));
    }

    #[test]
    fn test_recent_entries_survive() {
        let (_client, db, _handles) = fixture(4, config(Duration::from_secs(3600), 0));

        assert_eq!(db.cache().clean(), 0);
        assert_eq!(db.cache().len(), 4);
    }

    #[test]
    fn test_background_cleaner() {
        let (_client, db, _handles) = fixture(4, config(Duration::ZERO, 1));

        db.cache().set_config(InodeCacheConfig {
            clean_interval: Duration::from_millis(10),
            ..db.cache().config()
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while db.cache().len() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(db.cache().len(), 1);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_remove_returns_reference() {
        let (_client, db, handles) = fixture(1, config(Duration::ZERO, 0));
        let id = InodeId::from(handles[0]);

        let removed = db.cache().remove(id);
        assert!(removed.is_some());
        assert!(!db.cache().contains(id));
        assert!(db.in_memory(id).is_some());

        drop(removed);
        assert!(db.in_memory(id).is_none());
    }
}
