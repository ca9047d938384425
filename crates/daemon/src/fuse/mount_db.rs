//! Table of enabled mounts and access to their persisted definitions.
//!
//! The in-memory table is guarded by a [`SharedMutex`] and is only ever
//! touched from synchronous code; the persistence helpers never hold it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use common::database::{Database, DatabaseError};
use common::sync::SharedMutex;
use tracing::debug;

use crate::database::models::{MountFlags, MountInfo};
use crate::database::mount_queries;
use crate::fuse::{InodeId, Mount, NodeHandle};

#[derive(Default)]
struct Active {
    by_name: HashMap<String, Arc<Mount>>,
}

pub struct MountDb {
    database: Database,
    active: SharedMutex<Active>,
}

impl MountDb {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            active: SharedMutex::default(),
        }
    }

    /* Enabled mounts */

    pub fn active(&self, name: &str) -> Option<Arc<Mount>> {
        self.active.lock_shared().by_name.get(name).cloned()
    }

    /// Every enabled mount, ordered by name.
    pub fn active_all(&self) -> Vec<Arc<Mount>> {
        let mut mounts: Vec<_> = self.active.lock_shared().by_name.values().cloned().collect();
        mounts.sort_by_key(|mount| mount.name());
        mounts
    }

    /// Enabled mounts exposing the cloud directory `handle`.
    pub fn by_handle(&self, handle: NodeHandle) -> Vec<Arc<Mount>> {
        self.active
            .lock_shared()
            .by_name
            .values()
            .filter(|mount| mount.handle() == handle)
            .cloned()
            .collect()
    }

    /// The enabled mount whose path is, contains or lies within `path`.
    pub fn overlapping(&self, path: &Path) -> Option<Arc<Mount>> {
        self.active
            .lock_shared()
            .by_name
            .values()
            .find(|mount| mount.path().starts_with(path) || path.starts_with(mount.path()))
            .cloned()
    }

    /// The enabled mount whose tree contains `path`.
    pub fn containing(&self, path: &Path) -> Option<Arc<Mount>> {
        self.active
            .lock_shared()
            .by_name
            .values()
            .find(|mount| path.starts_with(mount.path()))
            .cloned()
    }

    pub fn insert(&self, mount: Arc<Mount>) {
        let name = mount.name();
        debug!(%name, path = ?mount.path(), "mount activated");
        let previous = self.active.lock().by_name.insert(name, mount);
        drop(previous);
    }

    /// Remove `mount` from the table if it is still the one enabled under
    /// its name.
    pub fn deactivate(&self, mount: &Arc<Mount>) -> Option<Arc<Mount>> {
        let name = mount.name();
        let mut active = self.active.lock();
        let current = active
            .by_name
            .get(&name)
            .is_some_and(|current| Arc::ptr_eq(current, mount));

        if current {
            active.by_name.remove(&name)
        } else {
            None
        }
    }

    /// Re-key an enabled mount after it was renamed.
    pub fn rename(&self, name: &str, flags: MountFlags) {
        let mut active = self.active.lock();
        if let Some(mount) = active.by_name.remove(name) {
            let new_name = flags.name.clone();
            mount.set_flags(flags);
            active.by_name.insert(new_name, mount);
        }
    }

    pub fn enabled(&self) -> usize {
        self.active.lock_shared().by_name.len()
    }

    /* Persisted definitions */

    pub async fn get(&self, name: &str) -> Result<Option<MountInfo>, DatabaseError> {
        let mut tx = self.database.transaction().await?;
        let info = mount_queries::get_mount(&mut tx, name).await?;
        tx.commit().await?;
        Ok(info)
    }

    pub async fn list(&self) -> Result<Vec<MountInfo>, DatabaseError> {
        let mut tx = self.database.transaction().await?;
        let mounts = mount_queries::list_mounts(&mut tx).await?;
        tx.commit().await?;
        Ok(mounts)
    }

    pub async fn startup(&self) -> Result<Vec<MountInfo>, DatabaseError> {
        let mut tx = self.database.transaction().await?;
        let mounts = mount_queries::list_startup_mounts(&mut tx).await?;
        tx.commit().await?;
        Ok(mounts)
    }

    pub async fn create(&self, info: &MountInfo) -> Result<(), DatabaseError> {
        let mut tx = self.database.transaction().await?;
        mount_queries::create_mount(&mut tx, info).await?;
        tx.commit().await
    }

    /// Returns the number of rows changed.
    pub async fn update(&self, name: &str, flags: &MountFlags) -> Result<u64, DatabaseError> {
        let mut tx = self.database.transaction().await?;
        let changed = mount_queries::update_mount_flags(&mut tx, name, flags).await?;
        tx.commit().await?;
        Ok(changed)
    }

    /// Returns the number of rows removed.
    pub async fn delete(&self, name: &str) -> Result<u64, DatabaseError> {
        let mut tx = self.database.transaction().await?;
        let removed = mount_queries::delete_mount(&mut tx, name).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Forget every mount not marked persistent.
    pub async fn prune(&self) -> Result<u64, DatabaseError> {
        let mut tx = self.database.transaction().await?;
        let pruned = mount_queries::prune_mounts(&mut tx).await?;
        tx.commit().await?;
        Ok(pruned)
    }

    pub async fn next_inode_id(&self) -> Result<InodeId, DatabaseError> {
        let mut tx = self.database.transaction().await?;
        let next = mount_queries::get_next_inode_id(&mut tx).await?;
        tx.commit().await?;
        Ok(next)
    }

    pub async fn set_next_inode_id(&self, next: InodeId) -> Result<(), DatabaseError> {
        let mut tx = self.database.transaction().await?;
        mount_queries::set_next_inode_id(&mut tx, next).await?;
        tx.commit().await
    }

    pub fn database(&self) -> &Database {
        &self.database
    }
}

impl std::fmt::Debug for MountDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountDb")
            .field("enabled", &self.enabled())
            .finish()
    }
}
