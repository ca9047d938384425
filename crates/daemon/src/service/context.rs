use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::database::Database;
use common::sync::ActivityMonitor;
use common::task::{ExecutorConfig, TaskExecutor};
use tokio::runtime::Handle;
use tracing::info;

use super::ServiceError;
use crate::client::Client;
use crate::config::ServiceConfig;
use crate::database;
use crate::fuse::{FileCache, InodeCacheConfig, InodeDb, MountDb, Platform, Unmounter};

/// Everything a running service owns.
///
/// One instance per service; every component reaches shared state through
/// it rather than through globals.
pub struct ServiceContext {
    pub(super) config: ServiceConfig,
    pub(super) client: Arc<dyn Client>,
    pub(super) platform: Arc<dyn Platform>,
    pub(super) database: Database,
    pub(super) inodes: Arc<InodeDb>,
    pub(super) mounts: Arc<MountDb>,
    pub(super) executor: Arc<TaskExecutor>,
    pub(super) unmounter: Unmounter,
    /// Work started on behalf of callers that must finish before shutdown.
    pub(super) activities: ActivityMonitor,
    /// Serialises mount lifecycle operations.
    pub(super) lifecycle: tokio::sync::Mutex<()>,
    pub(super) terminating: AtomicBool,
    pub(super) runtime: Handle,
}

impl ServiceContext {
    /// Open the database, forget transient mounts and build the inode and
    /// mount tables.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(
        config: ServiceConfig,
        client: Arc<dyn Client>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let database = database::open(config.database_path.as_deref()).await?;
        let mounts = Arc::new(MountDb::new(database.clone()));

        let pruned = mounts.prune().await?;
        let next_synthetic = mounts.next_inode_id().await?;

        let files = match &config.cache_dir {
            Some(directory) => FileCache::new(directory)?,
            None => FileCache::temporary()?,
        };

        let inodes = InodeDb::new(
            client.clone(),
            InodeCacheConfig::from(&config.inode_cache),
            files,
            next_synthetic,
        );

        let executor = Arc::new(TaskExecutor::new(ExecutorConfig::from(&config.executor)));
        let unmounter = Unmounter::new(&executor, mounts.clone(), (&config.unmount).into());

        info!(
            database = ?config.database_path,
            pruned,
            %next_synthetic,
            "service context ready"
        );

        Ok(Self {
            config,
            client,
            platform,
            database,
            inodes,
            mounts,
            executor,
            unmounter,
            activities: ActivityMonitor::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            terminating: AtomicBool::new(false),
            runtime: Handle::current(),
        })
    }

    /* Getters */

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn inodes(&self) -> &Arc<InodeDb> {
        &self.inodes
    }

    pub fn mounts(&self) -> &Arc<MountDb> {
        &self.mounts
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn activities(&self) -> &ActivityMonitor {
        &self.activities
    }

    pub fn terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("inodes", &self.inodes)
            .field("mounts", &self.mounts)
            .field("terminating", &self.terminating())
            .finish()
    }
}
