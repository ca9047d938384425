//! Mount lifecycle facade.
//!
//! [`Service`] owns the [`ServiceContext`] and is what the cloud client
//! talks to: it adds, enables, disables and removes mounts, forwards cloud
//! changes to enabled mounts and shuts everything down in order.
//!
//! Lifecycle operations are serialised, so they observe each other in a
//! single total order. Every one of them reports a [`MountResult`] and
//! emits a matching [`MountEvent`] through the client.

mod context;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::database::{Database, DatabaseBuilder, DatabaseError};
use common::task::Task;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use context::ServiceContext;

use crate::client::Client;
use crate::config::ServiceConfig;
use crate::database::models::{MountFlags, MountInfo};
use crate::database::MIGRATIONS;
use crate::fuse::{
    FsError, InodeChange, InodeInfo, Mount, MountEvent, MountEventKind, MountResult, NodeEvent, Platform,
    SessionError, MAX_NAME_LENGTH,
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File cache error: {0}")]
    Cache(#[from] FsError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

#[derive(Clone)]
pub struct Service {
    context: Arc<ServiceContext>,
}

impl Service {
    pub async fn new(
        config: ServiceConfig,
        client: Arc<dyn Client>,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, ServiceError> {
        let context = ServiceContext::new(config, client, platform).await?;
        Ok(Self {
            context: Arc::new(context),
        })
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    /// Define a new mount.
    pub async fn add(&self, info: MountInfo) -> MountResult {
        let result = {
            let _lifecycle = self.context.lifecycle.lock().await;
            self.add_locked(&info).await
        };

        self.emit(MountEventKind::Added, info.name(), &info.path, result);
        result
    }

    /// Enable the mount `name`. With `remember` it is also enabled at
    /// every startup.
    pub async fn enable(&self, name: &str, remember: bool) -> MountResult {
        let (result, path) = {
            let _lifecycle = self.context.lifecycle.lock().await;
            self.enable_locked(name, remember).await
        };

        self.emit(MountEventKind::Enabled, name, &path, result);
        result
    }

    /// Disable the mount `name`.
    ///
    /// With `remember` the definition is kept and no longer enabled at
    /// startup; without it the definition is removed.
    pub async fn disable(&self, name: &str, remember: bool) -> MountResult {
        let (result, path) = {
            let _lifecycle = self.context.lifecycle.lock().await;
            self.disable_locked(name, remember).await
        };

        self.emit(MountEventKind::Disabled, name, &path, result);
        result
    }

    /// [`Service::disable`] in the background. `callback` receives the
    /// result on the client's execution context.
    pub fn disable_with<F>(&self, name: &str, remember: bool, callback: F)
    where
        F: FnOnce(MountResult) + Send + 'static,
    {
        let service = self.clone();
        let name = name.to_string();
        let activity = self.context.activities.begin();

        self.context.runtime.spawn(async move {
            let result = service.disable(&name, remember).await;

            service.context.client.execute(Box::new(move |task: &Task| {
                if task.cancelled() {
                    callback(MountResult::Aborted);
                } else {
                    callback(result);
                }
            }));

            drop(activity);
        });
    }

    /// Delete the definition of a disabled mount.
    pub async fn remove(&self, name: &str) -> MountResult {
        let (result, path) = {
            let _lifecycle = self.context.lifecycle.lock().await;
            self.remove_locked(name).await
        };

        self.emit(MountEventKind::Removed, name, &path, result);
        result
    }

    pub async fn get(&self, name: &str) -> Option<MountInfo> {
        match self.context.mounts.get(name).await {
            Ok(info) => info,
            Err(error) => {
                error!(%name, %error, "unable to read mount");
                None
            }
        }
    }

    /// Every defined mount, or only the enabled ones.
    pub async fn get_all(&self, only_enabled: bool) -> Vec<MountInfo> {
        if only_enabled {
            return self
                .context
                .mounts
                .active_all()
                .iter()
                .map(|mount| mount.info())
                .collect();
        }

        match self.context.mounts.list().await {
            Ok(mounts) => mounts,
            Err(error) => {
                error!(%error, "unable to list mounts");
                Vec::new()
            }
        }
    }

    pub async fn flags(&self, name: &str) -> Option<MountFlags> {
        self.get(name).await.map(|info| info.flags)
    }

    /// Replace the flags of `name`, renaming it if `flags.name` differs.
    pub async fn set_flags(&self, name: &str, flags: MountFlags) -> MountResult {
        let (result, path) = {
            let _lifecycle = self.context.lifecycle.lock().await;
            self.set_flags_locked(name, flags).await
        };

        self.emit(MountEventKind::Changed, name, &path, result);
        result
    }

    /// Whether `path` is free of enabled mounts, so a sync may claim it.
    pub fn syncable(&self, path: &Path) -> bool {
        self.context.mounts.overlapping(path).is_none()
    }

    /// Describe the inode at `path`, which must lie inside an enabled mount.
    pub fn describe(&self, path: &Path) -> Option<InodeInfo> {
        let mount = self.context.mounts.containing(path)?;
        let relative = path.strip_prefix(mount.path()).ok()?;

        match mount.describe(relative) {
            Ok(info) => Some(info),
            Err(error) => {
                debug!(path = ?path, %error, "unable to describe path");
                None
            }
        }
    }

    /// Run `function` on the service's task executor.
    pub fn execute<F>(&self, function: F) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.context.executor.execute(function)
    }

    /// Apply a batch of cloud changes.
    ///
    /// Enabled mounts receive the invalidations concerning inodes their
    /// driver knows about. Mounts whose cloud directory was removed are
    /// disabled.
    pub fn updated(&self, events: &[NodeEvent]) {
        let context = &self.context;

        let changes: Vec<InodeChange> = events
            .iter()
            .flat_map(|event| context.inodes.updated(event))
            .collect();

        for mount in context.mounts.active_all() {
            mount.changed(&changes);
        }

        for event in events {
            if let NodeEvent::Removed { handle, .. } = event {
                for mount in context.mounts.by_handle(*handle) {
                    self.detach(mount);
                }
            }
        }
    }

    /// Enable every mount marked for startup.
    pub async fn restore(&self) -> Vec<(String, MountResult)> {
        let mounts = match self.context.mounts.startup().await {
            Ok(mounts) => mounts,
            Err(error) => {
                error!(%error, "unable to list startup mounts");
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(mounts.len());
        for info in mounts {
            let result = self.enable(info.name(), false).await;
            if !result.is_success() {
                warn!(mount = %info.name(), %result, "unable to restore mount");
            }
            results.push((info.flags.name, result));
        }
        results
    }

    /// Bring the database at `path` to schema version `target`.
    pub async fn upgrade(&self, path: &Path, target: usize) -> MountResult {
        migrate(path, target, true).await
    }

    /// Take the database at `path` back to schema version `target`.
    pub async fn downgrade(&self, path: &Path, target: usize) -> MountResult {
        migrate(path, target, false).await
    }

    /// Disable every mount, abandon queued work and wait for work in
    /// progress, then persist the synthetic inode counter.
    pub async fn shutdown(&self) {
        let context = self.context.clone();

        {
            let _lifecycle = context.lifecycle.lock().await;
            if context.terminating.swap(true, Ordering::SeqCst) {
                return;
            }

            info!(mounts = context.mounts.enabled(), "service shutting down");

            for mount in context.mounts.active_all() {
                let name = mount.name();
                let path = mount.path().to_path_buf();

                let receiver = context.unmounter.unmount(mount.clone());
                let result = receiver.recv_async().await.unwrap_or(MountResult::Aborted);

                if !result.is_success() {
                    warn!(mount = %name, %result, "forcing mount release");
                    let removed = context.mounts.deactivate(&mount);
                    mount.release_all();
                    drop(removed);
                }

                self.emit(MountEventKind::Disabled, &name, &path, result);
            }
        }

        let blocking = context.clone();
        let drained = tokio::task::spawn_blocking(move || {
            blocking.executor.shutdown();
            blocking.activities.wait_until_idle();
        })
        .await;

        if let Err(error) = drained {
            error!(%error, "unable to drain service activities");
        }

        let next = context.inodes.next_synthetic();
        if let Err(error) = context.mounts.set_next_inode_id(next).await {
            error!(%error, "unable to persist synthetic inode counter");
        }

        context.inodes.clear();
        info!("service shut down");
    }

    async fn add_locked(&self, info: &MountInfo) -> MountResult {
        let context = &self.context;

        if context.terminating() {
            return MountResult::Aborted;
        }

        let result = self.check(info).await;
        if !result.is_success() {
            return result;
        }

        match context.mounts.get(info.name()).await {
            Ok(Some(_)) => return MountResult::NameTaken,
            Ok(None) => {}
            Err(error) => return unexpected("add", info.name(), error),
        }

        match context.mounts.create(info).await {
            Ok(()) => {
                info!(mount = %info.name(), path = ?info.path, handle = %info.handle, "mount added");
                MountResult::Success
            }
            Err(error) => unexpected("add", info.name(), error),
        }
    }

    async fn enable_locked(&self, name: &str, remember: bool) -> (MountResult, PathBuf) {
        let context = &self.context;

        if context.terminating() {
            return (MountResult::Aborted, PathBuf::new());
        }

        if let Some(mount) = context.mounts.active(name) {
            return (MountResult::LocalTaken, mount.path().to_path_buf());
        }

        let mut info = match context.mounts.get(name).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!(mount = %name, "no such mount");
                return (MountResult::Unknown, PathBuf::new());
            }
            Err(error) => return (unexpected("enable", name, error), PathBuf::new()),
        };

        let path = info.path.clone();

        let result = self.check(&info).await;
        if !result.is_success() {
            return (result, path);
        }

        if let Some(other) = context.mounts.overlapping(&info.path) {
            warn!(mount = %name, path = ?info.path, taken_by = %other.name(), "local path already taken");
            return (MountResult::LocalTaken, path);
        }

        if remember {
            info.flags.enable_at_startup = true;
            info.flags.persistent = true;
        }

        let mount = match self.activate(info).await {
            Ok(mount) => mount,
            Err(result) => return (result, path),
        };

        // The definition only changes once the mount is up.
        if remember {
            if let Err(error) = context.mounts.update(name, &mount.flags()).await {
                let removed = context.mounts.deactivate(&mount);
                if let Err(error) = mount.unmount() {
                    warn!(mount = %name, %error, "unable to unmount after failed enable");
                }
                mount.release_all();
                drop(removed);
                return (unexpected("enable", name, error), path);
            }
        }

        info!(mount = %name, ?path, "mount enabled");
        (MountResult::Success, path)
    }

    /// Start a driver session for `info` and make the mount active.
    async fn activate(&self, info: MountInfo) -> Result<Arc<Mount>, MountResult> {
        let context = self.context.clone();

        let started = tokio::task::spawn_blocking(move || {
            let Some(root) = context.inodes.get_by_handle(info.handle) else {
                return Err(MountResult::RemoteUnknown);
            };

            let session = match context.platform.mount(&info.path, &info.flags) {
                Ok(session) => session,
                Err(error) => {
                    warn!(mount = %info.name(), %error, "unable to start driver session");
                    return Err(match error {
                        SessionError::Unavailable => MountResult::BackendUnavailable,
                        SessionError::Busy | SessionError::Failed(_) => MountResult::Failed,
                    });
                }
            };

            Ok(Arc::new(Mount::new(info, session, context.inodes.clone(), root)))
        })
        .await;

        let mount = match started {
            Ok(mount) => mount?,
            Err(error) => {
                error!(%error, "mount activation did not complete");
                return Err(MountResult::Unexpected);
            }
        };

        self.context.mounts.insert(mount.clone());
        Ok(mount)
    }

    async fn disable_locked(&self, name: &str, remember: bool) -> (MountResult, PathBuf) {
        let context = &self.context;

        if context.terminating() {
            return (MountResult::Aborted, PathBuf::new());
        }

        let info = match context.mounts.get(name).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!(mount = %name, "no such mount");
                return (MountResult::Unknown, PathBuf::new());
            }
            Err(error) => return (unexpected("disable", name, error), PathBuf::new()),
        };

        let mut flags = info.flags;

        if let Some(mount) = context.mounts.active(name) {
            flags = mount.flags();

            let receiver = context.unmounter.unmount(mount);
            let result = receiver.recv_async().await.unwrap_or(MountResult::Aborted);

            if !result.is_success() {
                return (result, info.path);
            }
        }

        let persisted = if remember {
            flags.enable_at_startup = false;
            flags.persistent = true;
            context.mounts.update(name, &flags).await.map(|_| ())
        } else {
            context.mounts.delete(name).await.map(|_| ())
        };

        match persisted {
            Ok(()) => (MountResult::Success, info.path),
            Err(error) => (unexpected("disable", name, error), info.path),
        }
    }

    async fn remove_locked(&self, name: &str) -> (MountResult, PathBuf) {
        let context = &self.context;

        if context.terminating() {
            return (MountResult::Aborted, PathBuf::new());
        }

        if let Some(mount) = context.mounts.active(name) {
            return (MountResult::Busy, mount.path().to_path_buf());
        }

        let info = match context.mounts.get(name).await {
            Ok(Some(info)) => info,
            Ok(None) => return (MountResult::Unknown, PathBuf::new()),
            Err(error) => return (unexpected("remove", name, error), PathBuf::new()),
        };

        match context.mounts.delete(name).await {
            Ok(0) => (MountResult::Unknown, info.path),
            Ok(_) => {
                info!(mount = %name, "mount removed");
                (MountResult::Success, info.path)
            }
            Err(error) => (unexpected("remove", name, error), info.path),
        }
    }

    async fn set_flags_locked(&self, name: &str, flags: MountFlags) -> (MountResult, PathBuf) {
        let context = &self.context;

        if context.terminating() {
            return (MountResult::Aborted, PathBuf::new());
        }

        let info = match context.mounts.get(name).await {
            Ok(Some(info)) => info,
            Ok(None) => return (MountResult::Unknown, PathBuf::new()),
            Err(error) => return (unexpected("set flags", name, error), PathBuf::new()),
        };

        if flags.name.is_empty() {
            return (MountResult::NoName, info.path);
        }

        if flags.name.len() > MAX_NAME_LENGTH {
            return (MountResult::NameTooLong, info.path);
        }

        if flags.name != name {
            match context.mounts.get(&flags.name).await {
                Ok(Some(_)) => return (MountResult::NameTaken, info.path),
                Ok(None) => {}
                Err(error) => return (unexpected("set flags", name, error), info.path),
            }
        }

        match context.mounts.update(name, &flags).await {
            Ok(0) => (MountResult::Unknown, info.path),
            Ok(_) => {
                debug!(mount = %name, ?flags, "mount flags changed");
                context.mounts.rename(name, flags);
                (MountResult::Success, info.path)
            }
            Err(error) => (unexpected("set flags", name, error), info.path),
        }
    }

    /// Validate a mount definition against the cloud and the local
    /// filesystem.
    async fn check(&self, info: &MountInfo) -> MountResult {
        let client = self.context.client.clone();
        let info = info.clone();

        match tokio::task::spawn_blocking(move || validate(&*client, &info)).await {
            Ok(result) => result,
            Err(error) => {
                error!(%error, "mount validation did not complete");
                MountResult::Unexpected
            }
        }
    }

    /// Disable `mount` in the background after its cloud directory vanished.
    /// The definition is kept.
    ///
    /// Runs as a lifecycle operation, so it is skipped if the mount was
    /// disabled in the meantime.
    fn detach(&self, mount: Arc<Mount>) {
        let service = self.clone();
        let activity = self.context.activities.begin();

        warn!(mount = %mount.name(), "cloud directory removed, disabling mount");

        self.context.runtime.spawn(async move {
            let context = service.context.clone();
            let name = mount.name();
            let path = mount.path().to_path_buf();

            let result = {
                let _lifecycle = context.lifecycle.lock().await;

                let active = context
                    .mounts
                    .active(&name)
                    .is_some_and(|current| Arc::ptr_eq(&current, &mount));

                if context.terminating() || !active {
                    debug!(mount = %name, "mount already disabled");
                    drop(activity);
                    return;
                }

                let receiver = context.unmounter.unmount(mount);
                receiver.recv_async().await.unwrap_or(MountResult::Aborted)
            };

            service.emit(MountEventKind::Disabled, &name, &path, result);
            drop(activity);
        });
    }

    fn emit(&self, kind: MountEventKind, name: &str, path: &Path, result: MountResult) {
        self.context.client.emit_event(MountEvent {
            kind,
            name: name.to_string(),
            path: path.to_path_buf(),
            result,
        });
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("context", &self.context)
            .finish()
    }
}

fn validate(client: &dyn Client, info: &MountInfo) -> MountResult {
    if !info.handle.is_defined() {
        return MountResult::RemoteUnknown;
    }

    if info.name().is_empty() {
        return MountResult::NoName;
    }

    if info.name().len() > MAX_NAME_LENGTH {
        return MountResult::NameTooLong;
    }

    let Some(node) = client.get(info.handle) else {
        return MountResult::RemoteUnknown;
    };

    if !node.is_directory {
        return MountResult::RemoteFile;
    }

    if !client.syncable(&info.path) {
        return MountResult::LocalSyncing;
    }

    if info.path.as_os_str().is_empty() {
        return MountResult::LocalUnknown;
    }

    match std::fs::metadata(&info.path) {
        Ok(metadata) if metadata.is_dir() => MountResult::Success,
        Ok(_) => MountResult::LocalFile,
        Err(_) => MountResult::LocalUnknown,
    }
}

fn unexpected(operation: &str, name: &str, error: DatabaseError) -> MountResult {
    error!(operation, mount = %name, %error, "database failure");
    MountResult::Unexpected
}

async fn migrate(path: &Path, target: usize, upgrade: bool) -> MountResult {
    let database = match Database::open(path).await {
        Ok(database) => database,
        Err(error) => {
            error!(?path, %error, "unable to open database");
            return MountResult::Unexpected;
        }
    };

    let builder = DatabaseBuilder::new(&database, MIGRATIONS);
    let migrated = if upgrade {
        builder.upgrade(target).await
    } else {
        builder.downgrade(target).await
    };

    database.close().await;

    match migrated {
        Ok(version) => {
            info!(?path, version, "database migrated");
            MountResult::Success
        }
        Err(error) => {
            error!(?path, target, %error, "unable to migrate database");
            MountResult::Unexpected
        }
    }
}
