//! Integration tests for the mount lifecycle
//!
//! These run the whole service against an in-memory cloud and a driver that
//! only records what it is asked to do.

#![cfg(feature = "testkit")]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cloudmount_daemon::config::ServiceConfig;
use cloudmount_daemon::fuse::{Invalidation, MountInodeId, NodeHandle, MAX_NAME_LENGTH};
use cloudmount_daemon::testkit::{MemoryClient, RecordingPlatform};
use cloudmount_daemon::{MountEventKind, MountFlags, MountInfo, MountResult, Service};

struct Harness {
    dir: TempDir,
    client: Arc<MemoryClient>,
    platform: Arc<RecordingPlatform>,
    service: Service,
    /// Cloud directory the mounts below expose.
    docs: NodeHandle,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(TempDir::new().unwrap(), ServiceConfig::default()).await
    }

    async fn with_config(dir: TempDir, mut config: ServiceConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        config.unmount.backoff_millis = 1;

        let client = MemoryClient::new();
        let docs = client.add_directory(client.root(), "docs");
        let platform = RecordingPlatform::new();
        let service = Service::new(config, client.clone(), platform.clone()).await.unwrap();

        Self {
            dir,
            client,
            platform,
            service,
            docs,
        }
    }

    /// An existing local directory.
    fn local(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn info(&self, name: &str, path: &Path) -> MountInfo {
        MountInfo::new(self.docs, path, MountFlags::new(name))
    }

    /// Add and enable `name` at a fresh local directory of the same name.
    async fn enabled(&self, name: &str) -> PathBuf {
        let path = self.local(name);
        assert_eq!(self.service.add(self.info(name, &path)).await, MountResult::Success);
        assert_eq!(self.service.enable(name, false).await, MountResult::Success);
        path
    }

    fn enabled_names(&self) -> Vec<String> {
        self.service
            .context()
            .mounts()
            .active_all()
            .iter()
            .map(|mount| mount.name())
            .collect()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_enable_then_disable_forgets_mount() {
    let h = Harness::new().await;
    let path = h.local("a");

    assert_eq!(h.service.add(h.info("m", &path)).await, MountResult::Success);
    assert_eq!(h.service.enable("m", false).await, MountResult::Success);

    let session = h.platform.session(&path).unwrap();
    assert_eq!(h.service.get_all(true).await.len(), 1);
    assert!(!h.service.syncable(&path));

    assert_eq!(h.service.disable("m", false).await, MountResult::Success);

    assert!(session.unmounted());
    assert!(h.service.get("m").await.is_none());
    assert!(h.service.get_all(true).await.is_empty());
    assert!(h.service.syncable(&path));
}

#[tokio::test]
async fn test_remembered_enable_and_disable() {
    let h = Harness::new().await;
    h.enabled("m").await;
    assert_eq!(h.service.disable("m", true).await, MountResult::Success);

    assert_eq!(h.service.enable("m", true).await, MountResult::Success);
    let flags = h.service.flags("m").await.unwrap();
    assert!(flags.enable_at_startup);
    assert!(flags.persistent);

    assert_eq!(h.service.disable("m", true).await, MountResult::Success);
    let flags = h.service.flags("m").await.unwrap();
    assert!(!flags.enable_at_startup);
    assert!(flags.persistent);
    assert!(h.service.get_all(true).await.is_empty());
    assert_eq!(h.service.get_all(false).await.len(), 1);
}

#[tokio::test]
async fn test_local_paths_are_exclusive() {
    let h = Harness::new().await;
    let path = h.enabled("first").await;

    assert_eq!(h.service.enable("first", false).await, MountResult::LocalTaken);

    assert_eq!(h.service.add(h.info("same", &path)).await, MountResult::Success);
    assert_eq!(h.service.enable("same", false).await, MountResult::LocalTaken);

    let nested = path.join("nested");
    std::fs::create_dir_all(&nested).unwrap();
    assert_eq!(h.service.add(h.info("nested", &nested)).await, MountResult::Success);
    assert_eq!(h.service.enable("nested", false).await, MountResult::LocalTaken);

    assert_eq!(h.service.add(h.info("outer", h.dir.path())).await, MountResult::Success);
    assert_eq!(h.service.enable("outer", false).await, MountResult::LocalTaken);

    assert_eq!(h.enabled_names(), vec!["first"]);
}

#[tokio::test]
async fn test_names_are_unique() {
    let h = Harness::new().await;
    let path = h.local("a");
    let other = h.local("b");

    assert_eq!(h.service.add(h.info("m", &path)).await, MountResult::Success);
    assert_eq!(h.service.add(h.info("m", &other)).await, MountResult::NameTaken);
    assert_eq!(h.service.get("m").await.unwrap().path, path);
}

#[tokio::test]
async fn test_mount_validation() {
    let h = Harness::new().await;
    let path = h.local("a");
    let file = h.client.add_file(h.client.root(), "file.txt", b"x");

    let add = |info: MountInfo| {
        let service = h.service.clone();
        async move { service.add(info).await }
    };

    let mut undefined = h.info("m", &path);
    undefined.handle = NodeHandle::UNDEFINED;
    assert_eq!(add(undefined).await, MountResult::RemoteUnknown);

    assert_eq!(add(h.info("", &path)).await, MountResult::NoName);
    assert_eq!(
        add(h.info(&"n".repeat(MAX_NAME_LENGTH + 1), &path)).await,
        MountResult::NameTooLong
    );

    let mut missing = h.info("m", &path);
    missing.handle = NodeHandle::new(0xdead);
    assert_eq!(add(missing).await, MountResult::RemoteUnknown);

    let mut remote_file = h.info("m", &path);
    remote_file.handle = file;
    assert_eq!(add(remote_file).await, MountResult::RemoteFile);

    assert_eq!(add(h.info("m", Path::new(""))).await, MountResult::LocalUnknown);
    assert_eq!(
        add(h.info("m", &h.dir.path().join("missing"))).await,
        MountResult::LocalUnknown
    );

    let local_file = h.dir.path().join("plain.txt");
    std::fs::write(&local_file, b"x").unwrap();
    assert_eq!(add(h.info("m", &local_file)).await, MountResult::LocalFile);

    let synced = h.local("synced");
    h.client.claim(&synced);
    assert_eq!(add(h.info("m", &synced)).await, MountResult::LocalSyncing);

    assert_eq!(add(h.info(&"n".repeat(MAX_NAME_LENGTH), &path)).await, MountResult::Success);
    assert_eq!(h.service.get_all(false).await.len(), 1);

    assert_eq!(h.service.enable("unknown", false).await, MountResult::Unknown);
    assert_eq!(h.service.disable("unknown", false).await, MountResult::Unknown);
}

#[tokio::test]
async fn test_enable_rechecks_cloud_directory() {
    let h = Harness::new().await;
    let path = h.local("a");
    assert_eq!(h.service.add(h.info("m", &path)).await, MountResult::Success);

    h.client.delete(h.docs).unwrap();

    assert_eq!(h.service.enable("m", false).await, MountResult::RemoteUnknown);
    assert!(h.platform.sessions().is_empty());
}

#[tokio::test]
async fn test_busy_session_is_retried() {
    let h = Harness::new().await;
    h.platform.set_busy(2);
    let path = h.enabled("m").await;

    assert_eq!(h.service.disable("m", false).await, MountResult::Success);

    let session = h.platform.session(&path).unwrap();
    assert_eq!(session.unmount_attempts(), 3);
    assert!(session.unmounted());
}

#[tokio::test]
async fn test_busy_session_gives_up() {
    let mut config = ServiceConfig::default();
    config.unmount.max_attempts = 3;
    let h = Harness::with_config(TempDir::new().unwrap(), config).await;
    h.platform.set_busy(10);
    let path = h.enabled("m").await;

    assert_eq!(h.service.disable("m", false).await, MountResult::Busy);

    let session = h.platform.session(&path).unwrap();
    assert_eq!(session.unmount_attempts(), 3);
    assert!(!session.unmounted());
    assert_eq!(h.enabled_names(), vec!["m"]);
    assert!(h.service.get("m").await.is_some());
}

#[tokio::test]
async fn test_backend_unavailable() {
    let h = Harness::new().await;
    let path = h.local("a");
    h.platform.set_unavailable(true);

    assert_eq!(h.service.add(h.info("m", &path)).await, MountResult::Success);
    assert_eq!(h.service.enable("m", false).await, MountResult::BackendUnavailable);
    assert!(h.enabled_names().is_empty());

    h.platform.set_unavailable(false);
    assert_eq!(h.service.enable("m", false).await, MountResult::Success);
}

#[tokio::test]
async fn test_failed_remembered_enable_keeps_definition() {
    let h = Harness::new().await;
    let path = h.local("a");
    assert_eq!(h.service.add(h.info("m", &path)).await, MountResult::Success);
    let before = h.service.flags("m").await.unwrap();

    h.platform.set_unavailable(true);
    assert_eq!(h.service.enable("m", true).await, MountResult::BackendUnavailable);
    assert_eq!(h.service.flags("m").await.unwrap(), before);

    h.client.delete(h.docs).unwrap();
    h.platform.set_unavailable(false);
    assert_eq!(h.service.enable("m", true).await, MountResult::RemoteUnknown);
    assert_eq!(h.service.flags("m").await.unwrap(), before);
    assert!(h.enabled_names().is_empty());
}

#[tokio::test]
async fn test_remove() {
    let h = Harness::new().await;
    h.enabled("m").await;

    assert_eq!(h.service.remove("m").await, MountResult::Busy);
    assert_eq!(h.service.disable("m", true).await, MountResult::Success);
    assert_eq!(h.service.remove("m").await, MountResult::Success);
    assert_eq!(h.service.remove("m").await, MountResult::Unknown);
    assert_eq!(h.service.disable("m", false).await, MountResult::Unknown);
}

#[tokio::test]
async fn test_set_flags() {
    let h = Harness::new().await;
    h.enabled("m").await;
    let other = h.local("other");
    assert_eq!(h.service.add(h.info("taken", &other)).await, MountResult::Success);

    let mut flags = MountFlags::new("renamed");
    flags.read_only = true;
    assert_eq!(h.service.set_flags("m", flags.clone()).await, MountResult::Success);

    assert!(h.service.get("m").await.is_none());
    assert_eq!(h.service.flags("renamed").await, Some(flags));
    assert_eq!(h.enabled_names(), vec!["renamed"]);
    assert!(h.service.context().mounts().active("renamed").unwrap().flags().read_only);

    assert_eq!(
        h.service.set_flags("renamed", MountFlags::new("taken")).await,
        MountResult::NameTaken
    );
    assert_eq!(h.service.set_flags("renamed", MountFlags::new("")).await, MountResult::NoName);
    assert_eq!(
        h.service
            .set_flags("renamed", MountFlags::new("n".repeat(MAX_NAME_LENGTH + 1)))
            .await,
        MountResult::NameTooLong
    );
    assert_eq!(h.service.set_flags("missing", MountFlags::new("x")).await, MountResult::Unknown);

    assert_eq!(h.service.disable("renamed", false).await, MountResult::Success);
}

#[tokio::test]
async fn test_restore_after_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = ServiceConfig::default();
    config.database_path = Some(dir.path().join("service.db"));

    let first = Harness::with_config(dir, config.clone()).await;
    let transient = first.local("transient");
    let kept = first.local("kept");
    let idle = first.local("idle");

    assert_eq!(first.service.add(first.info("transient", &transient)).await, MountResult::Success);
    assert_eq!(first.service.add(first.info("kept", &kept)).await, MountResult::Success);
    assert_eq!(first.service.add(first.info("idle", &idle)).await, MountResult::Success);
    assert_eq!(first.service.enable("kept", true).await, MountResult::Success);
    assert_eq!(first.service.enable("idle", true).await, MountResult::Success);
    assert_eq!(first.service.disable("idle", true).await, MountResult::Success);

    let root = first.service.context().mounts().active("kept").unwrap().root().clone();
    let local = root.make_file("draft.txt").unwrap();
    drop(local);
    drop(root);

    first.service.shutdown().await;
    assert!(first.platform.session(&kept).unwrap().unmounted());

    let Harness { dir, client, .. } = first;
    let platform = RecordingPlatform::new();
    let second = Service::new(config, client, platform.clone()).await.unwrap();

    assert!(second.get("transient").await.is_none());
    assert!(second.get("idle").await.is_some());
    assert!(second.context().inodes().next_synthetic().ordinal().unwrap() >= 1);

    let restored = second.restore().await;
    assert_eq!(restored, vec![("kept".to_string(), MountResult::Success)]);
    assert!(platform.session(&kept).is_some());
    assert!(!second.syncable(&kept));

    drop(dir);
}

#[tokio::test]
async fn test_removed_cloud_directory_disables_mount() {
    let h = Harness::new().await;
    let path = h.enabled("m").await;

    let event = h.client.delete(h.docs).unwrap();
    h.service.updated(&[event]);

    let service = h.service.clone();
    assert!(eventually(|| service.context().mounts().enabled() == 0).await);
    assert!(h.platform.session(&path).unwrap().unmounted());

    // The definition survives.
    assert!(h.service.get("m").await.is_some());

    let client = h.client.clone();
    assert!(
        eventually(|| client
            .events()
            .iter()
            .any(|event| event.kind == MountEventKind::Disabled && event.result == MountResult::Success))
        .await
    );
}

#[tokio::test]
async fn test_disable_racing_cloud_removal_unmounts_once() {
    let h = Harness::new().await;
    let path = h.enabled("m").await;

    let event = h.client.delete(h.docs).unwrap();
    h.service.updated(&[event]);
    assert_eq!(h.service.disable("m", false).await, MountResult::Success);

    let context = h.service.context().clone();
    assert!(eventually(|| !context.activities().active()).await);

    let session = h.platform.session(&path).unwrap();
    assert_eq!(session.unmount_attempts(), 1);
    assert!(h.service.get("m").await.is_none());
    assert!(h.enabled_names().is_empty());

    let disabled = h
        .client
        .events()
        .into_iter()
        .filter(|event| event.kind == MountEventKind::Disabled)
        .count();
    assert_eq!(disabled, 1);
}

#[tokio::test]
async fn test_cloud_change_invalidates_pinned_inode() {
    let h = Harness::new().await;
    let file = h.client.add_file(h.docs, "a.txt", b"old");
    let path = h.enabled("m").await;

    let mount = h.service.context().mounts().active("m").unwrap();
    let entry = mount.lookup(MountInodeId::ROOT, "a.txt").unwrap();

    let event = h.client.modify(file, b"newer").unwrap();
    h.service.updated(&[event]);
    mount.flush_invalidations();

    let invalidations = h.platform.session(&path).unwrap().invalidations();
    assert!(invalidations.contains(&Invalidation::Attributes(entry.id)));
    assert!(invalidations.contains(&Invalidation::Data(entry.id)));
    assert_eq!(mount.getattr(entry.id).unwrap().size, 5);
}

#[tokio::test]
async fn test_describe_and_syncable() {
    let h = Harness::new().await;
    h.client.add_file(h.docs, "a.txt", b"abc");
    let path = h.enabled("m").await;
    let elsewhere = h.local("elsewhere");

    let info = h.service.describe(&path.join("a.txt")).unwrap();
    assert_eq!(info.name, "a.txt");
    assert_eq!(info.size, 3);
    assert!(h.service.describe(&path).unwrap().is_directory);
    assert!(h.service.describe(&path.join("missing")).is_none());
    assert!(h.service.describe(&elsewhere).is_none());

    assert!(!h.service.syncable(&path));
    assert!(!h.service.syncable(&path.join("sub")));
    assert!(!h.service.syncable(h.dir.path()));
    assert!(h.service.syncable(&elsewhere));
}

#[tokio::test]
async fn test_shutdown_aborts_later_operations() {
    let h = Harness::new().await;
    let path = h.enabled("m").await;
    let other = h.local("other");

    h.service.shutdown().await;

    assert!(h.platform.session(&path).unwrap().unmounted());
    assert!(h.enabled_names().is_empty());

    assert_eq!(h.service.add(h.info("n", &other)).await, MountResult::Aborted);
    assert_eq!(h.service.enable("m", false).await, MountResult::Aborted);
    assert_eq!(h.service.disable("m", false).await, MountResult::Aborted);
    assert_eq!(h.service.remove("m").await, MountResult::Aborted);

    // A second shutdown is a no-op.
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_and_downgrade() {
    let h = Harness::new().await;
    let path = h.dir.path().join("schema.db");

    assert_eq!(h.service.upgrade(&path, 2).await, MountResult::Success);

    let database = common::Database::open(&path).await.unwrap();
    let builder = common::DatabaseBuilder::new(&database, cloudmount_daemon::database::MIGRATIONS);
    assert_eq!(builder.version().await.unwrap(), 2);

    assert_eq!(h.service.upgrade(&path, builder.latest()).await, MountResult::Success);
    assert_eq!(builder.version().await.unwrap(), builder.latest());

    assert_eq!(h.service.downgrade(&path, 0).await, MountResult::Success);
    assert_eq!(builder.version().await.unwrap(), 0);

    database.close().await;
}

#[tokio::test]
async fn test_disable_with_callback() {
    let h = Harness::new().await;
    let path = h.enabled("m").await;

    let (sender, receiver) = flume::bounded(1);
    h.service.disable_with("m", false, move |result| {
        let _ = sender.send(result);
    });

    assert_eq!(receiver.recv_async().await.unwrap(), MountResult::Success);
    assert!(h.platform.session(&path).unwrap().unmounted());
}

#[tokio::test]
async fn test_lifecycle_events() {
    let h = Harness::new().await;
    let path = h.enabled("m").await;
    assert_eq!(h.service.disable("m", true).await, MountResult::Success);
    assert_eq!(h.service.remove("m").await, MountResult::Success);
    assert_eq!(h.service.remove("m").await, MountResult::Unknown);

    let events = h.client.events();
    let kinds: Vec<_> = events.iter().map(|event| (event.kind, event.result)).collect();
    assert_eq!(
        kinds,
        vec![
            (MountEventKind::Added, MountResult::Success),
            (MountEventKind::Enabled, MountResult::Success),
            (MountEventKind::Disabled, MountResult::Success),
            (MountEventKind::Removed, MountResult::Success),
            (MountEventKind::Removed, MountResult::Unknown),
        ]
    );
    assert!(events.iter().all(|event| event.name == "m"));
    assert_eq!(events[1].path, path);
}

#[tokio::test]
async fn test_execute_runs_on_executor() {
    let h = Harness::new().await;

    let (sender, receiver) = flume::bounded(1);
    let task = h.service.execute(move |task| {
        let _ = sender.send(task.cancelled());
    });

    assert!(!receiver.recv_async().await.unwrap());
    assert!(!task.cancelled());
}
