//! Integration tests for inode eviction under concurrent use

#![cfg(feature = "testkit")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cloudmount_daemon::fuse::{InodeCacheConfig, InodeId};
use cloudmount_daemon::testkit::{self, MemoryClient};

#[test]
fn test_eviction_never_splits_identity() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let client = MemoryClient::new();
    let db = testkit::inode_db(
        client.clone(),
        InodeCacheConfig {
            clean_age_threshold: Duration::ZERO,
            clean_interval: Duration::from_millis(1),
            clean_size_threshold: 0,
        },
    )
    .unwrap();

    let handles: Vec<_> = (0..16)
        .map(|n| client.add_file(client.root(), &format!("file-{n}"), b"x"))
        .collect();

    let stop = Arc::new(AtomicBool::new(false));

    let cleaner = {
        let db = db.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                db.cache().clean();
                thread::yield_now();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            let handles = handles.clone();
            thread::spawn(move || {
                for round in 0..200 {
                    let handle = handles[round % handles.len()];
                    let first = db.get_by_handle(handle).unwrap();
                    let second = db.get(InodeId::from(handle)).unwrap();

                    // Two lookups while holding a reference see the same inode.
                    assert!(Arc::ptr_eq(&first, &second));
                    assert_eq!(first.handle(), Some(handle));
                }
            })
        })
        .collect();

    for reader in readers {
        reader.join().unwrap();
    }

    stop.store(true, Ordering::SeqCst);
    cleaner.join().unwrap();

    db.cache().clean();
    assert!(db.cache().is_empty());
    assert!(db.is_empty());
}

#[test]
fn test_directory_listing_survives_eviction() {
    let client = MemoryClient::new();
    let db = testkit::inode_db(
        client.clone(),
        InodeCacheConfig {
            clean_age_threshold: Duration::ZERO,
            clean_interval: Duration::from_millis(1),
            clean_size_threshold: 0,
        },
    )
    .unwrap();

    for n in 0..8 {
        client.add_file(client.root(), &format!("file-{n}"), b"x");
    }

    let root = db.get_by_handle(client.root()).unwrap();
    for _ in 0..50 {
        let children = root.children().unwrap();
        assert_eq!(children.len(), 8);
        for child in &children {
            let again = db.get(child.id()).unwrap();
            assert!(Arc::ptr_eq(child, &again));
        }
    }
}
