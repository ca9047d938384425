//! Integration tests for waiting on in-flight work

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::sync::{ActivityMonitor, SharedMutex};
use common::task::{ExecutorConfig, TaskExecutor};

#[test]
fn test_wait_returns_only_after_last_activity() {
    let monitor = ActivityMonitor::new();
    let finished = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|n| {
            let activity = monitor.begin();
            let finished = finished.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5 * n));
                finished.fetch_add(1, Ordering::SeqCst);
                drop(activity);
            })
        })
        .collect();

    monitor.wait_until_idle();
    assert_eq!(finished.load(Ordering::SeqCst), 8);
    assert!(!monitor.active());

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_wait_with_timeout() {
    let monitor = ActivityMonitor::new();
    let activity = monitor.begin();

    assert!(!monitor.wait_until_idle_for(Duration::from_millis(20)));

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        drop(activity);
    });

    assert!(monitor.wait_until_idle_for(Duration::from_secs(5)));
    releaser.join().unwrap();
}

#[test]
fn test_executor_shutdown_drains_running_tasks() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let executor = TaskExecutor::new(ExecutorConfig {
        min_workers: 0,
        max_workers: 2,
        idle_time: Duration::from_secs(1),
        name: "quiescence".to_string(),
    });
    let completed = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let completed = completed.clone();
            executor.execute(move |task| {
                if task.cancelled() {
                    return;
                }
                thread::sleep(Duration::from_millis(20));
                completed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let abandoned = executor.execute_after(|_| {}, Duration::from_secs(60));

    thread::sleep(Duration::from_millis(5));
    executor.shutdown();

    // Whatever started ran to completion before shutdown returned.
    let started = tasks.iter().filter(|task| task.completed()).count();
    assert_eq!(completed.load(Ordering::SeqCst), started);
    assert!(tasks.iter().all(|task| !task.pending()));
    assert!(abandoned.cancelled());
    assert!(executor.terminating());
}

#[test]
fn test_shared_mutex_readers_and_writers() {
    let counter = Arc::new(SharedMutex::new(0usize));

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    *counter.lock() += 1;
                    let seen = *counter.lock_shared();
                    assert!(seen >= 1);
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(*counter.lock_shared(), 4000);
}
