//! Counting of in-flight work.
//!
//! An [`ActivityMonitor`] hands out [`Activity`] tokens. Each live token
//! keeps the monitor busy; once the last one is dropped, threads blocked in
//! [`ActivityMonitor::wait_until_idle`] are released. Teardown paths use this
//! to make sure no callback is still running before shared state goes away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Inner {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Inner {
    fn begin(self: &Arc<Self>) -> Activity {
        *self.count.lock() += 1;
        Activity {
            inner: self.clone(),
        }
    }
}

/// Cheaply cloneable handle; clones observe the same set of activities.
#[derive(Debug, Clone, Default)]
pub struct ActivityMonitor {
    inner: Arc<Inner>,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new unit of work.
    pub fn begin(&self) -> Activity {
        self.inner.begin()
    }

    /// Whether any activity is in flight.
    pub fn active(&self) -> bool {
        self.count() > 0
    }

    pub fn count(&self) -> usize {
        *self.inner.count.lock()
    }

    /// Block until no activities remain.
    pub fn wait_until_idle(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.idle.wait(&mut count);
        }
    }

    /// Block until no activities remain or `timeout` elapses.
    ///
    /// Returns `true` if the monitor became idle.
    pub fn wait_until_idle_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.inner.count.lock();
        while *count > 0 {
            if self.inner.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Token representing one unit of in-flight work.
#[derive(Debug)]
pub struct Activity {
    inner: Arc<Inner>,
}

impl Clone for Activity {
    /// Cloning registers an additional activity with the same monitor.
    fn clone(&self) -> Self {
        self.inner.begin()
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        let mut count = self.inner.count.lock();
        *count -= 1;
        if *count == 0 {
            self.inner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_idle_monitor_does_not_block() {
        let monitor = ActivityMonitor::new();
        assert!(!monitor.active());
        monitor.wait_until_idle();
        assert!(monitor.wait_until_idle_for(Duration::ZERO));
    }

    #[test]
    fn test_tokens_are_counted() {
        let monitor = ActivityMonitor::new();
        let a = monitor.begin();
        let b = a.clone();
        assert_eq!(monitor.count(), 2);
        drop(a);
        assert!(monitor.active());
        drop(b);
        assert!(!monitor.active());
    }

    #[test]
    fn test_wait_until_idle_for_times_out() {
        let monitor = ActivityMonitor::new();
        let _activity = monitor.begin();
        assert!(!monitor.wait_until_idle_for(Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_returns_only_after_every_worker_finished() {
        let monitor = ActivityMonitor::new();
        let finished: Vec<Arc<AtomicBool>> =
            (0..16).map(|_| Arc::new(AtomicBool::new(false))).collect();

        let handles: Vec<_> = finished
            .iter()
            .enumerate()
            .map(|(index, flag)| {
                let activity = monitor.begin();
                let flag = flag.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5 * (index as u64 % 4)));
                    flag.store(true, Ordering::SeqCst);
                    drop(activity);
                })
            })
            .collect();

        monitor.wait_until_idle();

        assert!(finished.iter().all(|flag| flag.load(Ordering::SeqCst)));

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
