//! Reader/writer lock with timed acquisition.
//!
//! Any number of threads may hold the lock shared, or exactly one thread may
//! hold it exclusively. State is a single signed counter: positive values
//! count readers, `-1` marks a writer and `0` means free. When a writer
//! releases, a waiting writer is woken before readers are re-checked.
//!
//! Debug builds additionally track which thread holds the lock and panic
//! when a thread tries to acquire it in a way that would deadlock on itself
//! (exclusive after shared or exclusive, shared after exclusive).

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct State {
    count: isize,
    writers_waiting: usize,
}

pub struct SharedMutex<T: ?Sized> {
    state: Mutex<State>,
    readers: Condvar,
    writers: Condvar,
    #[cfg(debug_assertions)]
    holders: ownership::Holders,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is mediated by the counter in `state`, giving
// the same guarantees as `std::sync::RwLock`.
unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(State::default()),
            readers: Condvar::new(),
            writers: Condvar::new(),
            #[cfg(debug_assertions)]
            holders: ownership::Holders::default(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    /// Acquire the lock exclusively, blocking until it is free.
    pub fn lock(&self) -> ExclusiveGuard<'_, T> {
        self.acquire_exclusive(None);
        ExclusiveGuard::new(self)
    }

    /// Acquire the lock shared, blocking while a writer holds it.
    pub fn lock_shared(&self) -> SharedGuard<'_, T> {
        self.acquire_shared(None);
        SharedGuard::new(self)
    }

    pub fn try_lock(&self) -> Option<ExclusiveGuard<'_, T>> {
        self.try_lock_until(Instant::now())
    }

    pub fn try_lock_shared(&self) -> Option<SharedGuard<'_, T>> {
        self.try_lock_shared_until(Instant::now())
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<ExclusiveGuard<'_, T>> {
        self.try_lock_until(Instant::now() + timeout)
    }

    pub fn try_lock_shared_for(&self, timeout: Duration) -> Option<SharedGuard<'_, T>> {
        self.try_lock_shared_until(Instant::now() + timeout)
    }

    pub fn try_lock_until(&self, deadline: Instant) -> Option<ExclusiveGuard<'_, T>> {
        self.acquire_exclusive(Some(deadline))
            .then(|| ExclusiveGuard::new(self))
    }

    pub fn try_lock_shared_until(&self, deadline: Instant) -> Option<SharedGuard<'_, T>> {
        self.acquire_shared(Some(deadline))
            .then(|| SharedGuard::new(self))
    }

    /// Mutable access without locking; the borrow checker proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn acquire_exclusive(&self, deadline: Option<Instant>) -> bool {
        #[cfg(debug_assertions)]
        self.holders.check_exclusive();

        let mut state = self.state.lock();

        if state.count != 0 {
            state.writers_waiting += 1;

            while state.count != 0 {
                match deadline {
                    None => self.writers.wait(&mut state),
                    Some(deadline) => {
                        if self.writers.wait_until(&mut state, deadline).timed_out()
                            && state.count != 0
                        {
                            state.writers_waiting -= 1;
                            return false;
                        }
                    }
                }
            }

            state.writers_waiting -= 1;
        }

        state.count = -1;

        #[cfg(debug_assertions)]
        self.holders.acquired(true);

        true
    }

    fn acquire_shared(&self, deadline: Option<Instant>) -> bool {
        #[cfg(debug_assertions)]
        self.holders.check_shared();

        let mut state = self.state.lock();

        while state.count < 0 {
            match deadline {
                None => self.readers.wait(&mut state),
                Some(deadline) => {
                    if self.readers.wait_until(&mut state, deadline).timed_out()
                        && state.count < 0
                    {
                        return false;
                    }
                }
            }
        }

        state.count += 1;

        #[cfg(debug_assertions)]
        self.holders.acquired(false);

        true
    }

    fn release_exclusive(&self) {
        #[cfg(debug_assertions)]
        self.holders.released(true);

        let mut state = self.state.lock();

        debug_assert_eq!(state.count, -1, "exclusive release of a lock not held exclusively");

        state.count = 0;

        if state.writers_waiting > 0 {
            self.writers.notify_one();
        }

        self.readers.notify_all();
    }

    fn release_shared(&self) {
        #[cfg(debug_assertions)]
        self.holders.released(false);

        let mut state = self.state.lock();

        debug_assert!(state.count > 0, "shared release of a lock not held shared");

        state.count -= 1;

        if state.count == 0 && state.writers_waiting > 0 {
            self.writers.notify_one();
        }
    }
}

impl<T: Default> Default for SharedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for SharedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SharedMutex")
            .field("count", &state.count)
            .field("writers_waiting", &state.writers_waiting)
            .finish_non_exhaustive()
    }
}

/// Shared access to the value inside a [`SharedMutex`].
///
/// Guards are tied to the acquiring thread.
pub struct SharedGuard<'a, T: ?Sized> {
    mutex: &'a SharedMutex<T>,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> SharedGuard<'a, T> {
    fn new(mutex: &'a SharedMutex<T>) -> Self {
        Self {
            mutex,
            _thread_bound: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for SharedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a shared guard excludes writers.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release_shared();
    }
}

/// Exclusive access to the value inside a [`SharedMutex`].
pub struct ExclusiveGuard<'a, T: ?Sized> {
    mutex: &'a SharedMutex<T>,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> ExclusiveGuard<'a, T> {
    fn new(mutex: &'a SharedMutex<T>) -> Self {
        Self {
            mutex,
            _thread_bound: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for ExclusiveGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: an exclusive guard excludes every other guard.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release_exclusive();
    }
}

#[cfg(debug_assertions)]
mod ownership {
    use std::collections::HashMap;
    use std::thread::{self, ThreadId};

    use parking_lot::Mutex;

    #[derive(Debug, Default, Clone, Copy)]
    struct Held {
        shared: usize,
        exclusive: bool,
    }

    /// Per-thread record of who holds the lock and how.
    #[derive(Debug, Default)]
    pub(super) struct Holders {
        threads: Mutex<HashMap<ThreadId, Held>>,
    }

    impl Holders {
        pub(super) fn check_exclusive(&self) {
            let threads = self.threads.lock();
            if let Some(held) = threads.get(&thread::current().id()) {
                assert!(
                    !held.exclusive,
                    "thread already holds this SharedMutex exclusively"
                );
                assert!(
                    held.shared == 0,
                    "thread holds this SharedMutex shared and asked for exclusive access"
                );
            }
        }

        pub(super) fn check_shared(&self) {
            let threads = self.threads.lock();
            if let Some(held) = threads.get(&thread::current().id()) {
                assert!(
                    !held.exclusive,
                    "thread holds this SharedMutex exclusively and asked for shared access"
                );
            }
        }

        pub(super) fn acquired(&self, exclusive: bool) {
            let mut threads = self.threads.lock();
            let held = threads.entry(thread::current().id()).or_default();
            if exclusive {
                held.exclusive = true;
            } else {
                held.shared += 1;
            }
        }

        pub(super) fn released(&self, exclusive: bool) {
            let mut threads = self.threads.lock();
            let id = thread::current().id();
            let Some(held) = threads.get_mut(&id) else {
                panic!("thread released a SharedMutex it does not hold");
            };

            if exclusive {
                assert!(held.exclusive, "unbalanced exclusive release");
                held.exclusive = false;
            } else {
                assert!(held.shared > 0, "unbalanced shared release");
                held.shared -= 1;
            }

            if !held.exclusive && held.shared == 0 {
                threads.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_readers_share_the_lock() {
        let mutex = SharedMutex::new(7);
        let a = mutex.lock_shared();
        let b = mutex.lock_shared();
        assert_eq!(*a + *b, 14);
        assert!(mutex.try_lock().is_none());
        drop(a);
        drop(b);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_writer_excludes_readers_across_threads() {
        let mutex = Arc::new(SharedMutex::new(0u32));
        let guard = mutex.lock();

        let reader = {
            let mutex = mutex.clone();
            thread::spawn(move || mutex.try_lock_shared_for(Duration::from_millis(50)).is_none())
        };
        assert!(reader.join().unwrap());

        drop(guard);

        let reader = {
            let mutex = mutex.clone();
            thread::spawn(move || mutex.try_lock_shared_for(Duration::from_millis(50)).is_some())
        };
        assert!(reader.join().unwrap());
    }

    #[test]
    fn test_try_lock_for_times_out_then_succeeds() {
        let mutex = Arc::new(SharedMutex::new(()));
        let barrier = Arc::new(Barrier::new(2));

        let holder = {
            let mutex = mutex.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let _guard = mutex.lock_shared();
                barrier.wait();
                thread::sleep(Duration::from_millis(100));
            })
        };

        barrier.wait();
        let started = Instant::now();
        assert!(mutex.try_lock_for(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));

        assert!(mutex.try_lock_for(Duration::from_secs(5)).is_some());
        holder.join().unwrap();
    }

    #[test]
    fn test_writers_are_mutually_exclusive() {
        let mutex = Arc::new(SharedMutex::new(0usize));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = mutex.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut guard = mutex.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *guard += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*mutex.lock_shared(), 1600);
    }

    #[test]
    fn test_shared_reentry_is_allowed() {
        let mutex = SharedMutex::new(String::from("x"));
        let outer = mutex.lock_shared();
        let inner = mutex.lock_shared();
        assert_eq!(*outer, *inner);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "asked for exclusive access")]
    fn test_upgrade_from_shared_panics_in_debug() {
        let mutex = SharedMutex::new(());
        let _shared = mutex.lock_shared();
        let _exclusive = mutex.lock();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "already holds this SharedMutex exclusively")]
    fn test_exclusive_reentry_panics_in_debug() {
        let mutex = SharedMutex::new(());
        let _first = mutex.lock();
        let _second = mutex.lock();
    }
}
