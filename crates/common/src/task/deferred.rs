use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;
const ABORTED: u8 = 3;

/// Work attached to a [`Task`].
///
/// The closure receives the task in its terminal state so it can tell
/// whether it is running because it completed or because it was cancelled.
pub type TaskFunction = Box<dyn FnOnce(&Task) + Send + 'static>;

/// Terminal state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Cancelled by its owner.
    Cancelled,
    /// Dropped by the executor or queue that held it.
    Aborted,
}

impl TaskOutcome {
    fn from_status(status: u8) -> Option<Self> {
        match status {
            COMPLETED => Some(Self::Completed),
            CANCELLED => Some(Self::Cancelled),
            ABORTED => Some(Self::Aborted),
            _ => None,
        }
    }
}

struct TaskContext {
    function: Mutex<Option<TaskFunction>>,
    status: AtomicU8,
    when: Instant,
    finished: Mutex<bool>,
    done: Condvar,
}

/// A deferred unit of work with exactly-once completion.
///
/// Cloning yields another handle to the same task. Whichever of
/// [`Task::complete`], [`Task::cancel`] or [`Task::abort`] wins the race
/// runs the closure; every later call is a no-op.
#[derive(Clone)]
pub struct Task {
    context: Arc<TaskContext>,
}

impl Task {
    /// A task due immediately.
    pub fn new<F>(function: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self::at(function, Instant::now())
    }

    /// A task due at `when`.
    pub fn at<F>(function: F, when: Instant) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self {
            context: Arc::new(TaskContext {
                function: Mutex::new(Some(Box::new(function))),
                status: AtomicU8::new(PENDING),
                when,
                finished: Mutex::new(false),
                done: Condvar::new(),
            }),
        }
    }

    /// Run the task as completed.
    pub fn complete(&self) -> bool {
        self.finish(COMPLETED)
    }

    /// Run the task as cancelled.
    pub fn cancel(&self) -> bool {
        self.finish(CANCELLED)
    }

    /// Run the task as aborted.
    pub fn abort(&self) -> bool {
        self.finish(ABORTED)
    }

    /// Block until the task reaches a terminal state and its closure returned.
    pub fn wait(&self) -> TaskOutcome {
        let mut finished = self.context.finished.lock();
        while !*finished {
            self.context.done.wait(&mut finished);
        }
        drop(finished);

        // Terminal states never change once set.
        TaskOutcome::from_status(self.context.status.load(Ordering::Acquire))
            .unwrap_or(TaskOutcome::Aborted)
    }

    /* Getters */

    pub fn when(&self) -> Instant {
        self.context.when
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        TaskOutcome::from_status(self.context.status.load(Ordering::Acquire))
    }

    /// True when the task was cancelled or aborted.
    pub fn cancelled(&self) -> bool {
        matches!(
            self.outcome(),
            Some(TaskOutcome::Cancelled | TaskOutcome::Aborted)
        )
    }

    pub fn completed(&self) -> bool {
        self.outcome() == Some(TaskOutcome::Completed)
    }

    pub fn pending(&self) -> bool {
        self.outcome().is_none()
    }

    fn finish(&self, status: u8) -> bool {
        if self
            .context
            .status
            .compare_exchange(PENDING, status, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let function = self.context.function.lock().take();

        if let Some(function) = function {
            if panic::catch_unwind(AssertUnwindSafe(|| function(self))).is_err() {
                tracing::error!(outcome = ?TaskOutcome::from_status(status), "task panicked");
            }
        }

        *self.context.finished.lock() = true;
        self.context.done.notify_all();

        true
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("when", &self.context.when)
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_complete_runs_closure_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = {
            let runs = runs.clone();
            Task::new(move |task| {
                assert!(task.completed());
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(task.complete());
        assert!(!task.complete());
        assert!(!task.cancel());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(task.wait(), TaskOutcome::Completed);
    }

    #[test]
    fn test_cancel_is_observed_by_closure() {
        let observed = Arc::new(Mutex::new(None));
        let task = {
            let observed = observed.clone();
            Task::new(move |task| *observed.lock() = Some(task.cancelled()))
        };

        assert!(task.cancel());
        assert!(!task.complete());
        assert_eq!(*observed.lock(), Some(true));
        assert_eq!(task.outcome(), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn test_racing_completion_is_exactly_once() {
        for _ in 0..50 {
            let runs = Arc::new(AtomicUsize::new(0));
            let task = {
                let runs = runs.clone();
                Task::new(move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            };

            let handles: Vec<_> = (0..4)
                .map(|index| {
                    let task = task.clone();
                    thread::spawn(move || {
                        if index % 2 == 0 {
                            task.complete()
                        } else {
                            task.cancel()
                        }
                    })
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|won| *won)
                .count();

            assert_eq!(winners, 1);
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_panicking_closure_still_finishes() {
        let task = Task::new(|_| panic!("boom"));
        assert!(task.complete());
        assert_eq!(task.wait(), TaskOutcome::Completed);
    }
}
