use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::{Task, TaskQueue};

/// Sizing of a [`TaskExecutor`]'s worker pool.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Workers kept alive even when idle.
    pub min_workers: usize,
    /// Upper bound on concurrently running workers.
    pub max_workers: usize,
    /// How long a surplus worker may sit idle before it retires.
    pub idle_time: Duration,
    /// Prefix for worker thread names.
    pub name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_workers: 0,
            max_workers: 4,
            idle_time: Duration::from_secs(30),
            name: "task-worker".to_string(),
        }
    }
}

struct State {
    queue: TaskQueue,
    workers: usize,
    idle: usize,
    spawned: usize,
    terminating: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
    config: ExecutorConfig,
}

/// Worker pool running [`Task`]s once they fall due.
///
/// Workers are spawned lazily up to `max_workers` and sleep until the
/// earliest queued task is due. Shutting down aborts everything that has
/// not started and joins the workers.
pub struct TaskExecutor {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskExecutor {
    pub fn new(mut config: ExecutorConfig) -> Self {
        config.max_workers = config.max_workers.max(1);
        config.min_workers = config.min_workers.min(config.max_workers);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: TaskQueue::new(),
                    workers: 0,
                    idle: 0,
                    spawned: 0,
                    terminating: false,
                }),
                wakeup: Condvar::new(),
                config,
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Run `function` as soon as a worker is free.
    pub fn execute<F>(&self, function: F) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.execute_at(function, Instant::now())
    }

    /// Run `function` once `delay` has elapsed.
    pub fn execute_after<F>(&self, function: F, delay: Duration) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.execute_at(function, Instant::now() + delay)
    }

    /// Run `function` at `when`.
    ///
    /// After shutdown the returned task has already been aborted.
    pub fn execute_at<F>(&self, function: F, when: Instant) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        let task = Task::at(function, when);
        self.submit(task.clone());
        task
    }

    /// Queue an existing task.
    pub fn submit(&self, task: Task) {
        let mut state = self.shared.state.lock();

        if state.terminating {
            drop(state);
            task.abort();
            return;
        }

        state.queue.queue(task);

        if state.idle == 0 && state.workers < self.shared.config.max_workers {
            self.spawn_worker(&mut state);
        }

        self.shared.wakeup.notify_all();
    }

    /// Abort queued tasks and join every worker.
    ///
    /// Tasks already running are allowed to finish.
    pub fn shutdown(&self) {
        let queue = {
            let mut state = self.shared.state.lock();
            if state.terminating {
                None
            } else {
                state.terminating = true;
                Some(std::mem::take(&mut state.queue))
            }
        };

        let Some(queue) = queue else {
            return;
        };

        self.shared.wakeup.notify_all();

        debug!(pending = queue.len(), "task executor shutting down");
        drop(queue);

        let handles = std::mem::take(&mut *self.handles.lock());
        let current = thread::current().id();

        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("task worker panicked");
            }
        }
    }

    /* Getters */

    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn workers(&self) -> usize {
        self.shared.state.lock().workers
    }

    pub fn terminating(&self) -> bool {
        self.shared.state.lock().terminating
    }

    fn spawn_worker(&self, state: &mut MutexGuard<'_, State>) {
        let shared = self.shared.clone();
        let name = format!("{}-{}", self.shared.config.name, state.spawned);

        match thread::Builder::new()
            .name(name)
            .spawn(move || Self::run(shared))
        {
            Ok(handle) => {
                state.workers += 1;
                state.spawned += 1;

                let mut handles = self.handles.lock();
                handles.retain(|handle| !handle.is_finished());
                handles.push(handle);
            }
            Err(error) => warn!(%error, "unable to spawn task worker"),
        }
    }

    fn run(shared: Arc<Shared>) {
        let mut state = shared.state.lock();

        loop {
            if state.terminating {
                break;
            }

            if let Some(task) = state.queue.dequeue_ready(Instant::now()) {
                MutexGuard::unlocked(&mut state, || {
                    task.complete();
                });
                continue;
            }

            state.idle += 1;

            let timed_out = match state.queue.when() {
                Some(when) => {
                    shared.wakeup.wait_until(&mut state, when);
                    false
                }
                None => shared
                    .wakeup
                    .wait_for(&mut state, shared.config.idle_time)
                    .timed_out(),
            };

            state.idle -= 1;

            if timed_out
                && state.queue.is_empty()
                && state.workers > shared.config.min_workers
            {
                break;
            }
        }

        state.workers -= 1;
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
