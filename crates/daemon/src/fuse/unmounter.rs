//! Detaches mounts on the task executor.
//!
//! An unmount first drops the mount's pins and waits for its driver
//! callbacks and pending invalidations to drain. A session that is still
//! busy is retried with a linearly growing delay. The outcome is delivered
//! on a channel; an unmount abandoned during shutdown reports
//! [`MountResult::Aborted`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use common::task::{Task, TaskExecutor};
use tracing::{debug, info, warn};

use crate::fuse::{Mount, MountDb, MountResult, SessionError};

/// Retry policy for busy sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountPolicy {
    /// Attempts made before giving up with [`MountResult::Busy`].
    pub max_attempts: u32,
    /// Delay before the second attempt; each further attempt waits one
    /// more multiple of it.
    pub backoff: Duration,
}

impl Default for UnmountPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct Unmounter {
    executor: Weak<TaskExecutor>,
    mounts: Arc<MountDb>,
    policy: UnmountPolicy,
}

struct Attempt {
    unmounter: Unmounter,
    mount: Arc<Mount>,
    sender: flume::Sender<MountResult>,
    number: u32,
}

impl Unmounter {
    pub fn new(executor: &Arc<TaskExecutor>, mounts: Arc<MountDb>, policy: UnmountPolicy) -> Self {
        Self {
            executor: Arc::downgrade(executor),
            mounts,
            policy,
        }
    }

    /// Schedule `mount` for unmounting. The receiver yields exactly one
    /// result.
    pub fn unmount(&self, mount: Arc<Mount>) -> flume::Receiver<MountResult> {
        let (sender, receiver) = flume::bounded(1);

        debug!(mount = %mount.name(), "unmount requested");

        self.schedule(
            Attempt {
                unmounter: self.clone(),
                mount,
                sender,
                number: 1,
            },
            Duration::ZERO,
        );

        receiver
    }

    pub fn policy(&self) -> &UnmountPolicy {
        &self.policy
    }

    fn schedule(&self, attempt: Attempt, delay: Duration) {
        let Some(executor) = self.executor.upgrade() else {
            let _ = attempt.sender.send(MountResult::Aborted);
            return;
        };

        executor.execute_after(move |task: &Task| attempt.run(task), delay);
    }
}

impl Attempt {
    fn run(self, task: &Task) {
        if task.cancelled() {
            debug!(mount = %self.mount.name(), "unmount abandoned");
            let _ = self.sender.send(MountResult::Aborted);
            return;
        }

        let name = self.mount.name();

        self.mount.invalidate_pins();
        self.mount.flush_invalidations();
        self.mount.activities().wait_until_idle();

        match self.mount.unmount() {
            Ok(()) => {
                let removed = self.unmounter.mounts.deactivate(&self.mount);
                self.mount.release_all();
                drop(removed);

                info!(mount = %name, attempts = self.number, "mount disabled");
                let _ = self.sender.send(MountResult::Success);
            }
            Err(SessionError::Busy) if self.number < self.unmounter.policy.max_attempts => {
                let delay = self.unmounter.policy.backoff * self.number;
                debug!(mount = %name, attempt = self.number, ?delay, "mount busy, retrying");

                let unmounter = self.unmounter.clone();
                unmounter.schedule(
                    Attempt {
                        number: self.number + 1,
                        ..self
                    },
                    delay,
                );
            }
            Err(SessionError::Busy) => {
                warn!(mount = %name, attempts = self.number, "mount still busy, giving up");
                let _ = self.sender.send(MountResult::Busy);
            }
            Err(error) => {
                warn!(mount = %name, %error, "unable to unmount");
                let _ = self.sender.send(MountResult::Failed);
            }
        }
    }
}
