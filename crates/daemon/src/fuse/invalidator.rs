//! Per-mount delivery of kernel invalidations.
//!
//! Invalidations are queued on a FIFO channel and issued by a dedicated
//! thread, in the order they were posted. Each queued message carries an
//! [`Activity`] so callers can wait until everything posted so far has
//! reached the driver.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use common::sync::{Activity, ActivityMonitor};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::fuse::{MountInodeId, Session};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Attributes(MountInodeId),
    Data(MountInodeId),
    Entry {
        parent: MountInodeId,
        name: String,
        child: Option<MountInodeId>,
    },
}

type Message = (Invalidation, Activity);

pub(crate) struct Invalidator {
    sender: Mutex<Option<flume::Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: ActivityMonitor,
}

impl Invalidator {
    pub(crate) fn new(name: &str, session: Arc<dyn Session>) -> Self {
        let (sender, receiver) = flume::unbounded::<Message>();

        let worker = thread::Builder::new()
            .name(format!("invalidator-{}", name))
            .spawn(move || {
                while let Ok((invalidation, _activity)) = receiver.recv() {
                    trace!(?invalidation, "issuing invalidation");
                    match invalidation {
                        Invalidation::Attributes(id) => session.invalidate_attributes(id),
                        Invalidation::Data(id) => session.invalidate_data(id, None),
                        Invalidation::Entry {
                            parent,
                            name,
                            child,
                        } => session.invalidate_entry(&name, child, parent),
                    }
                }
            });

        let worker = match worker {
            Ok(worker) => Some(worker),
            Err(error) => {
                warn!(%error, "unable to start invalidator");
                None
            }
        };

        Self {
            sender: Mutex::new(worker.as_ref().map(|_| sender)),
            worker: Mutex::new(worker),
            pending: ActivityMonitor::new(),
        }
    }

    /// Queue `invalidation` behind everything posted before it.
    pub(crate) fn post(&self, invalidation: Invalidation) {
        let activity = self.pending.begin();
        if let Some(sender) = self.sender.lock().as_ref() {
            if sender.send((invalidation, activity)).is_err() {
                warn!("invalidator has stopped");
            }
        }
    }

    /// Block until every invalidation posted so far has been issued.
    pub(crate) fn flush(&self) {
        self.pending.wait_until_idle();
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.count()
    }

    /// Issue what is queued, then stop the thread.
    pub(crate) fn stop(&self) {
        drop(self.sender.lock().take());

        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!("invalidator panicked");
            }
        }
    }
}

impl Drop for Invalidator {
    fn drop(&mut self) {
        self.stop();
    }
}
