//! Synchronisation primitives.

mod activity;
mod shared_mutex;

pub use activity::{Activity, ActivityMonitor};
pub use shared_mutex::{ExclusiveGuard, SharedGuard, SharedMutex};
