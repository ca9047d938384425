//! Deferred work: exactly-once tasks, a time-ordered queue and a worker
//! pool that runs tasks when they fall due.

mod deferred;
mod executor;
mod queue;

pub use deferred::{Task, TaskFunction, TaskOutcome};
pub use executor::{ExecutorConfig, TaskExecutor};
pub use queue::TaskQueue;
