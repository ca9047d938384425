//! Building blocks shared by the cloudmount crates: reader/writer locking,
//! activity tracking, delayed task execution and SQLite access.

pub mod database;
pub mod sync;
pub mod task;

pub use database::{Database, DatabaseBuilder, DatabaseError, Migration, Query, Transaction};
pub use sync::{Activity, ActivityMonitor, SharedMutex};
pub use task::{ExecutorConfig, Task, TaskExecutor, TaskOutcome, TaskQueue};
