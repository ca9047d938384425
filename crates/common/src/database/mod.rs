//! SQLite access with explicit transactions, named-parameter queries and
//! versioned schema migrations.
//!
//! The pool is shared; every unit of work runs inside a [`Transaction`] so
//! that a set of changes either lands completely or not at all.

mod builder;
mod query;
mod transaction;

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::info;

pub use builder::{DatabaseBuilder, Migration};
pub use query::{Query, Record, Rows};
pub use transaction::Transaction;

/// Errors raised by the database layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Unable to open database {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("Parameter :{0} has not been bound")]
    UnboundParameter(String),

    #[error("Unable to bind parameter :{name}: {message}")]
    Bind { name: String, message: String },

    #[error("Unable to read field {name}: {source}")]
    Field {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Migration error: {0}")]
    Migration(String),
}

/// Handle to an SQLite database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl std::ops::Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    /// Open (creating if necessary) a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Open {
                path: path.to_path_buf(),
                source: sqlx::Error::Io(e),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|source| DatabaseError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        info!("Database opened at {:?}", path);
        Ok(Self { pool })
    }

    /// Create a private in-memory database.
    ///
    /// The single connection is pinned for the lifetime of the pool since
    /// the data disappears with it.
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| DatabaseError::Open {
                path: PathBuf::from(":memory:"),
                source,
            })?;

        info!("Database initialized in-memory");
        Ok(Self { pool })
    }

    /// Begin a top-level transaction.
    pub async fn transaction(&self) -> Result<Transaction<'static>, DatabaseError> {
        Ok(Transaction::new(self.pool.begin().await?))
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
