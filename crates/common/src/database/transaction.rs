use sqlx::sqlite::SqliteConnection;
use sqlx::{Acquire, Sqlite};

use super::DatabaseError;

/// An open transaction.
///
/// Nested transactions are savepoints inside their parent. Dropping a
/// transaction without calling [`Transaction::commit`] rolls it back.
pub struct Transaction<'c> {
    inner: sqlx::Transaction<'c, Sqlite>,
    depth: usize,
}

impl<'c> Transaction<'c> {
    pub(super) fn new(inner: sqlx::Transaction<'c, Sqlite>) -> Self {
        Self { inner, depth: 0 }
    }

    /// Begin a savepoint nested inside this transaction.
    pub async fn savepoint(&mut self) -> Result<Transaction<'_>, DatabaseError> {
        let depth = self.depth + 1;
        let inner = Acquire::begin(&mut self.inner).await?;
        Ok(Transaction { inner, depth })
    }

    pub async fn commit(self) -> Result<(), DatabaseError> {
        self.inner.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), DatabaseError> {
        self.inner.rollback().await?;
        Ok(())
    }

    /// The connection the transaction runs on.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.inner
    }

    /// Zero for a top-level transaction, one more for each savepoint level.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}
