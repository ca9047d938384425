use tracing::{debug, info};

use super::{Database, DatabaseError, Query, Transaction};

/// One schema step.
///
/// `upgrade` moves the schema from version `n` to `n + 1` where `n` is the
/// step's index; `downgrade` reverses it. Scripts may contain several
/// statements. The version bookkeeping itself is handled by
/// [`DatabaseBuilder`]: the first upgrade must create a table
/// `version(version integer primary key)` and the last downgrade must drop it.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub upgrade: &'static str,
    pub downgrade: &'static str,
}

/// Brings a database to a requested schema version, one transaction per
/// step.
#[derive(Debug)]
pub struct DatabaseBuilder<'a> {
    database: &'a Database,
    migrations: &'a [Migration],
}

impl<'a> DatabaseBuilder<'a> {
    pub fn new(database: &'a Database, migrations: &'a [Migration]) -> Self {
        Self {
            database,
            migrations,
        }
    }

    /// Newest version the migrations describe.
    pub fn latest(&self) -> usize {
        self.migrations.len()
    }

    /// Upgrade to the newest version.
    pub async fn build(&self) -> Result<usize, DatabaseError> {
        self.upgrade(self.latest()).await
    }

    /// Current schema version; zero for an empty database.
    pub async fn version(&self) -> Result<usize, DatabaseError> {
        let mut tx = self.database.transaction().await?;
        current_version(&mut tx).await
    }

    /// Apply upgrades until the schema reaches `target`.
    ///
    /// Targets beyond [`DatabaseBuilder::latest`] are clamped. Databases
    /// already at or above the target are left alone.
    pub async fn upgrade(&self, target: usize) -> Result<usize, DatabaseError> {
        let target = target.min(self.latest());

        loop {
            let mut tx = self.database.transaction().await?;
            let current = current_version(&mut tx).await?;

            if current >= target {
                return Ok(current);
            }

            let migration = &self.migrations[current];
            debug!(from = current, to = current + 1, "upgrading database schema");

            sqlx::raw_sql(migration.upgrade)
                .execute(tx.connection())
                .await
                .map_err(|e| DatabaseError::Migration(format!("upgrade to version {} failed: {}", current + 1, e)))?;

            Query::new("insert into version (version) values (:version)")
                .param("version", (current + 1) as i64)
                .execute(&mut tx)
                .await?;

            tx.commit().await?;
            info!(version = current + 1, "database schema upgraded");
        }
    }

    /// Apply downgrades until the schema reaches `target`.
    pub async fn downgrade(&self, target: usize) -> Result<usize, DatabaseError> {
        loop {
            let mut tx = self.database.transaction().await?;
            let current = current_version(&mut tx).await?;

            if current <= target {
                return Ok(current);
            }

            let Some(migration) = self.migrations.get(current - 1) else {
                return Err(DatabaseError::Migration(format!(
                    "no migration known for schema version {}",
                    current
                )));
            };

            debug!(from = current, to = current - 1, "downgrading database schema");

            Query::new("delete from version where version = :version")
                .param("version", current as i64)
                .execute(&mut tx)
                .await?;

            sqlx::raw_sql(migration.downgrade)
                .execute(tx.connection())
                .await
                .map_err(|e| DatabaseError::Migration(format!("downgrade to version {} failed: {}", current - 1, e)))?;

            tx.commit().await?;
            info!(version = current - 1, "database schema downgraded");
        }
    }
}

async fn current_version(tx: &mut Transaction<'_>) -> Result<usize, DatabaseError> {
    let exists = Query::new("select count(*) as total from sqlite_master where type = 'table' and name = 'version'")
        .fetch_optional(tx)
        .await?
        .map(|record| record.get::<i64>("total"))
        .transpose()?
        .unwrap_or(0);

    if exists == 0 {
        return Ok(0);
    }

    let version = Query::new("select version from version order by version desc limit 1")
        .fetch_optional(tx)
        .await?
        .map(|record| record.get::<i64>("version"))
        .transpose()?
        .unwrap_or(0);

    Ok(version.max(0) as usize)
}
