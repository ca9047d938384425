//! Persistent service state: mount definitions and the synthetic inode
//! counter.
//!
//! The schema is versioned; [`MIGRATIONS`] lists every step and
//! [`open`] brings a database to the newest version.

pub mod models;
pub mod mount_queries;
mod types;

use std::path::Path;

use common::database::{Database, DatabaseBuilder, DatabaseError, Migration};
use tracing::debug;

/// Schema history. Index `n` moves the schema from version `n` to `n + 1`.
pub const MIGRATIONS: &[Migration] = &[
    // 1: mounts, synthetic inode counter and version bookkeeping.
    Migration {
        upgrade: r#"
            CREATE TABLE version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE mounts (
                enable_at_startup INTEGER NOT NULL,
                id INTEGER NOT NULL,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                persistent INTEGER NOT NULL,
                read_only INTEGER NOT NULL,
                PRIMARY KEY (name)
            );

            CREATE TABLE inode_id (
                next INTEGER NOT NULL
            );

            INSERT INTO inode_id (next) VALUES (-9223372036854775807 - 1);
        "#,
        downgrade: r#"
            DROP TABLE inode_id;
            DROP TABLE mounts;
            DROP TABLE version;
        "#,
    },
    // 2: creation and modification timestamps on mounts.
    Migration {
        upgrade: r#"
            CREATE TABLE mounts_next (
                enable_at_startup INTEGER NOT NULL,
                id INTEGER NOT NULL,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                persistent INTEGER NOT NULL,
                read_only INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (name)
            );

            INSERT INTO mounts_next (enable_at_startup, id, name, path, persistent, read_only)
                SELECT enable_at_startup, id, name, path, persistent, read_only FROM mounts;

            DROP TABLE mounts;
            ALTER TABLE mounts_next RENAME TO mounts;
        "#,
        downgrade: r#"
            CREATE TABLE mounts_prev (
                enable_at_startup INTEGER NOT NULL,
                id INTEGER NOT NULL,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                persistent INTEGER NOT NULL,
                read_only INTEGER NOT NULL,
                PRIMARY KEY (name)
            );

            INSERT INTO mounts_prev (enable_at_startup, id, name, path, persistent, read_only)
                SELECT enable_at_startup, id, name, path, persistent, read_only FROM mounts;

            DROP TABLE mounts;
            ALTER TABLE mounts_prev RENAME TO mounts;
        "#,
    },
    // 3: index used when restoring mounts at startup.
    Migration {
        upgrade: r#"
            CREATE INDEX mounts_by_startup ON mounts (enable_at_startup, persistent);
        "#,
        downgrade: r#"
            DROP INDEX mounts_by_startup;
        "#,
    },
];

/// Open the service database, in memory when `path` is `None`, and bring
/// its schema up to date.
pub async fn open(path: Option<&Path>) -> Result<Database, DatabaseError> {
    let db = match path {
        Some(path) => Database::open(path).await?,
        None => Database::in_memory().await?,
    };

    let version = DatabaseBuilder::new(&db, MIGRATIONS).build().await?;
    debug!(version, "service database ready");

    Ok(db)
}
