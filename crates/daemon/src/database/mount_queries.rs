//! Queries over the `mounts` and `inode_id` tables.
//!
//! Every function runs inside the caller's transaction so a lifecycle
//! operation can combine several of them atomically.

use std::path::PathBuf;

use common::database::{DatabaseError, Query, Record, Transaction};

use crate::database::models::{MountFlags, MountInfo};
use crate::fuse::{InodeId, NodeHandle};

const MOUNT_COLUMNS: &str = "enable_at_startup, id, name, path, persistent, read_only";

/// Look up a mount by name.
pub async fn get_mount(tx: &mut Transaction<'_>, name: &str) -> Result<Option<MountInfo>, DatabaseError> {
    let record = Query::new(format!("SELECT {} FROM mounts WHERE name = :name", MOUNT_COLUMNS))
        .param("name", name.to_string())
        .fetch_optional(tx)
        .await?;

    record.as_ref().map(row_to_mount_info).transpose()
}

/// Every mount, ordered by name.
pub async fn list_mounts(tx: &mut Transaction<'_>) -> Result<Vec<MountInfo>, DatabaseError> {
    Query::new(format!("SELECT {} FROM mounts ORDER BY name", MOUNT_COLUMNS))
        .fetch(tx)
        .await?
        .iter()
        .map(row_to_mount_info)
        .collect()
}

/// Mounts that should be enabled when the service starts.
pub async fn list_startup_mounts(tx: &mut Transaction<'_>) -> Result<Vec<MountInfo>, DatabaseError> {
    Query::new(format!(
        r#"
        SELECT {}
        FROM mounts
        WHERE enable_at_startup = 1 AND persistent = 1
        ORDER BY name
        "#,
        MOUNT_COLUMNS
    ))
    .fetch(tx)
    .await?
    .iter()
    .map(row_to_mount_info)
    .collect()
}

pub async fn create_mount(tx: &mut Transaction<'_>, info: &MountInfo) -> Result<(), DatabaseError> {
    Query::new(
        r#"
        INSERT INTO mounts (enable_at_startup, id, name, path, persistent, read_only)
        VALUES (:enable_at_startup, :id, :name, :path, :persistent, :read_only)
        "#,
    )
    .param("enable_at_startup", info.flags.enable_at_startup)
    .param("id", info.handle)
    .param("name", info.flags.name.clone())
    .param("path", info.path.to_string_lossy().into_owned())
    .param("persistent", info.flags.persistent)
    .param("read_only", info.flags.read_only)
    .execute(tx)
    .await?;

    Ok(())
}

/// Replace the flags of the mount called `name`, possibly renaming it.
///
/// Returns the number of rows changed: zero when no such mount exists.
pub async fn update_mount_flags(
    tx: &mut Transaction<'_>,
    name: &str,
    flags: &MountFlags,
) -> Result<u64, DatabaseError> {
    Query::new(
        r#"
        UPDATE mounts
        SET enable_at_startup = :enable_at_startup,
            name = :new_name,
            persistent = :persistent,
            read_only = :read_only,
            updated_at = CURRENT_TIMESTAMP
        WHERE name = :name
        "#,
    )
    .param("enable_at_startup", flags.enable_at_startup)
    .param("new_name", flags.name.clone())
    .param("persistent", flags.persistent)
    .param("read_only", flags.read_only)
    .param("name", name.to_string())
    .execute(tx)
    .await
}

/// Returns the number of rows removed.
pub async fn delete_mount(tx: &mut Transaction<'_>, name: &str) -> Result<u64, DatabaseError> {
    Query::new("DELETE FROM mounts WHERE name = :name")
        .param("name", name.to_string())
        .execute(tx)
        .await
}

/// Remove every mount that was not marked persistent.
pub async fn prune_mounts(tx: &mut Transaction<'_>) -> Result<u64, DatabaseError> {
    Query::new("DELETE FROM mounts WHERE persistent = 0")
        .execute(tx)
        .await
}

/// Next synthetic inode id to hand out.
pub async fn get_next_inode_id(tx: &mut Transaction<'_>) -> Result<InodeId, DatabaseError> {
    let record = Query::new("SELECT next FROM inode_id LIMIT 1")
        .fetch_optional(tx)
        .await?;

    match record {
        Some(record) => record.get("next"),
        None => Ok(InodeId::synthetic(0)),
    }
}

pub async fn set_next_inode_id(tx: &mut Transaction<'_>, next: InodeId) -> Result<(), DatabaseError> {
    Query::new("UPDATE inode_id SET next = :next")
        .param("next", next)
        .execute(tx)
        .await?;

    Ok(())
}

fn row_to_mount_info(record: &Record) -> Result<MountInfo, DatabaseError> {
    Ok(MountInfo {
        handle: record.get::<NodeHandle>("id")?,
        path: PathBuf::from(record.get::<String>("path")?),
        flags: MountFlags {
            name: record.get("name")?,
            enable_at_startup: record.get("enable_at_startup")?,
            persistent: record.get("persistent")?,
            read_only: record.get("read_only")?,
        },
    })
}
