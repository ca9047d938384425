//! SQLite column mappings for inode and node identifiers.
//!
//! Both are stored as INTEGER. `InodeId` uses the full 64 bits, so values in
//! the synthetic range come back from SQLite as negative numbers and are
//! reinterpreted bit for bit.

use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};

use crate::fuse::{InodeId, NodeHandle};

impl Decode<'_, Sqlite> for NodeHandle {
    fn decode(value: SqliteValueRef<'_>) -> Result<Self, BoxDynError> {
        let raw = <i64 as Decode<Sqlite>>::decode(value)?;
        Ok(NodeHandle::new(raw as u64))
    }
}

impl Encode<'_, Sqlite> for NodeHandle {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'_>>,
    ) -> Result<IsNull, BoxDynError> {
        args.push(SqliteArgumentValue::Int64(self.get() as i64));
        Ok(IsNull::No)
    }
}

impl Type<Sqlite> for NodeHandle {
    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <i64 as Type<Sqlite>>::compatible(ty)
    }

    fn type_info() -> SqliteTypeInfo {
        <i64 as Type<Sqlite>>::type_info()
    }
}

impl Decode<'_, Sqlite> for InodeId {
    fn decode(value: SqliteValueRef<'_>) -> Result<Self, BoxDynError> {
        let raw = <i64 as Decode<Sqlite>>::decode(value)?;
        Ok(InodeId::from_raw(raw as u64))
    }
}

impl Encode<'_, Sqlite> for InodeId {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'_>>,
    ) -> Result<IsNull, BoxDynError> {
        args.push(SqliteArgumentValue::Int64(self.get() as i64));
        Ok(IsNull::No)
    }
}

impl Type<Sqlite> for InodeId {
    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <i64 as Type<Sqlite>>::compatible(ty)
    }

    fn type_info() -> SqliteTypeInfo {
        <i64 as Type<Sqlite>>::type_info()
    }
}

#[cfg(test)]
mod tests {
    use common::database::{Database, Query};

    use super::*;

    #[tokio::test]
    async fn test_identifiers_survive_storage() {
        let db = Database::in_memory().await.unwrap();
        let mut tx = db.transaction().await.unwrap();

        let record = Query::new("SELECT :inode AS inode, :handle AS handle")
            .param("inode", InodeId::synthetic(3))
            .param("handle", NodeHandle::new(0xBEEF))
            .fetch_optional(&mut tx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.get::<InodeId>("inode").unwrap(), InodeId::synthetic(3));
        assert_eq!(record.get::<NodeHandle>("handle").unwrap(), NodeHandle::new(0xBEEF));
    }
}
