//! Reserved tables holding the engine's own state.

use crate::adapter::{DatabaseAdapter, Statement};
use crate::error::{SatelliteError, SatelliteResult};
use satellite_protocol::{row, Row, Value};

/// Key/value metadata.
pub const META_TABLE: &str = "_satellite_meta";
/// Outbound operation log.
pub const OPLOG_TABLE: &str = "_satellite_oplog";
/// Per-row merge state (column tags and tombstones).
pub const SHADOW_TABLE: &str = "_satellite_shadow";

/// Meta key: this client's origin id.
pub const CLIENT_ID_KEY: &str = "client_id";
/// Meta key: last applied inbound LSN.
pub const LSN_KEY: &str = "lsn";
/// Meta key: serialized subscription state.
pub const SUBSCRIPTIONS_KEY: &str = "subscriptions";
/// Meta key: next oplog position to assign.
pub const OPLOG_NEXT_KEY: &str = "oplog_next_position";
/// Meta key: highest acknowledged oplog position.
pub const OPLOG_ACKED_KEY: &str = "oplog_acked_position";

/// Returns true for tables owned by the engine.
pub fn is_reserved_table(table: &str) -> bool {
    table.starts_with("_satellite_")
}

fn meta_key(key: &str) -> Row {
    row([("key", key)])
}

/// Reads a metadata value.
pub fn get_meta<A: DatabaseAdapter + ?Sized>(
    adapter: &A,
    key: &str,
) -> SatelliteResult<Option<Vec<u8>>> {
    let rows = adapter.query(&Statement::select_key(META_TABLE, meta_key(key)))?;
    Ok(rows
        .into_iter()
        .next()
        .and_then(|r| r.get("value").and_then(Value::as_bytes).map(<[u8]>::to_vec)))
}

/// Statement writing a metadata value.
pub fn set_meta(key: &str, value: Vec<u8>) -> Statement {
    Statement::Upsert {
        table: META_TABLE.to_string(),
        key: meta_key(key),
        values: row([("value", Value::Bytes(value))]),
    }
}

/// Reads a metadata counter. A stored value that is not eight bytes is
/// corrupt, not missing.
pub fn get_meta_u64<A: DatabaseAdapter + ?Sized>(
    adapter: &A,
    key: &str,
) -> SatelliteResult<Option<u64>> {
    let Some(bytes) = get_meta(adapter, key)? else {
        return Ok(None);
    };
    let bytes = <[u8; 8]>::try_from(bytes.as_slice()).map_err(|_| {
        SatelliteError::storage(format!(
            "meta counter {key} has {} bytes, expected 8",
            bytes.len()
        ))
    })?;
    Ok(Some(u64::from_be_bytes(bytes)))
}

/// Statement writing a metadata counter.
pub fn set_meta_u64(key: &str, value: u64) -> Statement {
    set_meta(key, value.to_be_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;

    #[test]
    fn meta_roundtrip() {
        let db = MemoryAdapter::new();
        assert_eq!(get_meta(&db, LSN_KEY).unwrap(), None);
        db.transaction(&[set_meta(LSN_KEY, vec![1, 2]), set_meta_u64(OPLOG_NEXT_KEY, 9)])
            .unwrap();
        assert_eq!(get_meta(&db, LSN_KEY).unwrap(), Some(vec![1, 2]));
        assert_eq!(get_meta_u64(&db, OPLOG_NEXT_KEY).unwrap(), Some(9));
    }

    #[test]
    fn malformed_counter_is_a_storage_error() {
        let db = MemoryAdapter::new();
        db.transaction(&[set_meta(OPLOG_NEXT_KEY, vec![0, 1, 2])]).unwrap();
        let err = get_meta_u64(&db, OPLOG_NEXT_KEY).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Storage);
        assert_eq!(get_meta_u64(&db, OPLOG_ACKED_KEY).unwrap(), None);
    }

    #[test]
    fn reserved_tables() {
        assert!(is_reserved_table(OPLOG_TABLE));
        assert!(!is_reserved_table("items"));
    }
}
