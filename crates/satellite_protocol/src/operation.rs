//! Row-level operations.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use crate::tag::Tag;
use crate::value::{key_string, Row};
use serde::{Deserialize, Serialize};

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// A new row.
    Insert,
    /// Changed columns of an existing row.
    Update,
    /// Row removal.
    Delete,
}

impl OperationKind {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            OperationKind::Insert => 1,
            OperationKind::Update => 2,
            OperationKind::Delete => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(OperationKind::Insert),
            2 => Some(OperationKind::Update),
            3 => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

/// One row-level change.
///
/// `values` holds every column for an insert and only the changed columns
/// for an update; it is empty for a delete. `old_values` optionally carries
/// prior values of foreign key columns so a peer can compensate when a
/// referenced row has gone away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Change kind.
    pub kind: OperationKind,
    /// Target table.
    pub table: String,
    /// Primary key columns of the target row.
    pub primary_key: Row,
    /// Column values written by this operation.
    pub values: Row,
    /// Causal tag of the write.
    pub tag: Tag,
    /// Prior values of foreign key columns.
    #[serde(default)]
    pub old_values: Row,
}

impl Operation {
    /// Creates an insert.
    pub fn insert(table: impl Into<String>, primary_key: Row, values: Row, tag: Tag) -> Self {
        Self::new(OperationKind::Insert, table, primary_key, values, tag)
    }

    /// Creates an update of the given columns.
    pub fn update(table: impl Into<String>, primary_key: Row, values: Row, tag: Tag) -> Self {
        Self::new(OperationKind::Update, table, primary_key, values, tag)
    }

    /// Creates a delete.
    pub fn delete(table: impl Into<String>, primary_key: Row, tag: Tag) -> Self {
        Self::new(OperationKind::Delete, table, primary_key, Row::new(), tag)
    }

    fn new(
        kind: OperationKind,
        table: impl Into<String>,
        primary_key: Row,
        mut values: Row,
        tag: Tag,
    ) -> Self {
        // Key columns are addressed through `primary_key` only.
        values.retain(|column, _| !primary_key.contains_key(column));
        Self {
            kind,
            table: table.into(),
            primary_key,
            values,
            tag,
            old_values: Row::new(),
        }
    }

    /// Attaches prior foreign key values.
    pub fn with_old_values(mut self, old_values: Row) -> Self {
        self.old_values = old_values;
        self
    }

    /// Stable address of the target row within its table.
    pub fn row_key(&self) -> String {
        key_string(&self.primary_key)
    }

    /// Returns true for deletes.
    pub fn is_delete(&self) -> bool {
        self.kind == OperationKind::Delete
    }

    /// Encodes the operation to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes an operation from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{row, Value};

    #[test]
    fn operation_kind_codes() {
        for kind in [
            OperationKind::Insert,
            OperationKind::Update,
            OperationKind::Delete,
        ] {
            assert_eq!(OperationKind::from_code(kind.to_code()), Some(kind));
        }
        assert_eq!(OperationKind::from_code(9), None);
    }

    #[test]
    fn key_columns_are_not_values() {
        let op = Operation::insert(
            "items",
            row([("id", 1)]),
            row([("id", Value::Integer(1)), ("title", Value::from("a"))]),
            Tag::new("c1", 1),
        );
        assert!(!op.values.contains_key("id"));
        assert_eq!(op.row_key(), "id=1");
    }

    #[test]
    fn update_operation_roundtrip() {
        let op = Operation::update(
            "items",
            row([("id", 7)]),
            row([("status", "open")]),
            Tag::new("c1", 3),
        )
        .with_old_values(row([("owner_id", 2)]));

        let decoded = Operation::decode(&op.encode().unwrap()).unwrap();
        assert_eq!(op, decoded);
    }

    #[test]
    fn delete_has_no_values() {
        let op = Operation::delete("items", row([("id", 7)]), Tag::new("c1", 4));
        assert!(op.is_delete());
        assert!(op.values.is_empty());
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(Operation::decode(&[0xff, 0x00]).is_err());
    }
}
