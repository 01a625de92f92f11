//! Materialised table state.
//!
//! Rows merge column by column: a write wins a column when its tag is
//! greater than the tag that last wrote it. A row is visible while its
//! newest write is newer than its newest delete.

use crate::filter::Filter;
use satellite_protocol::{key_string, Operation, OperationKind, Row, Tag, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct StoredRow {
    key: Row,
    columns: BTreeMap<String, (Value, Tag)>,
    written: Option<Tag>,
    deleted: Option<Tag>,
}

impl StoredRow {
    fn new(key: Row) -> Self {
        Self {
            key,
            columns: BTreeMap::new(),
            written: None,
            deleted: None,
        }
    }

    fn visible(&self) -> bool {
        match (&self.written, &self.deleted) {
            (Some(written), Some(deleted)) => written > deleted,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn values(&self) -> Row {
        self.columns
            .iter()
            .map(|(column, (value, _))| (column.clone(), value.clone()))
            .collect()
    }

    fn image(&self) -> Row {
        let mut image = self.values();
        image.extend(self.key.iter().map(|(k, v)| (k.clone(), v.clone())));
        image
    }

    fn apply(&mut self, op: &Operation) {
        match op.kind {
            OperationKind::Delete => {
                if self.deleted.as_ref().is_none_or(|d| op.tag > *d) {
                    self.deleted = Some(op.tag.clone());
                }
            }
            OperationKind::Insert | OperationKind::Update => {
                for (column, value) in &op.values {
                    let wins = self
                        .columns
                        .get(column)
                        .is_none_or(|(_, tag)| op.tag > *tag);
                    if wins {
                        self.columns
                            .insert(column.clone(), (value.clone(), op.tag.clone()));
                    }
                }
                if self.written.as_ref().is_none_or(|w| op.tag > *w) {
                    self.written = Some(op.tag.clone());
                }
            }
        }
    }
}

/// Current contents of every replicated table.
#[derive(Debug, Default)]
pub struct TableStore {
    tables: BTreeMap<String, BTreeMap<String, StoredRow>>,
}

impl TableStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one operation.
    pub fn apply(&mut self, op: &Operation) {
        self.tables
            .entry(op.table.clone())
            .or_default()
            .entry(key_string(&op.primary_key))
            .or_insert_with(|| StoredRow::new(op.primary_key.clone()))
            .apply(op);
    }

    /// Full column image of a row, visible or not. Unknown rows yield just
    /// the key.
    pub fn image(&self, table: &str, key: &Row) -> Row {
        self.tables
            .get(table)
            .and_then(|rows| rows.get(&key_string(key)))
            .map_or_else(|| key.clone(), StoredRow::image)
    }

    /// Visible rows of `table` in key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.visible(table).map(StoredRow::image).collect()
    }

    /// Visible rows of `table` matching `filter`, as snapshot inserts
    /// tagged with each row's newest write.
    pub fn select(&self, table: &str, filter: &Filter) -> Vec<Operation> {
        self.visible(table)
            .filter(|row| filter.matches(&row.image()))
            .filter_map(|row| {
                let tag = row.written.clone()?;
                Some(Operation::insert(table, row.key.clone(), row.values(), tag))
            })
            .collect()
    }

    fn visible<'a>(&'a self, table: &str) -> impl Iterator<Item = &'a StoredRow> + 'a {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.values())
            .filter(|row| row.visible())
    }
}
