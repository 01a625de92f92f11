//! Column-level last-writer-wins merge.
//!
//! Each row keeps, per column, the value together with the tag of the write
//! that produced it, plus the greatest delete tag seen (the tombstone).
//!
//! - A column write wins if its tag is greater than the column's current tag
//!   and greater than the tombstone.
//! - A delete raises the tombstone and drops every column (and the row's
//!   presence) written with a smaller tag.
//! - A write carrying exactly the stored tag has already been applied.
//!
//! Every rule is a maximum over tags, so applying a set of operations in any
//! order, any number of times, produces the same row.

use satellite_protocol::{Operation, OperationKind, Row, Tag, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A column value and the tag of the write that set it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnState {
    /// Current value.
    pub value: Value,
    /// Tag of the winning write.
    pub tag: Tag,
}

/// Merge state of one row: the local view the resolver compares against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowState {
    /// Surviving column writes.
    pub columns: BTreeMap<String, ColumnState>,
    /// Greatest tag of any surviving write; `None` when the row is absent.
    pub presence: Option<Tag>,
    /// Greatest delete tag seen.
    pub tombstone: Option<Tag>,
}

impl RowState {
    /// Returns true if the row exists.
    pub fn is_visible(&self) -> bool {
        self.presence.is_some()
    }

    /// Non-key column values of the row.
    pub fn materialize(&self) -> Row {
        self.columns
            .iter()
            .map(|(name, column)| (name.clone(), column.value.clone()))
            .collect()
    }

    /// Value of a column, NULL if unset.
    pub fn value(&self, column: &str) -> &Value {
        self.columns
            .get(column)
            .map_or(&Value::Null, |c| &c.value)
    }

    fn dominated(&self, tag: &Tag) -> bool {
        self.tombstone.as_ref().is_some_and(|t| tag <= t)
    }

    /// Applies a delete tagged `tag`: raises the tombstone and drops every
    /// column written at or before it.
    fn remove_before(&mut self, tag: &Tag) {
        if !self.dominated(tag) {
            self.tombstone = Some(tag.clone());
        }
        self.columns.retain(|_, column| &column.tag > tag);
        if self.presence.as_ref().is_some_and(|p| p <= tag) {
            // Presence is the max of surviving column tags, or the tag of a
            // key-only insert, which the delete also supersedes.
            self.presence = self.columns.values().map(|c| c.tag.clone()).max();
        }
    }

    fn raise_presence(&mut self, tag: &Tag) {
        match &self.presence {
            Some(current) if current >= tag => {}
            _ => self.presence = Some(tag.clone()),
        }
    }
}

/// Result of merging one operation into a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Row state after the merge.
    pub state: RowState,
    /// Net local effect, or `None` if the operation changed nothing.
    pub resolved: Option<Operation>,
}

impl Resolution {
    /// Returns true if the merge changed the row.
    pub fn changed(&self) -> bool {
        self.resolved.is_some()
    }
}

/// Stateless last-writer-wins resolver.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Merges `incoming` into the local view of its row.
    pub fn merge(local: &RowState, incoming: &Operation) -> Resolution {
        match incoming.kind {
            OperationKind::Insert | OperationKind::Update => Self::merge_write(local, incoming),
            OperationKind::Delete => Self::merge_delete(local, incoming),
        }
    }

    fn merge_write(local: &RowState, incoming: &Operation) -> Resolution {
        let tag = &incoming.tag;
        if local.dominated(tag) {
            return Resolution {
                state: local.clone(),
                resolved: None,
            };
        }

        let mut state = local.clone();
        let mut won = Row::new();
        for (column, value) in &incoming.values {
            let wins = state.columns.get(column).map_or(true, |c| tag > &c.tag);
            if wins {
                state.columns.insert(
                    column.clone(),
                    ColumnState {
                        value: value.clone(),
                        tag: tag.clone(),
                    },
                );
                won.insert(column.clone(), value.clone());
            }
        }

        let was_visible = local.is_visible();
        state.raise_presence(tag);
        if state == *local {
            return Resolution {
                state,
                resolved: None,
            };
        }

        let kind = if was_visible {
            OperationKind::Update
        } else {
            OperationKind::Insert
        };
        let resolved = Operation {
            kind,
            table: incoming.table.clone(),
            primary_key: incoming.primary_key.clone(),
            values: if kind == OperationKind::Insert {
                state.materialize()
            } else {
                won
            },
            tag: tag.clone(),
            old_values: Row::new(),
        };
        Resolution {
            state,
            resolved: Some(resolved),
        }
    }

    fn merge_delete(local: &RowState, incoming: &Operation) -> Resolution {
        let tag = &incoming.tag;
        let mut state = local.clone();
        state.remove_before(tag);

        if state == *local {
            return Resolution {
                state,
                resolved: None,
            };
        }

        let resolved = if state.is_visible() {
            // A newer concurrent write keeps the row alive; older columns go.
            let cleared: Row = local
                .columns
                .keys()
                .filter(|c| !state.columns.contains_key(*c))
                .map(|c| (c.clone(), Value::Null))
                .collect();
            Operation {
                kind: OperationKind::Update,
                table: incoming.table.clone(),
                primary_key: incoming.primary_key.clone(),
                values: cleared,
                tag: tag.clone(),
                old_values: Row::new(),
            }
        } else {
            incoming.clone()
        };

        Resolution {
            state,
            resolved: Some(resolved),
        }
    }

    /// The row as a delete tagged `tombstone` would leave it, for rows that
    /// go away with the row they reference. Writes newer than the tombstone
    /// survive and keep the row.
    pub fn cascade(local: &RowState, tombstone: &Tag) -> RowState {
        let mut state = local.clone();
        state.remove_before(tombstone);
        state
    }
}
