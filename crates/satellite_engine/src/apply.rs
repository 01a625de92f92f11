//! Applying merged operations to the local database.
//!
//! An [`Applier`] stages one local transaction. Operations merge into the
//! per-row state kept in the shadow table. The rows written to the data
//! tables are then derived from that state and from the state of the rows
//! they reference:
//!
//! - a reference to a deleted row reads as NULL;
//! - under [`CompensationPolicy::Cascade`] a row referencing a deleted row
//!   also loses every column written before that delete, and disappears
//!   when none is left.
//!
//! Derivation looks only at merged state, so the result does not depend on
//! whether a parent delete arrived before or after the writes of its
//! dependants. When a row changes, every row referencing it, directly or
//! through other rows, is derived again. A parent that comes back restores
//! its dependants.

use crate::adapter::{DatabaseAdapter, Predicate, Statement};
use crate::config::CompensationPolicy;
use crate::error::{SatelliteError, SatelliteResult};
use crate::merge::{ConflictResolver, RowState};
use crate::meta::SHADOW_TABLE;
use satellite_protocol::{
    from_cbor, key_string, row, to_cbor, Operation, OperationKind, Relation, Row, Tag, Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::info;

/// Table schemas by name.
pub type Relations = HashMap<String, Relation>;

type Address = (String, String);

struct WorkingRow {
    key: Row,
    state: RowState,
    dirty: bool,
}

/// A row's merge state after foreign key repair.
#[derive(Debug, Clone)]
struct Derived {
    state: RowState,
    /// Reference columns pointing at deleted rows, with each delete's tag.
    orphaned: Vec<(String, Tag)>,
}

impl Derived {
    fn is_deleted(&self) -> bool {
        !self.state.is_visible() && self.state.tombstone.is_some()
    }

    fn row(&self) -> Option<Row> {
        if !self.state.is_visible() {
            return None;
        }
        let mut row = self.state.materialize();
        for (column, _) in &self.orphaned {
            row.insert(column.clone(), Value::Null);
        }
        Some(row)
    }
}

/// Everything needed to commit a staged transaction.
#[derive(Debug, Default)]
pub struct StagedChanges {
    /// Data and shadow writes.
    pub statements: Vec<Statement>,
    /// Tables whose data changed.
    pub tables: BTreeSet<String>,
    /// Foreign key repairs written while staging.
    pub compensations: Vec<Operation>,
}

/// Shadow row address.
fn shadow_key(table: &str, key: &Row) -> Row {
    row([("table", table.to_string()), ("row", key_string(key))])
}

fn decode<T: serde::de::DeserializeOwned>(stored: &Row, column: &str) -> SatelliteResult<Option<T>> {
    stored
        .get(column)
        .and_then(Value::as_bytes)
        .map(|bytes| {
            from_cbor(bytes)
                .map_err(|e| SatelliteError::storage(format!("corrupt shadow {column}: {e}")))
        })
        .transpose()
}

/// Stages merged operations against the local database.
pub struct Applier<'a, A: ?Sized> {
    adapter: &'a A,
    relations: &'a Relations,
    policy: CompensationPolicy,
    working: BTreeMap<Address, WorkingRow>,
    scanned: BTreeSet<String>,
}

impl<'a, A: DatabaseAdapter + ?Sized> Applier<'a, A> {
    /// Creates an applier with an empty working set.
    pub fn new(adapter: &'a A, relations: &'a Relations, policy: CompensationPolicy) -> Self {
        Self {
            adapter,
            relations,
            policy,
            working: BTreeMap::new(),
            scanned: BTreeSet::new(),
        }
    }

    fn load(&mut self, table: &str, key: &Row) -> SatelliteResult<&mut WorkingRow> {
        let address = (table.to_string(), key_string(key));
        if !self.working.contains_key(&address) {
            let rows = self
                .adapter
                .query(&Statement::select_key(SHADOW_TABLE, shadow_key(table, key)))?;
            let state = match rows.first() {
                Some(stored) => decode(stored, "state")?.unwrap_or_default(),
                None => RowState::default(),
            };
            self.working.insert(
                address.clone(),
                WorkingRow {
                    key: key.clone(),
                    state,
                    dirty: false,
                },
            );
        }
        self.working
            .get_mut(&address)
            .ok_or_else(|| SatelliteError::storage("working row vanished"))
    }

    /// Merges one operation, returning its net local effect if it had one.
    pub fn apply(&mut self, op: &Operation) -> SatelliteResult<Option<Operation>> {
        let working = self.load(&op.table, &op.primary_key)?;
        let resolution = ConflictResolver::merge(&working.state, op);
        if resolution.changed() {
            working.state = resolution.state;
            working.dirty = true;
        }
        Ok(resolution.resolved)
    }

    /// Loads every stored row of `table` into the working set.
    fn scan(&mut self, table: &str) -> SatelliteResult<()> {
        if !self.scanned.insert(table.to_string()) {
            return Ok(());
        }
        let stored = self.adapter.query(&Statement::select(
            SHADOW_TABLE,
            Predicate::Eq(row([("table", table)])),
        ))?;
        for shadow in &stored {
            let key: Row = decode(shadow, "key")?
                .ok_or_else(|| SatelliteError::storage(format!("shadow row of {table} has no key")))?;
            let address = (table.to_string(), key_string(&key));
            if self.working.contains_key(&address) {
                continue;
            }
            let state = decode(shadow, "state")?.unwrap_or_default();
            self.working.insert(
                address,
                WorkingRow {
                    key,
                    state,
                    dirty: false,
                },
            );
        }
        Ok(())
    }

    /// Rows whose merged reference columns point at the row at `address`.
    fn dependants(&mut self, address: &Address) -> SatelliteResult<Vec<Address>> {
        let Some(key) = self.working.get(address).map(|w| w.key.clone()) else {
            return Ok(Vec::new());
        };
        let relations = self.relations;
        let mut found = Vec::new();
        for relation in relations.values() {
            for fk in relation.foreign_keys_to(&address.0) {
                let Some(value) = key.get(&fk.references_column) else {
                    continue;
                };
                self.scan(&relation.table)?;
                found.extend(
                    self.working
                        .iter()
                        .filter(|((table, _), w)| {
                            *table == relation.table && w.state.value(&fk.column) == value
                        })
                        .map(|(child, _)| child.clone()),
                );
            }
        }
        Ok(found)
    }

    fn derive(
        &mut self,
        address: &Address,
        memo: &mut BTreeMap<Address, Derived>,
        visiting: &mut BTreeSet<Address>,
    ) -> SatelliteResult<Derived> {
        if let Some(derived) = memo.get(address) {
            return Ok(derived.clone());
        }
        let raw = self
            .working
            .get(address)
            .map(|w| w.state.clone())
            .unwrap_or_default();
        if !visiting.insert(address.clone()) {
            // Reference cycle.
            return Ok(Derived {
                state: raw,
                orphaned: Vec::new(),
            });
        }

        let relations = self.relations;
        let mut orphaned = Vec::new();
        if let Some(relation) = relations.get(&address.0) {
            for fk in &relation.foreign_keys {
                let value = raw.value(&fk.column);
                if value.is_null() {
                    continue;
                }
                let parent_key = row([(fk.references_column.clone(), value.clone())]);
                self.load(&fk.references_table, &parent_key)?;
                let parent_address = (fk.references_table.clone(), key_string(&parent_key));
                let parent = self.derive(&parent_address, memo, visiting)?;
                if parent.is_deleted() {
                    if let Some(tombstone) = parent.state.tombstone {
                        orphaned.push((fk.column.clone(), tombstone));
                    }
                }
            }
        }

        let mut state = raw;
        if self.policy == CompensationPolicy::Cascade {
            for (_, tombstone) in &orphaned {
                state = ConflictResolver::cascade(&state, tombstone);
            }
        }
        visiting.remove(address);
        let derived = Derived { state, orphaned };
        memo.insert(address.clone(), derived.clone());
        Ok(derived)
    }

    /// Consumes the applier, producing the statements to commit.
    pub fn finish(mut self) -> SatelliteResult<StagedChanges> {
        let mut affected: BTreeSet<Address> = self
            .working
            .iter()
            .filter(|(_, w)| w.dirty)
            .map(|(address, _)| address.clone())
            .collect();
        let mut queue: VecDeque<Address> = affected.iter().cloned().collect();
        while let Some(address) = queue.pop_front() {
            for dependant in self.dependants(&address)? {
                if affected.insert(dependant.clone()) {
                    queue.push_back(dependant);
                }
            }
        }

        let mut staged = StagedChanges::default();
        let mut memo = BTreeMap::new();
        let mut visiting = BTreeSet::new();
        for address in &affected {
            let derived = self.derive(address, &mut memo, &mut visiting)?;
            let Some(working) = self.working.get(address) else {
                continue;
            };
            let table = &address.0;
            if working.dirty {
                staged.statements.push(Statement::Upsert {
                    table: SHADOW_TABLE.to_string(),
                    key: shadow_key(table, &working.key),
                    values: row([
                        ("key", Value::Bytes(to_cbor(&working.key)?)),
                        ("state", Value::Bytes(to_cbor(&working.state)?)),
                    ]),
                });
            }

            let desired = derived.row();
            let current = self
                .adapter
                .query(&Statement::select_key(table.clone(), working.key.clone()))?
                .into_iter()
                .next();
            let mut full = desired.clone();
            if let Some(full) = &mut full {
                full.extend(working.key.clone());
            }
            if full == current {
                continue;
            }

            if let Some(compensation) = compensation(table, working, &derived) {
                info!(
                    table = %table,
                    kind = ?compensation.kind,
                    tag = %compensation.tag,
                    "repaired reference to deleted row"
                );
                staged.compensations.push(compensation);
            }
            staged.tables.insert(table.clone());
            staged.statements.push(match desired {
                Some(row) => Statement::Replace {
                    table: table.clone(),
                    key: working.key.clone(),
                    row,
                },
                None => Statement::Delete {
                    table: table.clone(),
                    key: working.key.clone(),
                },
            });
        }
        Ok(staged)
    }
}

/// The repair derivation made to a row, as an operation.
fn compensation(table: &str, working: &WorkingRow, derived: &Derived) -> Option<Operation> {
    let tag = derived.orphaned.iter().map(|(_, tag)| tag).max()?.clone();
    if derived.state.is_visible() {
        let nulled: Row = derived
            .orphaned
            .iter()
            .map(|(column, _)| (column.clone(), Value::Null))
            .collect();
        Some(Operation::update(table, working.key.clone(), nulled, tag))
    } else if working.state.is_visible() {
        Some(Operation::delete(table, working.key.clone(), tag))
    } else {
        None
    }
}

/// Collapses operations that share a tag and a row into their net effect,
/// keeping the position of each row's first operation.
///
/// Operations with equal tags cannot be ordered by the merge, so a batch
/// that touches one row twice must reach it as a single operation.
pub fn fold_operations(operations: Vec<Operation>, relations: &Relations) -> Vec<Operation> {
    let mut folded: Vec<Operation> = Vec::with_capacity(operations.len());
    let mut slots: BTreeMap<(String, String, Tag), usize> = BTreeMap::new();
    for op in operations {
        let slot = (op.table.clone(), key_string(&op.primary_key), op.tag.clone());
        match slots.get(&slot) {
            Some(&index) => combine(&mut folded[index], op, relations.get(&slot.0)),
            None => {
                slots.insert(slot, folded.len());
                folded.push(op);
            }
        }
    }
    folded
}

fn combine(net: &mut Operation, next: Operation, relation: Option<&Relation>) {
    match (net.kind, next.kind) {
        (_, OperationKind::Delete) => {
            net.kind = OperationKind::Delete;
            net.values.clear();
        }
        // Updating a row this batch already removed changes nothing.
        (OperationKind::Delete, OperationKind::Update) => {}
        (OperationKind::Delete, OperationKind::Insert) => {
            // Re-created: every column not given is cleared.
            net.kind = OperationKind::Insert;
            net.values = next.values;
            for column in relation.into_iter().flat_map(|r| &r.columns) {
                if !column.primary_key {
                    net.values.entry(column.name.clone()).or_insert(Value::Null);
                }
            }
        }
        (_, kind) => {
            net.values.extend(next.values);
            if kind == OperationKind::Insert {
                net.kind = OperationKind::Insert;
            }
        }
    }
}

/// Statements that forget all data and merge state of `tables`.
pub fn clear_tables(tables: &BTreeSet<String>) -> Vec<Statement> {
    tables
        .iter()
        .flat_map(|table| {
            [
                Statement::DeleteWhere {
                    table: table.clone(),
                    predicate: Predicate::All,
                },
                Statement::DeleteWhere {
                    table: SHADOW_TABLE.to_string(),
                    predicate: Predicate::Eq(row([("table", table.as_str())])),
                },
            ]
        })
        .collect()
}
