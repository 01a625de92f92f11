//! Local database adapter.
//!
//! The engine never talks to a database engine directly. Everything it
//! persists, including its own metadata, goes through [`DatabaseAdapter`]
//! as structured [`Statement`]s, and every engine-driven mutation is issued
//! as one [`DatabaseAdapter::transaction`] so readers never see partial state.

use parking_lot::Mutex;
use satellite_protocol::{key_string, ForeignKey, Row, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Result type for adapter calls.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors raised by a database adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// A constraint (foreign key, not-null, ...) was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The underlying database failed.
    #[error("io error: {0}")]
    Io(String),

    /// The statement is not valid for the call it was passed to.
    #[error("invalid statement: {0}")]
    InvalidStatement(String),
}

/// Row selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Every row.
    All,
    /// Rows whose listed columns equal the given values.
    Eq(Row),
    /// Rows where `column > value`.
    Gt(String, Value),
    /// Rows where `column <= value`.
    Le(String, Value),
}

impl Predicate {
    /// Evaluates the predicate against a row. Missing columns read as NULL.
    pub fn matches(&self, row: &Row) -> bool {
        let get = |column: &str| row.get(column).unwrap_or(&Value::Null);
        match self {
            Predicate::All => true,
            Predicate::Eq(expected) => expected.iter().all(|(c, v)| get(c) == v),
            Predicate::Gt(column, value) => get(column) > value,
            Predicate::Le(column, value) => get(column) <= value,
        }
    }
}

/// A structured database command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Merge `values` into the row at `key`, creating it if absent.
    Upsert {
        /// Table.
        table: String,
        /// Primary key.
        key: Row,
        /// Columns to write.
        values: Row,
    },
    /// Replace the whole row at `key`.
    Replace {
        /// Table.
        table: String,
        /// Primary key.
        key: Row,
        /// New non-key columns.
        row: Row,
    },
    /// Remove the row at `key`.
    Delete {
        /// Table.
        table: String,
        /// Primary key.
        key: Row,
    },
    /// Remove every matching row.
    DeleteWhere {
        /// Table.
        table: String,
        /// Selection.
        predicate: Predicate,
    },
    /// Read matching rows.
    Select {
        /// Table.
        table: String,
        /// Selection.
        predicate: Predicate,
        /// Ascending sort column.
        order_by: Option<String>,
        /// Maximum rows returned.
        limit: Option<usize>,
    },
}

impl Statement {
    /// Selects rows of `table` matching `predicate`.
    pub fn select(table: impl Into<String>, predicate: Predicate) -> Self {
        Statement::Select {
            table: table.into(),
            predicate,
            order_by: None,
            limit: None,
        }
    }

    /// Selects the row at `key`.
    pub fn select_key(table: impl Into<String>, key: Row) -> Self {
        Self::select(table, Predicate::Eq(key))
    }

    /// The table the statement targets.
    pub fn table(&self) -> &str {
        match self {
            Statement::Upsert { table, .. }
            | Statement::Replace { table, .. }
            | Statement::Delete { table, .. }
            | Statement::DeleteWhere { table, .. }
            | Statement::Select { table, .. } => table,
        }
    }
}

/// Capability the engine needs from the local database.
pub trait DatabaseAdapter: Send + Sync {
    /// Runs a mutating statement, returning the number of affected rows.
    fn execute(&self, statement: &Statement) -> AdapterResult<u64>;

    /// Runs a `Select`.
    fn query(&self, statement: &Statement) -> AdapterResult<Vec<Row>>;

    /// Runs mutating statements atomically: all take effect or none do.
    fn transaction(&self, statements: &[Statement]) -> AdapterResult<()>;
}

type Table = BTreeMap<String, Row>;

/// In-memory adapter with optional foreign key enforcement.
#[derive(Default)]
pub struct MemoryAdapter {
    tables: Mutex<HashMap<String, Table>>,
    foreign_keys: Mutex<Vec<(String, ForeignKey)>>,
    failures: AtomicUsize,
}

impl MemoryAdapter {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforces `table.fk.column -> fk.references_table.fk.references_column`
    /// at the end of every transaction.
    pub fn enforce_foreign_key(&self, table: impl Into<String>, fk: ForeignKey) {
        self.foreign_keys.lock().push((table.into(), fk));
    }

    /// Makes the next `count` calls to `execute`/`transaction` fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// All rows of a table in key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The row at `key`, if present.
    pub fn row(&self, table: &str, key: &Row) -> Option<Row> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.get(&key_string(key)).cloned())
    }

    fn take_failure(&self) -> AdapterResult<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AdapterError::Io("injected failure".into()));
        }
        Ok(())
    }

    fn apply(tables: &mut HashMap<String, Table>, statement: &Statement) -> AdapterResult<u64> {
        match statement {
            Statement::Upsert { table, key, values } => {
                let rows = tables.entry(table.clone()).or_default();
                let row = rows.entry(key_string(key)).or_default();
                row.extend(key.clone());
                row.extend(values.clone());
                Ok(1)
            }
            Statement::Replace { table, key, row } => {
                let mut full = row.clone();
                full.extend(key.clone());
                tables
                    .entry(table.clone())
                    .or_default()
                    .insert(key_string(key), full);
                Ok(1)
            }
            Statement::Delete { table, key } => Ok(tables
                .get_mut(table)
                .and_then(|t| t.remove(&key_string(key)))
                .map_or(0, |_| 1)),
            Statement::DeleteWhere { table, predicate } => {
                let Some(rows) = tables.get_mut(table) else {
                    return Ok(0);
                };
                let before = rows.len();
                rows.retain(|_, row| !predicate.matches(row));
                Ok((before - rows.len()) as u64)
            }
            Statement::Select { .. } => Err(AdapterError::InvalidStatement(
                "select passed to execute".into(),
            )),
        }
    }

    fn check_foreign_keys(&self, tables: &HashMap<String, Table>) -> AdapterResult<()> {
        for (table, fk) in self.foreign_keys.lock().iter() {
            let Some(children) = tables.get(table) else {
                continue;
            };
            let parents = tables.get(&fk.references_table);
            for child in children.values() {
                let Some(value) = child.get(&fk.column).filter(|v| !v.is_null()) else {
                    continue;
                };
                let found = parents.is_some_and(|p| {
                    p.values()
                        .any(|parent| parent.get(&fk.references_column) == Some(value))
                });
                if !found {
                    return Err(AdapterError::Constraint(format!(
                        "{table}.{} = {value} has no row in {}",
                        fk.column, fk.references_table
                    )));
                }
            }
        }
        Ok(())
    }
}

impl DatabaseAdapter for MemoryAdapter {
    fn execute(&self, statement: &Statement) -> AdapterResult<u64> {
        self.take_failure()?;
        let mut tables = self.tables.lock();
        let mut staged = tables.clone();
        let affected = Self::apply(&mut staged, statement)?;
        self.check_foreign_keys(&staged)?;
        *tables = staged;
        Ok(affected)
    }

    fn query(&self, statement: &Statement) -> AdapterResult<Vec<Row>> {
        let Statement::Select {
            table,
            predicate,
            order_by,
            limit,
        } = statement
        else {
            return Err(AdapterError::InvalidStatement(
                "query requires a select".into(),
            ));
        };
        let tables = self.tables.lock();
        let mut rows: Vec<Row> = tables
            .get(table)
            .map(|t| t.values().filter(|r| predicate.matches(r)).cloned().collect())
            .unwrap_or_default();
        if let Some(column) = order_by {
            rows.sort_by(|a, b| a.get(column).cmp(&b.get(column)));
        }
        if let Some(limit) = limit {
            rows.truncate(*limit);
        }
        Ok(rows)
    }

    fn transaction(&self, statements: &[Statement]) -> AdapterResult<()> {
        self.take_failure()?;
        let mut tables = self.tables.lock();
        let mut staged = tables.clone();
        for statement in statements {
            Self::apply(&mut staged, statement)?;
        }
        self.check_foreign_keys(&staged)?;
        *tables = staged;
        Ok(())
    }
}
