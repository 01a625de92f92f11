//! Table schemas exchanged with the peer.

use serde::{Deserialize, Serialize};

/// Column storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Integer column.
    Integer,
    /// Floating point column.
    Real,
    /// Text column.
    Text,
    /// Binary column.
    Blob,
    /// Boolean column.
    Bool,
}

/// One column of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationColumn {
    /// Column name.
    pub name: String,
    /// Storage type.
    pub column_type: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

/// A foreign key from `column` to `references_table.references_column`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing column in this table.
    pub column: String,
    /// Referenced table.
    pub references_table: String,
    /// Referenced (primary key) column.
    pub references_column: String,
}

/// A table schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    /// Table name.
    pub table: String,
    /// Columns in declaration order.
    pub columns: Vec<RelationColumn>,
    /// Outgoing foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl Relation {
    /// Creates a relation with no columns.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Adds a primary key column.
    pub fn with_key(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(RelationColumn {
            name: name.into(),
            column_type,
            nullable: false,
            primary_key: true,
        });
        self
    }

    /// Adds a nullable, non-key column.
    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(RelationColumn {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
        });
        self
    }

    /// Adds a foreign key.
    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
        });
        self
    }

    /// Names of the primary key columns.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&RelationColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Foreign keys of this table that point at `table`.
    pub fn foreign_keys_to<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.references_table == table)
    }
}
