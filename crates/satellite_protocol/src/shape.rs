//! Shape definitions: declarative slices of remote data.

use crate::codec::to_cbor;
use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// A table, an optional row filter, and nested includes over foreign keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeDefinition {
    /// Root table.
    pub table: String,
    /// Row filter, e.g. `status = 'open'`.
    #[serde(default)]
    pub filter: Option<String>,
    /// Related tables pulled in through foreign keys.
    #[serde(default)]
    pub include: Vec<ShapeInclude>,
}

/// A nested include: rows of `select.table` whose `foreign_key` columns
/// reference rows of the parent shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeInclude {
    /// Referencing columns on the included table.
    pub foreign_key: Vec<String>,
    /// Shape of the included table.
    pub select: ShapeDefinition,
}

impl ShapeDefinition {
    /// A shape covering a whole table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            include: Vec::new(),
        }
    }

    /// Restricts the shape with a row filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Adds a related table.
    pub fn with_include(mut self, foreign_key: impl Into<String>, select: ShapeDefinition) -> Self {
        self.include.push(ShapeInclude {
            foreign_key: vec![foreign_key.into()],
            select,
        });
        self
    }

    /// Every table named by the shape, including nested includes.
    pub fn tables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_tables(&mut out);
        out
    }

    fn collect_tables(&self, out: &mut BTreeSet<String>) {
        out.insert(self.table.clone());
        for include in &self.include {
            include.select.collect_tables(out);
        }
    }
}

/// A shape definition paired with a locally generated request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeRequest {
    /// Request id, unique per subscription.
    pub request_id: String,
    /// What to replicate.
    pub definition: ShapeDefinition,
}

impl ShapeRequest {
    /// Creates a request.
    pub fn new(request_id: impl Into<String>, definition: ShapeDefinition) -> Self {
        Self {
            request_id: request_id.into(),
            definition,
        }
    }
}

/// Hex SHA-256 over the encoded definitions.
///
/// Two subscriptions with the same hash request exactly the same data.
pub fn shape_hash(definitions: &[ShapeDefinition]) -> ProtocolResult<String> {
    let bytes = to_cbor(&definitions)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_include_nested() {
        let shape = ShapeDefinition::table("projects").with_include(
            "project_id",
            ShapeDefinition::table("issues")
                .with_include("issue_id", ShapeDefinition::table("comments")),
        );
        let tables: Vec<_> = shape.tables().into_iter().collect();
        assert_eq!(tables, vec!["comments", "issues", "projects"]);
    }

    #[test]
    fn hash_is_stable_and_discriminating() {
        let a = vec![ShapeDefinition::table("items").with_filter("status = 'open'")];
        let b = vec![ShapeDefinition::table("items")];
        assert_eq!(shape_hash(&a).unwrap(), shape_hash(&a.clone()).unwrap());
        assert_ne!(shape_hash(&a).unwrap(), shape_hash(&b).unwrap());
        assert_eq!(shape_hash(&a).unwrap().len(), 64);
    }
}
