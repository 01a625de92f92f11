//! Server configuration.

use satellite_protocol::Relation;
use std::collections::BTreeSet;

/// Configuration for the replication peer.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Id reported to clients on successful authentication.
    pub server_id: String,
    /// Accepted tokens. When empty, any non-empty token is accepted.
    pub tokens: BTreeSet<String>,
    /// Largest number of rows one subscription may deliver.
    pub max_shape_rows: usize,
    /// Tables the server replicates, announced to every client.
    pub relations: Vec<Relation>,
}

impl ServerConfig {
    /// Creates a configuration with no tables.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            tokens: BTreeSet::new(),
            max_shape_rows: 10_000,
            relations: Vec::new(),
        }
    }

    /// Accepts `token`. Once any token is added, only listed tokens pass.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.tokens.insert(token.into());
        self
    }

    /// Sets the shape size limit.
    pub fn with_max_shape_rows(mut self, rows: usize) -> Self {
        self.max_shape_rows = rows;
        self
    }

    /// Adds a replicated table.
    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Returns true if `token` may authenticate.
    pub fn accepts(&self, token: &str) -> bool {
        if self.tokens.is_empty() {
            !token.is_empty()
        } else {
            self.tokens.contains(token)
        }
    }

    /// Schema of `table`, if replicated.
    pub fn relation(&self, table: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.table == table)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("satellite-server")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_protocol::ColumnType;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_shape_rows, 10_000);
        assert!(config.accepts("anything"));
        assert!(!config.accepts(""));
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("peer-1")
            .with_token("secret")
            .with_max_shape_rows(5)
            .with_relation(Relation::new("items").with_key("id", ColumnType::Integer));

        assert_eq!(config.server_id, "peer-1");
        assert!(config.accepts("secret"));
        assert!(!config.accepts("guess"));
        assert_eq!(config.max_shape_rows, 5);
        assert!(config.relation("items").is_some());
        assert!(config.relation("ghosts").is_none());
    }
}
