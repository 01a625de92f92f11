//! Causal write tags.
//!
//! Every operation carries a [`Tag`]: the id of the client that produced it
//! and a logical timestamp. Tags are totally ordered by timestamp first and
//! origin second, so any two replicas pick the same winner for a column
//! regardless of the order in which they see the writes.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A causal tag `(origin, timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Opaque id of the client that produced the write.
    pub origin: String,
    /// Logical timestamp, non-decreasing per origin.
    pub timestamp: u64,
}

impl Tag {
    /// Creates a new tag.
    pub fn new(origin: impl Into<String>, timestamp: u64) -> Self {
        Self {
            origin: origin.into(),
            timestamp,
        }
    }

    /// Returns the greater of two tags.
    pub fn max_of<'a>(a: &'a Tag, b: &'a Tag) -> &'a Tag {
        if b > a {
            b
        } else {
            a
        }
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.origin, self.timestamp)
    }
}

impl FromStr for Tag {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        // Origins are opaque and may themselves contain '@'.
        let (origin, timestamp) = s
            .rsplit_once('@')
            .ok_or_else(|| ProtocolError::InvalidTag(s.to_string()))?;
        let timestamp = timestamp
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidTag(s.to_string()))?;
        Ok(Tag::new(origin, timestamp))
    }
}
