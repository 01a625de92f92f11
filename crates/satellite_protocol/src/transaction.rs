//! Transactions: ordered groups of operations from one origin.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::lsn::Lsn;
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An ordered, non-empty sequence of operations sharing one commit
/// timestamp and one origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Origin of every operation in this transaction.
    pub origin: String,
    /// Commit timestamp (milliseconds).
    pub commit_timestamp: u64,
    /// Stream position. `None` until acknowledged by the peer.
    pub lsn: Option<Lsn>,
    operations: Vec<Operation>,
}

impl Transaction {
    /// Creates a transaction, checking that it is non-empty and single-origin.
    pub fn new(
        origin: impl Into<String>,
        commit_timestamp: u64,
        operations: Vec<Operation>,
    ) -> ProtocolResult<Self> {
        let origin = origin.into();
        if operations.is_empty() {
            return Err(ProtocolError::EmptyTransaction);
        }
        if let Some(op) = operations.iter().find(|op| op.tag.origin != origin) {
            return Err(ProtocolError::MixedOrigin {
                expected: origin,
                found: op.tag.origin.clone(),
            });
        }
        Ok(Self {
            origin,
            commit_timestamp,
            lsn: None,
            operations,
        })
    }

    /// Sets the stream position.
    pub fn with_lsn(mut self, lsn: Lsn) -> Self {
        self.lsn = Some(lsn);
        self
    }

    /// Operations in their original order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Consumes the transaction, returning its operations.
    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    /// Tables touched by this transaction.
    pub fn tables(&self) -> BTreeSet<String> {
        self.operations.iter().map(|op| op.table.clone()).collect()
    }

    /// Encodes the transaction to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes a transaction, re-checking its invariants.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let decoded: Transaction = from_cbor(bytes)?;
        let lsn = decoded.lsn.clone();
        let tx = Transaction::new(decoded.origin, decoded.commit_timestamp, decoded.operations)?;
        Ok(match lsn {
            Some(lsn) => tx.with_lsn(lsn),
            None => tx,
        })
    }
}
