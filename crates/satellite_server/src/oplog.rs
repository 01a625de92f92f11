//! Server-side transaction log.

use crate::error::{ServerError, ServerResult};
use satellite_protocol::{Lsn, Transaction};
use std::collections::VecDeque;

/// Server-side transaction log.
///
/// The log maintains:
/// - Every accepted transaction in commit order, stamped with a server LSN
/// - The next LSN to issue
/// - A retention window; positions older than the window can no longer be
///   resumed from
#[derive(Debug)]
pub struct ServerOplog {
    entries: VecDeque<(u64, Transaction)>,
    next: u64,
    first_retained: u64,
}

impl ServerOplog {
    /// Creates an empty log. The first transaction gets LSN 1.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next: 1,
            first_retained: 1,
        }
    }

    /// Highest issued LSN, 0 before the first transaction.
    pub fn head(&self) -> u64 {
        self.next - 1
    }

    /// Oldest LSN still retained.
    pub fn first_retained(&self) -> u64 {
        self.first_retained
    }

    /// Appends a transaction, returning it stamped with its server LSN.
    pub fn append(&mut self, transaction: Transaction) -> Transaction {
        let lsn = self.next;
        self.next += 1;
        let stamped = transaction.with_lsn(Lsn::from_u64(lsn));
        self.entries.push_back((lsn, stamped.clone()));
        stamped
    }

    /// Transactions after `lsn`, in commit order.
    ///
    /// The beginning LSN resumes at the head: a client without a position
    /// receives existing data through shape deliveries, not the log.
    pub fn since(&self, lsn: &Lsn) -> ServerResult<Vec<Transaction>> {
        if lsn.is_beginning() {
            return Ok(Vec::new());
        }
        let after = lsn
            .to_u64()
            .ok_or_else(|| ServerError::InvalidPosition(format!("malformed lsn {lsn}")))?;
        if after > self.head() {
            return Err(ServerError::InvalidPosition(format!(
                "lsn {after} is ahead of head {}",
                self.head()
            )));
        }
        if after + 1 < self.first_retained {
            return Err(ServerError::BehindWindow(format!(
                "lsn {after} is older than the retained window starting at {}",
                self.first_retained
            )));
        }
        Ok(self
            .entries
            .iter()
            .filter(|(position, _)| *position > after)
            .map(|(_, transaction)| transaction.clone())
            .collect())
    }

    /// Discards transactions with an LSN below `lsn`.
    pub fn compact_before(&mut self, lsn: u64) {
        let bound = lsn.min(self.next);
        while self.entries.front().is_some_and(|(position, _)| *position < bound) {
            self.entries.pop_front();
        }
        self.first_retained = self.first_retained.max(bound);
    }

    /// Retained transactions, in commit order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.entries.iter().map(|(_, t)| t.clone()).collect()
    }

    /// Number of retained transactions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ServerOplog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_protocol::{row, Operation, Tag};

    fn make_tx(id: i64) -> Transaction {
        let op = Operation::insert(
            "items",
            row([("id", id)]),
            row([("title", "x")]),
            Tag::new("c1", id as u64),
        );
        Transaction::new("c1", id as u64, vec![op]).unwrap()
    }

    #[test]
    fn empty_oplog() {
        let oplog = ServerOplog::new();
        assert_eq!(oplog.head(), 0);
        assert!(oplog.is_empty());
        assert!(oplog.since(&Lsn::beginning()).unwrap().is_empty());
        assert!(oplog.since(&Lsn::from_u64(0)).unwrap().is_empty());
    }

    #[test]
    fn append_stamps_lsns() {
        let mut oplog = ServerOplog::new();
        let first = oplog.append(make_tx(1));
        let second = oplog.append(make_tx(2));
        assert_eq!(first.lsn, Some(Lsn::from_u64(1)));
        assert_eq!(second.lsn, Some(Lsn::from_u64(2)));
        assert_eq!(oplog.head(), 2);
        assert_eq!(oplog.len(), 2);
    }

    #[test]
    fn since_position() {
        let mut oplog = ServerOplog::new();
        for id in 1..=3 {
            oplog.append(make_tx(id));
        }
        assert_eq!(oplog.since(&Lsn::from_u64(0)).unwrap().len(), 3);
        let rest = oplog.since(&Lsn::from_u64(2)).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].lsn, Some(Lsn::from_u64(3)));
        // Beginning resumes at the head.
        assert!(oplog.since(&Lsn::beginning()).unwrap().is_empty());
    }

    #[test]
    fn invalid_positions() {
        let mut oplog = ServerOplog::new();
        oplog.append(make_tx(1));
        assert!(matches!(
            oplog.since(&Lsn::from_u64(5)),
            Err(ServerError::InvalidPosition(_))
        ));
        assert!(matches!(
            oplog.since(&Lsn::from_bytes(vec![1, 2])),
            Err(ServerError::InvalidPosition(_))
        ));
    }

    #[test]
    fn compaction_window() {
        let mut oplog = ServerOplog::new();
        for id in 1..=5 {
            oplog.append(make_tx(id));
        }
        oplog.compact_before(4);
        assert_eq!(oplog.len(), 2);
        assert_eq!(oplog.first_retained(), 4);

        // Position 3 still resumes: everything after it is retained.
        assert_eq!(oplog.since(&Lsn::from_u64(3)).unwrap().len(), 2);
        assert!(matches!(
            oplog.since(&Lsn::from_u64(2)),
            Err(ServerError::BehindWindow(_))
        ));
    }
}
