//! Durable outbound operation log.

use crate::adapter::{DatabaseAdapter, Predicate, Statement};
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::{get_meta_u64, set_meta_u64, OPLOG_ACKED_KEY, OPLOG_NEXT_KEY, OPLOG_TABLE};
use satellite_protocol::{row, Lsn, Row, Transaction, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// A logged local transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// Local position, assigned at append.
    pub position: u64,
    /// The transaction as committed.
    pub transaction: Transaction,
}

impl OplogEntry {
    /// The transaction as sent to the peer: its LSN is the local position.
    pub fn to_wire(&self) -> Transaction {
        self.transaction.clone().with_lsn(Lsn::from_u64(self.position))
    }

    fn from_row(row: &Row) -> SatelliteResult<Self> {
        let position = row
            .get("position")
            .and_then(Value::as_integer)
            .and_then(|p| u64::try_from(p).ok())
            .ok_or_else(|| SatelliteError::storage("oplog row without position"))?;
        let payload = row
            .get("payload")
            .and_then(Value::as_bytes)
            .ok_or_else(|| SatelliteError::storage("oplog row without payload"))?;
        let transaction = Transaction::decode(payload)
            .map_err(|e| SatelliteError::storage(format!("corrupt oplog entry: {e}")))?;
        Ok(Self {
            position,
            transaction,
        })
    }
}

/// Statements for one append, to be committed together with the local write.
#[derive(Debug)]
pub struct PendingAppend {
    /// Position the entry will occupy.
    pub position: u64,
    /// Oplog row and position counter updates.
    pub statements: Vec<Statement>,
}

/// Durable, ordered record of local transactions awaiting acknowledgement.
///
/// # Invariants
///
/// - Positions are assigned in commit order and never reused
/// - An entry exists only if the local write it records committed
/// - Acknowledged entries are never yielded by [`OplogStore::pending`]
pub struct OplogStore<A: ?Sized> {
    adapter: Arc<A>,
    next_position: u64,
    acked_position: u64,
    batch_size: usize,
}

fn position_value(position: u64) -> Value {
    Value::Integer(i64::try_from(position).unwrap_or(i64::MAX))
}

fn position_key(position: u64) -> Row {
    row([("position", position_value(position))])
}

impl<A: DatabaseAdapter + ?Sized> OplogStore<A> {
    /// Opens the log, restoring counters from the metadata table.
    pub fn open(adapter: Arc<A>, batch_size: usize) -> SatelliteResult<Self> {
        let next_position = get_meta_u64(adapter.as_ref(), OPLOG_NEXT_KEY)?.unwrap_or(1);
        let acked_position = get_meta_u64(adapter.as_ref(), OPLOG_ACKED_KEY)?.unwrap_or(0);
        Ok(Self {
            adapter,
            next_position,
            acked_position,
            batch_size: batch_size.max(1),
        })
    }

    /// Prepares an append without committing it.
    ///
    /// The caller commits `statements` in the same adapter transaction as the
    /// local write, then calls [`OplogStore::commit_append`].
    pub fn prepare_append(&self, transaction: &Transaction) -> SatelliteResult<PendingAppend> {
        let position = self.next_position;
        let payload = transaction.encode()?;
        let statements = vec![
            Statement::Upsert {
                table: OPLOG_TABLE.to_string(),
                key: position_key(position),
                values: row([
                    ("origin", Value::from(transaction.origin.as_str())),
                    ("commit_timestamp", position_value(transaction.commit_timestamp)),
                    ("payload", Value::Bytes(payload)),
                ]),
            },
            set_meta_u64(OPLOG_NEXT_KEY, position + 1),
        ];
        Ok(PendingAppend {
            position,
            statements,
        })
    }

    /// Records that a prepared append was committed.
    pub fn commit_append(&mut self, append: &PendingAppend) {
        self.next_position = self.next_position.max(append.position + 1);
    }

    /// Appends a transaction in its own adapter transaction.
    pub fn append(&mut self, transaction: &Transaction) -> SatelliteResult<u64> {
        let append = self.prepare_append(transaction)?;
        self.adapter.transaction(&append.statements)?;
        self.commit_append(&append);
        debug!(position = append.position, "oplog append");
        Ok(append.position)
    }

    /// Unacknowledged entries after `since` (or after the ack boundary), in
    /// commit order. The sequence reads lazily in batches and can be
    /// recreated from any position.
    pub fn pending(&self, since: Option<u64>) -> Pending<'_, A> {
        let after = since.unwrap_or(0).max(self.acked_position);
        Pending {
            store: self,
            after,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Marks every entry up to and including `lsn` as acknowledged.
    ///
    /// Returns false if the acknowledgement does not advance the boundary.
    pub fn acknowledge(&mut self, lsn: &Lsn) -> SatelliteResult<bool> {
        let position = lsn.to_u64().ok_or_else(|| {
            SatelliteError::Protocol(format!("acknowledged lsn {lsn} is not a local position"))
        })?;
        if position >= self.next_position {
            return Err(SatelliteError::Protocol(format!(
                "acknowledged position {position} was never sent"
            )));
        }
        if position <= self.acked_position {
            return Ok(false);
        }
        self.adapter
            .transaction(&[set_meta_u64(OPLOG_ACKED_KEY, position)])?;
        self.acked_position = position;
        debug!(position, "oplog acknowledged");
        Ok(true)
    }

    /// Removes acknowledged entries. Returns how many were removed.
    pub fn compact(&mut self) -> SatelliteResult<u64> {
        let removed = self.adapter.execute(&Statement::DeleteWhere {
            table: OPLOG_TABLE.to_string(),
            predicate: Predicate::Le("position".into(), position_value(self.acked_position)),
        })?;
        if removed > 0 {
            debug!(removed, "oplog compacted");
        }
        Ok(removed)
    }

    /// Highest acknowledged position.
    pub fn acked_position(&self) -> u64 {
        self.acked_position
    }

    /// Number of entries still stored (acknowledged or not).
    pub fn len(&self) -> SatelliteResult<usize> {
        Ok(self
            .adapter
            .query(&Statement::select(OPLOG_TABLE, Predicate::All))?
            .len())
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> SatelliteResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Highest commit timestamp stored, used to seed the tag clock.
    pub fn max_timestamp(&self) -> SatelliteResult<u64> {
        let rows = self
            .adapter
            .query(&Statement::select(OPLOG_TABLE, Predicate::All))?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get("commit_timestamp").and_then(Value::as_integer))
            .filter_map(|t| u64::try_from(t).ok())
            .max()
            .unwrap_or(0))
    }

    fn read_batch(&self, after: u64) -> SatelliteResult<Vec<OplogEntry>> {
        let rows = self.adapter.query(&Statement::Select {
            table: OPLOG_TABLE.to_string(),
            predicate: Predicate::Gt("position".into(), position_value(after)),
            order_by: Some("position".into()),
            limit: Some(self.batch_size),
        })?;
        rows.iter().map(OplogEntry::from_row).collect()
    }
}

/// Lazy iterator over pending oplog entries.
pub struct Pending<'a, A: ?Sized> {
    store: &'a OplogStore<A>,
    after: u64,
    buffer: VecDeque<OplogEntry>,
    exhausted: bool,
}

impl<A: DatabaseAdapter + ?Sized> Iterator for Pending<'_, A> {
    type Item = SatelliteResult<OplogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.read_batch(self.after) {
                Ok(batch) => {
                    self.exhausted = batch.len() < self.store.batch_size;
                    self.buffer.extend(batch);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let entry = self.buffer.pop_front()?;
        self.after = entry.position;
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use satellite_protocol::{Operation, Tag};

    fn tx(ts: u64) -> Transaction {
        Transaction::new(
            "c1",
            ts,
            vec![Operation::insert(
                "items",
                row([("id", ts as i64)]),
                row([("n", 1)]),
                Tag::new("c1", ts),
            )],
        )
        .unwrap()
    }

    fn store(db: &Arc<MemoryAdapter>) -> OplogStore<MemoryAdapter> {
        OplogStore::open(Arc::clone(db), 2).unwrap()
    }

    fn positions(store: &OplogStore<MemoryAdapter>, since: Option<u64>) -> Vec<u64> {
        store
            .pending(since)
            .map(|e| e.unwrap().position)
            .collect()
    }

    #[test]
    fn append_assigns_positions_in_order() {
        let db = Arc::new(MemoryAdapter::new());
        let mut log = store(&db);
        assert_eq!(log.append(&tx(10)).unwrap(), 1);
        assert_eq!(log.append(&tx(11)).unwrap(), 2);
        assert_eq!(log.append(&tx(12)).unwrap(), 3);

        // Batch size 2 forces a second read.
        assert_eq!(positions(&log, None), vec![1, 2, 3]);
        assert_eq!(positions(&log, Some(2)), vec![3]);
    }

    #[test]
    fn pending_is_restartable() {
        let db = Arc::new(MemoryAdapter::new());
        let mut log = store(&db);
        for ts in 1..=5 {
            log.append(&tx(ts)).unwrap();
        }
        let first: Vec<_> = log.pending(None).take(2).map(|e| e.unwrap()).collect();
        let again: Vec<_> = log.pending(None).take(2).map(|e| e.unwrap()).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn acknowledge_and_compact() {
        let db = Arc::new(MemoryAdapter::new());
        let mut log = store(&db);
        for ts in 1..=3 {
            log.append(&tx(ts)).unwrap();
        }

        assert!(log.acknowledge(&Lsn::from_u64(2)).unwrap());
        assert_eq!(positions(&log, None), vec![3]);
        assert!(!log.acknowledge(&Lsn::from_u64(1)).unwrap());

        assert_eq!(log.compact().unwrap(), 2);
        assert_eq!(log.len().unwrap(), 1);
    }

    #[test]
    fn acknowledge_rejects_unknown_positions() {
        let db = Arc::new(MemoryAdapter::new());
        let mut log = store(&db);
        log.append(&tx(1)).unwrap();
        assert!(log.acknowledge(&Lsn::from_u64(7)).is_err());
        assert!(log.acknowledge(&Lsn::from_bytes(vec![1])).is_err());
    }

    #[test]
    fn state_survives_reopen() {
        let db = Arc::new(MemoryAdapter::new());
        {
            let mut log = store(&db);
            log.append(&tx(1)).unwrap();
            log.append(&tx(2)).unwrap();
            log.acknowledge(&Lsn::from_u64(1)).unwrap();
        }
        let mut log = store(&db);
        assert_eq!(positions(&log, None), vec![2]);
        assert_eq!(log.append(&tx(3)).unwrap(), 3);
        assert_eq!(log.max_timestamp().unwrap(), 3);
    }

    #[test]
    fn failed_append_leaves_no_entry() {
        let db = Arc::new(MemoryAdapter::new());
        let mut log = store(&db);
        db.fail_next(1);
        assert!(log.append(&tx(1)).is_err());
        assert!(log.is_empty().unwrap());
        assert_eq!(log.append(&tx(2)).unwrap(), 1);
    }
}
