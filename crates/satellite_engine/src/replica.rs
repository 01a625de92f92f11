//! The local replica: everything a process knows about its database.
//!
//! All mutable state sits behind one lock. Inbound handlers take the session
//! epoch they were started with and do nothing once it is stale, so frames
//! from a torn-down session are never applied.

use crate::adapter::DatabaseAdapter;
use crate::apply::{clear_tables, fold_operations, Applier, Relations};
use crate::clock::TagClock;
use crate::config::{CompensationPolicy, SatelliteConfig};
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::{
    get_meta, is_reserved_table, set_meta, CLIENT_ID_KEY, LSN_KEY, SUBSCRIPTIONS_KEY,
};
use crate::notifier::{ChangeOrigin, Notifier, TableChange};
use crate::oplog::OplogStore;
use crate::session::SessionState;
use crate::shapes::{
    Outgoing, ShapeSubscriptionManager, SubscriptionHandle, SubscriptionInfo,
};
use parking_lot::{Mutex, MutexGuard};
use satellite_protocol::{
    DataChange, Lsn, Operation, Relation, Row, SatelliteMessage, ShapeDefinition,
    SubscriptionDataBegin, SubscriptionDataError, SubscriptionResponse, Tag, Transaction,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A local write, before it is tagged.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    /// Create a row.
    Insert {
        /// Table.
        table: String,
        /// Primary key.
        key: Row,
        /// Non-key columns.
        values: Row,
    },
    /// Change some columns of a row.
    Update {
        /// Table.
        table: String,
        /// Primary key.
        key: Row,
        /// Changed columns.
        values: Row,
    },
    /// Remove a row.
    Delete {
        /// Table.
        table: String,
        /// Primary key.
        key: Row,
    },
}

impl LocalChange {
    /// Creates an insert.
    pub fn insert(table: impl Into<String>, key: Row, values: Row) -> Self {
        LocalChange::Insert {
            table: table.into(),
            key,
            values,
        }
    }

    /// Creates an update.
    pub fn update(table: impl Into<String>, key: Row, values: Row) -> Self {
        LocalChange::Update {
            table: table.into(),
            key,
            values,
        }
    }

    /// Creates a delete.
    pub fn delete(table: impl Into<String>, key: Row) -> Self {
        LocalChange::Delete {
            table: table.into(),
            key,
        }
    }

    /// Target table.
    pub fn table(&self) -> &str {
        match self {
            LocalChange::Insert { table, .. }
            | LocalChange::Update { table, .. }
            | LocalChange::Delete { table, .. } => table,
        }
    }

    pub(crate) fn into_operation(self, tag: Tag) -> Operation {
        match self {
            LocalChange::Insert { table, key, values } => Operation::insert(table, key, values, tag),
            LocalChange::Update { table, key, values } => Operation::update(table, key, values, tag),
            LocalChange::Delete { table, key } => Operation::delete(table, key, tag),
        }
    }
}

/// Messages to send on the next flush.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    pub(crate) messages: Vec<SatelliteMessage>,
    /// More oplog entries are waiting beyond this batch.
    pub(crate) more: bool,
}

struct ReplicaState {
    oplog: OplogStore<dyn DatabaseAdapter>,
    relations: Relations,
    shapes: ShapeSubscriptionManager,
    lsn: Lsn,
    epoch: u64,
    session: SessionState,
    // Highest oplog position sent in the current session.
    sent: u64,
    fatal: Option<SatelliteError>,
}

pub(crate) struct Replica {
    db_name: String,
    adapter: Arc<dyn DatabaseAdapter>,
    notifier: Arc<dyn Notifier>,
    policy: CompensationPolicy,
    batch_size: usize,
    clock: TagClock,
    wakeup: Arc<Notify>,
    state: Mutex<ReplicaState>,
}

impl Replica {
    /// Loads persisted state, creating the client id on first use.
    pub(crate) fn open(
        config: &SatelliteConfig,
        adapter: Arc<dyn DatabaseAdapter>,
        notifier: Arc<dyn Notifier>,
        schema: &[Relation],
        wakeup: Arc<Notify>,
    ) -> SatelliteResult<Self> {
        let stored_id = get_meta(adapter.as_ref(), CLIENT_ID_KEY)?
            .map(String::from_utf8)
            .transpose()
            .map_err(|_| SatelliteError::storage("client id is not utf-8"))?;
        let client_id = match (&config.client_id, stored_id) {
            (Some(id), _) => id.clone(),
            (None, Some(id)) => id,
            (None, None) => {
                let id = Uuid::new_v4().to_string();
                adapter.transaction(&[set_meta(CLIENT_ID_KEY, id.clone().into_bytes())])?;
                info!(db = %config.db_name, client_id = %id, "generated client id");
                id
            }
        };

        let oplog = OplogStore::open(Arc::clone(&adapter), config.outbound_batch_size)?;
        let clock = TagClock::new(client_id);
        clock.observe(oplog.max_timestamp()?);

        let shapes = ShapeSubscriptionManager::restore(
            get_meta(adapter.as_ref(), SUBSCRIPTIONS_KEY)?.as_deref(),
        )?;
        let lsn = get_meta(adapter.as_ref(), LSN_KEY)?
            .map(Lsn::from_bytes)
            .unwrap_or_default();
        let relations = schema
            .iter()
            .map(|r| (r.table.clone(), r.clone()))
            .collect();

        debug!(db = %config.db_name, lsn = %lsn, acked = oplog.acked_position(), "replica opened");
        let sent = oplog.acked_position();
        Ok(Self {
            db_name: config.db_name.clone(),
            adapter,
            notifier,
            policy: config.compensation,
            batch_size: config.outbound_batch_size.max(1),
            clock,
            wakeup,
            state: Mutex::new(ReplicaState {
                oplog,
                relations,
                shapes,
                lsn,
                epoch: 0,
                session: SessionState::Disconnected,
                sent,
                fatal: None,
            }),
        })
    }

    pub(crate) fn client_id(&self) -> &str {
        self.clock.origin()
    }

    pub(crate) fn db_name(&self) -> &str {
        &self.db_name
    }

    /// The unrecoverable error that stopped this replica, if any.
    pub(crate) fn fatal(&self) -> Option<SatelliteError> {
        self.state.lock().fatal.clone()
    }

    /// Records an unrecoverable error; every later operation fails with it.
    pub(crate) fn poison(&self, err: SatelliteError) {
        let mut state = self.state.lock();
        if state.fatal.is_none() {
            error!(db = %self.db_name, error = %err, "satellite process failed");
            state.fatal = Some(err);
        }
        drop(state);
        self.wakeup.notify_one();
    }

    fn lock_healthy(&self) -> SatelliteResult<MutexGuard<'_, ReplicaState>> {
        let state = self.state.lock();
        if let Some(err) = &state.fatal {
            return Err(err.clone());
        }
        Ok(state)
    }

    /// Locks the state if `epoch` is still the live session.
    fn lock_session(&self, epoch: u64) -> SatelliteResult<Option<MutexGuard<'_, ReplicaState>>> {
        let state = self.lock_healthy()?;
        if state.epoch != epoch {
            debug!(db = %self.db_name, epoch, "dropping work from a closed session");
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Fails with the fatal error when `result` is one, poisoning the replica.
    fn check<T>(&self, result: SatelliteResult<T>) -> SatelliteResult<T> {
        if let Err(err) = &result {
            if err.is_fatal_to_process() {
                self.poison(err.clone());
            }
        }
        result
    }

    fn notify(&self, tables: BTreeSet<String>, origin: ChangeOrigin) {
        if tables.is_empty() {
            return;
        }
        self.notifier.tables_changed(&TableChange {
            db_name: self.db_name.clone(),
            tables,
            origin,
        });
    }

    pub(crate) fn session_state(&self) -> SessionState {
        self.state.lock().session
    }

    /// Last applied inbound LSN.
    pub(crate) fn lsn(&self) -> Lsn {
        self.state.lock().lsn.clone()
    }

    /// Starts a new session, invalidating any previous one.
    pub(crate) fn begin_session(&self) -> SatelliteResult<u64> {
        let mut state = self.lock_healthy()?;
        state.epoch += 1;
        state.session = SessionState::Authenticating;
        state.sent = state.oplog.acked_position();
        Ok(state.epoch)
    }

    pub(crate) fn set_session_state(&self, epoch: u64, session: SessionState) {
        let mut state = self.state.lock();
        if state.epoch == epoch {
            debug!(db = %self.db_name, from = ?state.session, to = ?session, "session state");
            state.session = session;
        }
    }

    /// Resume point and subscriptions to re-assert.
    pub(crate) fn resume_point(&self) -> (Lsn, Vec<String>) {
        let state = self.state.lock();
        (state.lsn.clone(), state.shapes.fulfilled_ids())
    }

    /// Ends the session `epoch`, or whichever session is live when `None`.
    pub(crate) fn end_session(&self, epoch: Option<u64>) {
        let mut state = self.state.lock();
        if epoch.is_some_and(|e| e != state.epoch) {
            return;
        }
        state.epoch += 1;
        state.session = SessionState::Disconnected;
        state.shapes.on_session_end();
    }

    pub(crate) fn apply_relation(&self, epoch: u64, relation: Relation) -> SatelliteResult<()> {
        let Some(mut state) = self.lock_session(epoch)? else {
            return Ok(());
        };
        debug!(db = %self.db_name, table = %relation.table, "relation received");
        state.relations.insert(relation.table.clone(), relation);
        Ok(())
    }

    /// Merges one inbound transaction and advances the LSN in the same
    /// local transaction.
    pub(crate) fn apply_transaction(&self, epoch: u64, transaction: Transaction) -> SatelliteResult<()> {
        let result = self.apply_transaction_inner(epoch, transaction);
        self.check(result)
    }

    fn apply_transaction_inner(&self, epoch: u64, transaction: Transaction) -> SatelliteResult<()> {
        let Some(mut guard) = self.lock_session(epoch)? else {
            return Ok(());
        };
        let state = &mut *guard;
        let lsn = transaction
            .lsn
            .clone()
            .ok_or_else(|| SatelliteError::Protocol("inbound transaction without lsn".into()))?;
        if lsn <= state.lsn {
            debug!(db = %self.db_name, lsn = %lsn, "skipping already applied transaction");
            return Ok(());
        }

        let active = state.shapes.active_tables();
        let own = transaction.origin == self.client_id();
        let max_timestamp = transaction
            .operations()
            .iter()
            .map(|op| op.tag.timestamp)
            .max()
            .unwrap_or(0);

        let mut applier = Applier::new(self.adapter.as_ref(), &state.relations, self.policy);
        if !own {
            for op in fold_operations(transaction.into_operations(), &state.relations) {
                if !active.contains(&op.table) {
                    debug!(db = %self.db_name, table = %op.table, "dropping change outside active shapes");
                    continue;
                }
                applier.apply(&op)?;
            }
        }
        let staged = applier.finish()?;
        let mut statements = staged.statements;
        statements.push(set_meta(LSN_KEY, lsn.as_bytes().to_vec()));
        self.adapter.transaction(&statements)?;

        state.lsn = lsn;
        drop(guard);
        self.clock.observe(max_timestamp);
        self.notify(staged.tables, ChangeOrigin::Remote);
        Ok(())
    }

    pub(crate) fn acknowledge(&self, epoch: u64, lsn: &Lsn) -> SatelliteResult<()> {
        let result = self.acknowledge_inner(epoch, lsn);
        self.check(result)
    }

    fn acknowledge_inner(&self, epoch: u64, lsn: &Lsn) -> SatelliteResult<()> {
        let Some(mut state) = self.lock_session(epoch)? else {
            return Ok(());
        };
        if state.oplog.acknowledge(lsn)? {
            state.oplog.compact()?;
        }
        Ok(())
    }

    pub(crate) fn on_subscription_response(
        &self,
        epoch: u64,
        response: &SubscriptionResponse,
    ) -> SatelliteResult<()> {
        if let Some(mut state) = self.lock_session(epoch)? {
            state.shapes.on_response(response);
        }
        Ok(())
    }

    pub(crate) fn on_data_begin(&self, epoch: u64, begin: SubscriptionDataBegin) -> SatelliteResult<()> {
        let result = self.begin_delivery(epoch, begin);
        self.check(result)
    }

    fn begin_delivery(&self, epoch: u64, begin: SubscriptionDataBegin) -> SatelliteResult<()> {
        let Some(mut state) = self.lock_session(epoch)? else {
            return Ok(());
        };
        if !state.shapes.begin(&begin.subscription_id, begin.lsn)? {
            debug!(
                db = %self.db_name,
                subscription_id = %begin.subscription_id,
                "dropping delivery for cancelled subscription"
            );
        }
        Ok(())
    }

    pub(crate) fn on_data_change(&self, epoch: u64, change: DataChange) -> SatelliteResult<()> {
        let result = match self.lock_session(epoch) {
            Ok(Some(mut state)) => state.shapes.data(change),
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        self.check(result)
    }

    /// Applies a completed delivery and persists the subscription as
    /// fulfilled, both in one local transaction.
    pub(crate) fn on_data_commit(&self, epoch: u64, subscription_id: &str) -> SatelliteResult<()> {
        let result = self.commit_delivery(epoch, subscription_id);
        self.check(result)
    }

    fn commit_delivery(&self, epoch: u64, subscription_id: &str) -> SatelliteResult<()> {
        let Some(mut guard) = self.lock_session(epoch)? else {
            return Ok(());
        };
        let state = &mut *guard;
        let Some(delivery) = state.shapes.commit(subscription_id)? else {
            return Ok(());
        };

        let applied = self.apply_delivery(
            state,
            subscription_id,
            &delivery.operations,
            &delivery.lsn,
        );
        match applied {
            Ok(tables) => {
                if delivery.lsn > state.lsn {
                    state.lsn = delivery.lsn.clone();
                }
                info!(
                    db = %self.db_name,
                    subscription_id,
                    rows = delivery.operations.len(),
                    lsn = %delivery.lsn,
                    "shape data applied"
                );
                state.shapes.mark_fulfilled(subscription_id, delivery.lsn);
                drop(guard);
                self.notify(tables, ChangeOrigin::Remote);
                Ok(())
            }
            Err(err) => {
                state.shapes.fail(subscription_id, err.clone());
                Err(err)
            }
        }
    }

    fn apply_delivery(
        &self,
        state: &ReplicaState,
        subscription_id: &str,
        operations: &[Operation],
        lsn: &Lsn,
    ) -> SatelliteResult<BTreeSet<String>> {
        let mut applier = Applier::new(self.adapter.as_ref(), &state.relations, self.policy);
        for op in operations {
            applier.apply(op)?;
        }
        let staged = applier.finish()?;
        let mut statements = staged.statements;
        statements.push(set_meta(
            SUBSCRIPTIONS_KEY,
            state.shapes.serialize_with(Some(subscription_id))?,
        ));
        // The snapshot already reflects every stream position up to `lsn`.
        if *lsn > state.lsn {
            statements.push(set_meta(LSN_KEY, lsn.as_bytes().to_vec()));
        }
        self.adapter.transaction(&statements)?;
        Ok(staged.tables)
    }

    pub(crate) fn on_data_error(&self, epoch: u64, error: &SubscriptionDataError) -> SatelliteResult<()> {
        if let Some(mut state) = self.lock_session(epoch)? {
            state
                .shapes
                .delivery_error(&error.subscription_id, &error.error);
        }
        Ok(())
    }

    /// Pending subscription requests and the next batch of oplog entries.
    pub(crate) fn outbound(&self, epoch: u64) -> SatelliteResult<Outbound> {
        let result = self.outbound_inner(epoch);
        self.check(result)
    }

    fn outbound_inner(&self, epoch: u64) -> SatelliteResult<Outbound> {
        let Some(mut guard) = self.lock_session(epoch)? else {
            return Ok(Outbound::default());
        };
        let state = &mut *guard;
        let mut messages: Vec<SatelliteMessage> = state
            .shapes
            .take_outgoing(Instant::now())
            .into_iter()
            .map(|outgoing| match outgoing {
                Outgoing::Subscribe(request) => SatelliteMessage::SubscriptionRequest(request),
                Outgoing::Unsubscribe(request) => SatelliteMessage::UnsubscribeRequest(request),
            })
            .collect();

        let mut entries = state.oplog.pending(Some(state.sent));
        let mut batch = Vec::new();
        for entry in entries.by_ref().take(self.batch_size) {
            batch.push(entry?);
        }
        let more = match entries.next() {
            Some(entry) => {
                entry?;
                true
            }
            None => false,
        };
        drop(entries);

        if let Some(last) = batch.last() {
            state.sent = last.position;
            debug!(db = %self.db_name, count = batch.len(), up_to = last.position, "sending oplog batch");
        }
        messages.extend(
            batch
                .iter()
                .map(|entry| SatelliteMessage::Transaction(entry.to_wire())),
        );
        Ok(Outbound { messages, more })
    }

    /// Fails subscriptions whose delivery has taken longer than `timeout`.
    pub(crate) fn expire(&self, epoch: u64, timeout: Duration) -> SatelliteResult<()> {
        if let Some(mut state) = self.lock_session(epoch)? {
            for id in state.shapes.expire(Instant::now(), timeout) {
                warn!(db = %self.db_name, subscription_id = %id, "shape delivery timed out");
            }
        }
        Ok(())
    }

    /// Forgets the inbound position and all shape data so that replication
    /// restarts from scratch.
    pub(crate) fn reset_for_resync(&self) -> SatelliteResult<()> {
        let result = self.reset_inner();
        self.check(result)
    }

    fn reset_inner(&self) -> SatelliteResult<()> {
        let mut guard = self.lock_healthy()?;
        let state = &mut *guard;
        let tables = state.shapes.reset_for_resync();
        let mut statements = clear_tables(&tables);
        statements.push(set_meta(LSN_KEY, Vec::new()));
        statements.push(set_meta(SUBSCRIPTIONS_KEY, state.shapes.serialize()?));
        self.adapter.transaction(&statements)?;
        state.lsn = Lsn::beginning();
        drop(guard);
        warn!(db = %self.db_name, tables = ?tables, "cleared shape data for full resync");
        self.notify(tables, ChangeOrigin::Remote);
        Ok(())
    }

    /// Applies local changes and logs them for replication, atomically.
    pub(crate) fn transact(&self, changes: Vec<LocalChange>) -> SatelliteResult<Transaction> {
        let result = self.transact_inner(changes);
        if result.is_ok() {
            self.wakeup.notify_one();
        }
        self.check(result)
    }

    fn transact_inner(&self, changes: Vec<LocalChange>) -> SatelliteResult<Transaction> {
        if changes.is_empty() {
            return Err(SatelliteError::InvalidChange(
                "a transaction needs at least one change".into(),
            ));
        }
        let mut guard = self.lock_healthy()?;
        let state = &mut *guard;
        if let Some(change) = changes
            .iter()
            .find(|c| is_reserved_table(c.table()) || !state.relations.contains_key(c.table()))
        {
            return Err(SatelliteError::TableNotFound(change.table().to_string()));
        }

        // One tag per transaction: repeated changes to a row fold into one.
        let tag = self.clock.next();
        let operations = changes
            .into_iter()
            .map(|change| change.into_operation(tag.clone()))
            .collect();
        let operations = fold_operations(operations, &state.relations);
        let transaction = Transaction::new(self.client_id(), tag.timestamp, operations)
            .map_err(|e| SatelliteError::InvalidChange(e.to_string()))?;

        let mut applier = Applier::new(self.adapter.as_ref(), &state.relations, self.policy);
        for op in transaction.operations() {
            applier.apply(op)?;
        }
        let staged = applier.finish()?;
        let append = state.oplog.prepare_append(&transaction)?;
        let mut statements = staged.statements;
        statements.extend(append.statements.iter().cloned());
        self.adapter.transaction(&statements)?;
        state.oplog.commit_append(&append);
        drop(guard);

        debug!(db = %self.db_name, position = append.position, tag = %tag, "local transaction committed");
        let mut tables = transaction.tables();
        tables.extend(staged.tables);
        self.notify(tables, ChangeOrigin::Local);
        Ok(transaction)
    }

    pub(crate) fn subscribe(&self, definitions: Vec<ShapeDefinition>) -> SatelliteResult<SubscriptionHandle> {
        let handle = {
            let mut guard = self.lock_healthy()?;
            let state = &mut *guard;
            let relations = &state.relations;
            state.shapes.subscribe(definitions, |table| {
                !is_reserved_table(table) && relations.contains_key(table)
            })?
        };
        self.wakeup.notify_one();
        Ok(handle)
    }

    pub(crate) fn unsubscribe(&self, subscription_id: &str) -> SatelliteResult<()> {
        let result = self.release(|shapes| shapes.unsubscribe(subscription_id));
        self.check(result)
    }

    pub(crate) fn unsubscribe_all(&self) -> SatelliteResult<Vec<String>> {
        let result = self.release(|shapes| Ok(shapes.unsubscribe_all()));
        self.check(result)
    }

    /// Runs a release on the subscription set, then removes the data of
    /// tables no remaining subscription covers and persists what remains,
    /// in one local transaction.
    fn release<T>(
        &self,
        f: impl FnOnce(&mut ShapeSubscriptionManager) -> SatelliteResult<T>,
    ) -> SatelliteResult<T> {
        let mut guard = self.lock_healthy()?;
        let state = &mut *guard;
        let delivered = state.shapes.fulfilled_tables();
        let released = f(&mut state.shapes)?;
        let remaining = state.shapes.active_tables();
        let gone: BTreeSet<String> = delivered.difference(&remaining).cloned().collect();

        let mut statements = clear_tables(&gone);
        statements.push(set_meta(SUBSCRIPTIONS_KEY, state.shapes.serialize()?));
        self.adapter.transaction(&statements)?;
        drop(guard);

        if !gone.is_empty() {
            info!(db = %self.db_name, tables = ?gone, "removed data of released shapes");
        }
        self.notify(gone, ChangeOrigin::Local);
        self.wakeup.notify_one();
        Ok(released)
    }

    pub(crate) fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.state.lock().shapes.info()
    }

    /// Number of local transactions not yet acknowledged by the peer.
    pub(crate) fn pending_count(&self) -> SatelliteResult<usize> {
        let state = self.state.lock();
        let mut count = 0;
        for entry in state.oplog.pending(None) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::notifier::ChannelNotifier;
    use crate::meta::SHADOW_TABLE;
    use crate::shapes::SubscriptionState;
    use satellite_protocol::{row, ColumnType, Tag, Value};

    fn schema() -> Vec<Relation> {
        vec![Relation::new("items")
            .with_key("id", ColumnType::Integer)
            .with_column("title", ColumnType::Text)]
    }

    fn open(adapter: &Arc<MemoryAdapter>) -> (Replica, tokio::sync::broadcast::Receiver<TableChange>) {
        let notifier = Arc::new(ChannelNotifier::default());
        let changes = notifier.subscribe();
        let replica = Replica::open(
            &SatelliteConfig::new("app.db"),
            Arc::clone(adapter) as Arc<dyn DatabaseAdapter>,
            notifier,
            &schema(),
            Arc::new(Notify::new()),
        )
        .unwrap();
        (replica, changes)
    }

    fn remote(lsn: u64, id: i64, title: &str) -> Transaction {
        let tag = Tag::new("server", lsn * 10);
        Transaction::new(
            "server",
            tag.timestamp,
            vec![Operation::insert(
                "items",
                row([("id", id)]),
                row([("title", title)]),
                tag,
            )],
        )
        .unwrap()
        .with_lsn(Lsn::from_u64(lsn))
    }

    #[test]
    fn client_id_is_generated_once() {
        let adapter = Arc::new(MemoryAdapter::new());
        let (first, _) = open(&adapter);
        let (second, _) = open(&adapter);
        assert_eq!(first.client_id(), second.client_id());
        assert!(!first.client_id().is_empty());
    }

    #[test]
    fn transact_writes_data_and_oplog_together() {
        let adapter = Arc::new(MemoryAdapter::new());
        let (replica, mut changes) = open(&adapter);

        let txn = replica
            .transact(vec![LocalChange::insert(
                "items",
                row([("id", 1)]),
                row([("title", "a")]),
            )])
            .unwrap();
        assert_eq!(txn.origin, replica.client_id());
        assert_eq!(
            adapter.row("items", &row([("id", 1)])).unwrap()["title"],
            Value::from("a")
        );
        assert_eq!(replica.pending_count().unwrap(), 1);
        assert_eq!(changes.try_recv().unwrap().origin, ChangeOrigin::Local);

        adapter.fail_next(1);
        let err = replica
            .transact(vec![LocalChange::insert("items", row([("id", 2)]), Row::new())])
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Storage);
        assert!(adapter.row("items", &row([("id", 2)])).is_none());
        assert_eq!(replica.pending_count().unwrap(), 1);
        assert!(replica.fatal().is_some());
    }

    #[test]
    fn repeated_changes_to_a_row_apply_in_order() {
        let adapter = Arc::new(MemoryAdapter::new());
        let (replica, _) = open(&adapter);
        replica
            .transact(vec![LocalChange::insert(
                "items",
                row([("id", 2)]),
                row([("title", "old")]),
            )])
            .unwrap();

        let txn = replica
            .transact(vec![
                LocalChange::insert("items", row([("id", 1)]), row([("title", "a")])),
                LocalChange::update("items", row([("id", 1)]), row([("title", "b")])),
                LocalChange::delete("items", row([("id", 2)])),
                LocalChange::insert("items", row([("id", 2)]), row([("title", "x")])),
                LocalChange::delete("items", row([("id", 3)])),
                LocalChange::insert("items", row([("id", 3)]), Row::new()),
            ])
            .unwrap();
        assert_eq!(txn.operations().len(), 3);
        let title = |id: i64| adapter.row("items", &row([("id", id)])).map(|r| r["title"].clone());
        assert_eq!(title(1), Some(Value::from("b")));
        assert_eq!(title(2), Some(Value::from("x")));
        assert_eq!(title(3), Some(Value::Null));
    }

    #[test]
    fn transact_rejects_unknown_tables() {
        let adapter = Arc::new(MemoryAdapter::new());
        let (replica, _) = open(&adapter);
        assert_eq!(
            replica.transact(vec![LocalChange::delete("ghosts", row([("id", 1)]))]),
            Err(SatelliteError::TableNotFound("ghosts".into()))
        );
        assert!(matches!(
            replica.transact(Vec::new()),
            Err(SatelliteError::InvalidChange(_))
        ));
        assert!(replica.fatal().is_none());
    }

    #[test]
    fn inbound_transactions_skip_duplicates_and_stale_sessions() {
        let adapter = Arc::new(MemoryAdapter::new());
        let (replica, _) = open(&adapter);
        replica
            .subscribe(vec![ShapeDefinition::table("items")])
            .unwrap();
        let epoch = replica.begin_session().unwrap();

        replica.apply_transaction(epoch, remote(2, 1, "a")).unwrap();
        replica.apply_transaction(epoch, remote(1, 2, "old")).unwrap();
        assert_eq!(replica.lsn(), Lsn::from_u64(2));
        assert!(adapter.row("items", &row([("id", 2)])).is_none());

        replica.end_session(Some(epoch));
        replica.apply_transaction(epoch, remote(3, 3, "late")).unwrap();
        assert!(adapter.row("items", &row([("id", 3)])).is_none());
        assert_eq!(replica.lsn(), Lsn::from_u64(2));
    }

    #[test]
    fn lsn_survives_restart() {
        let adapter = Arc::new(MemoryAdapter::new());
        {
            let (replica, _) = open(&adapter);
            replica
                .subscribe(vec![ShapeDefinition::table("items")])
                .unwrap();
            let epoch = replica.begin_session().unwrap();
            replica.apply_transaction(epoch, remote(7, 1, "a")).unwrap();
        }
        let (replica, _) = open(&adapter);
        assert_eq!(replica.lsn(), Lsn::from_u64(7));
    }

    #[test]
    fn outbound_batches_follow_the_oplog() {
        let adapter = Arc::new(MemoryAdapter::new());
        let notifier = Arc::new(ChannelNotifier::default());
        let replica = Replica::open(
            &SatelliteConfig::new("app.db").with_outbound_batch_size(2),
            Arc::clone(&adapter) as Arc<dyn DatabaseAdapter>,
            notifier,
            &schema(),
            Arc::new(Notify::new()),
        )
        .unwrap();
        for id in 0..3 {
            replica
                .transact(vec![LocalChange::insert("items", row([("id", id)]), Row::new())])
                .unwrap();
        }

        let epoch = replica.begin_session().unwrap();
        let first = replica.outbound(epoch).unwrap();
        assert_eq!(first.messages.len(), 2);
        assert!(first.more);
        let second = replica.outbound(epoch).unwrap();
        assert_eq!(second.messages.len(), 1);
        assert!(!second.more);

        replica.acknowledge(epoch, &Lsn::from_u64(2)).unwrap();
        assert_eq!(replica.pending_count().unwrap(), 1);

        // A new session replays from the acknowledged position.
        let epoch = replica.begin_session().unwrap();
        let replay = replica.outbound(epoch).unwrap();
        assert!(matches!(
            &replay.messages[..],
            [SatelliteMessage::Transaction(t)] if t.lsn == Some(Lsn::from_u64(3))
        ));
    }

    #[test]
    fn failed_delivery_leaves_nothing_behind() {
        let adapter = Arc::new(MemoryAdapter::new());
        let (replica, _) = open(&adapter);
        let handle = replica
            .subscribe(vec![ShapeDefinition::table("items")])
            .unwrap();
        let epoch = replica.begin_session().unwrap();
        replica.outbound(epoch).unwrap();

        replica
            .on_data_begin(
                epoch,
                SubscriptionDataBegin {
                    subscription_id: handle.id().to_string(),
                    lsn: Lsn::from_u64(1),
                },
            )
            .unwrap();
        for (lsn, id) in [(1, 1), (1, 2)] {
            let op = remote(lsn, id, "x").into_operations().remove(0);
            replica
                .on_data_change(
                    epoch,
                    DataChange {
                        subscription_id: handle.id().to_string(),
                        operation: op,
                    },
                )
                .unwrap();
        }
        adapter.fail_next(1);
        assert!(replica.on_data_commit(epoch, handle.id()).is_err());
        assert!(adapter.rows("items").is_empty());
        assert!(get_meta(adapter.as_ref(), SUBSCRIPTIONS_KEY).unwrap().is_none());
    }

    fn deliver(replica: &Replica, epoch: u64, id: &str, lsn: u64, titles: &[(i64, &str)]) {
        replica
            .on_data_begin(
                epoch,
                SubscriptionDataBegin {
                    subscription_id: id.to_string(),
                    lsn: Lsn::from_u64(lsn),
                },
            )
            .unwrap();
        for (key, title) in titles {
            let op = remote(lsn, *key, title).into_operations().remove(0);
            replica
                .on_data_change(
                    epoch,
                    DataChange {
                        subscription_id: id.to_string(),
                        operation: op,
                    },
                )
                .unwrap();
        }
        replica.on_data_commit(epoch, id).unwrap();
    }

    #[test]
    fn timed_out_delivery_fails_only_its_subscription() {
        let adapter = Arc::new(MemoryAdapter::new());
        let (replica, _) = open(&adapter);
        let handle = replica
            .subscribe(vec![ShapeDefinition::table("items")])
            .unwrap();
        let epoch = replica.begin_session().unwrap();
        replica.outbound(epoch).unwrap();
        replica.expire(epoch, Duration::ZERO).unwrap();
        assert_eq!(handle.state(), SubscriptionState::Errored);

        // The peer had already started streaming it.
        deliver(&replica, epoch, handle.id(), 1, &[(1, "x"), (2, "y")]);
        assert!(replica.fatal().is_none());
        assert!(adapter.rows("items").is_empty());
        assert_eq!(replica.lsn(), Lsn::beginning());
        assert_eq!(handle.state(), SubscriptionState::Errored);

        replica
            .transact(vec![LocalChange::insert("items", row([("id", 5)]), Row::new())])
            .unwrap();
        let next = replica.outbound(epoch).unwrap();
        assert!(next
            .messages
            .iter()
            .any(|m| matches!(m, SatelliteMessage::UnsubscribeRequest(_))));
        assert!(next
            .messages
            .iter()
            .any(|m| matches!(m, SatelliteMessage::Transaction(_))));
    }

    #[test]
    fn unsubscribe_removes_data_no_shape_covers() {
        let adapter = Arc::new(MemoryAdapter::new());
        let (replica, mut changes) = open(&adapter);
        let all = replica
            .subscribe(vec![ShapeDefinition::table("items")])
            .unwrap();
        let some = replica
            .subscribe(vec![ShapeDefinition::table("items").with_filter("title = 'a'")])
            .unwrap();
        let epoch = replica.begin_session().unwrap();
        replica.outbound(epoch).unwrap();
        deliver(&replica, epoch, all.id(), 1, &[(1, "a"), (2, "b")]);
        deliver(&replica, epoch, some.id(), 1, &[(1, "a")]);
        while changes.try_recv().is_ok() {}

        // Another subscription still covers the table.
        replica.unsubscribe(all.id()).unwrap();
        assert_eq!(adapter.rows("items").len(), 2);
        assert!(changes.try_recv().is_err());

        replica.unsubscribe(some.id()).unwrap();
        assert!(adapter.rows("items").is_empty());
        assert!(adapter.rows(SHADOW_TABLE).is_empty());
        let change = changes.try_recv().unwrap();
        assert_eq!(change.tables, BTreeSet::from(["items".to_string()]));
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert!(replica.subscriptions().is_empty());
        assert!(replica.fatal().is_none());
    }
}
