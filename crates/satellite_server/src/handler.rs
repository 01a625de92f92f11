//! Per-connection request handling.
//!
//! All connections share one [`HandlerContext`]. Every handler step runs
//! under the context lock and queues its replies on the connection's
//! outbox, so a client sees snapshots and live transactions in LSN order.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::filter::Filter;
use crate::oplog::ServerOplog;
use crate::store::TableStore;
use parking_lot::Mutex;
use satellite_protocol::{
    key_string, AuthErrorCode, AuthRequest, AuthResponse, DataChange, ErrorMessage, Lsn,
    Operation, Row, SatelliteMessage, ShapeDefinition, ShapeErrorCode, ShapeRequest,
    ShapeRequestError, StartReplicationErrorCode, StartReplicationRequest,
    StartReplicationResponse, StopReplicationResponse, SubscriptionDataBegin,
    SubscriptionDataCommit, SubscriptionDataError, SubscriptionError, SubscriptionRequest,
    SubscriptionResponse, Transaction, TransactionAck, UnsubscribeRequest, UnsubscribeResponse,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Messages queued for one connection.
pub type Outbox = mpsc::UnboundedSender<SatelliteMessage>;

/// A shape with its filters parsed and include joins resolved.
#[derive(Debug, Clone)]
struct PlannedShape {
    table: String,
    filter: Filter,
    /// `(child column, parent column)` pairs and the included shape.
    include: Vec<(Vec<(String, String)>, PlannedShape)>,
}

impl PlannedShape {
    fn covers(&self, op: &Operation, store: &TableStore) -> bool {
        let own = self.table == op.table
            && (self.filter.is_all()
                || self.filter.matches(&store.image(&op.table, &op.primary_key)));
        own || self.include.iter().any(|(_, child)| child.covers(op, store))
    }
}

#[derive(Debug)]
struct Subscription {
    shapes: Vec<ShapeRequest>,
    planned: Vec<PlannedShape>,
}

struct ClientLink {
    client_id: Option<String>,
    outbox: Outbox,
    replicating: bool,
    subscriptions: BTreeSet<String>,
    // Dropping the link resolves the connection's close signal.
    _close: oneshot::Sender<()>,
}

impl ClientLink {
    fn send(&self, message: SatelliteMessage) {
        // A closed outbox means the connection is already going away.
        let _ = self.outbox.send(message);
    }

    /// The part of `transaction` this client subscribes to, if any.
    fn view_of(
        &self,
        transaction: &Transaction,
        subscriptions: &HashMap<String, Subscription>,
        store: &TableStore,
    ) -> Option<Transaction> {
        if self.client_id.as_deref() == Some(transaction.origin.as_str()) {
            return None;
        }
        let operations: Vec<Operation> = transaction
            .operations()
            .iter()
            .filter(|op| {
                self.subscriptions
                    .iter()
                    .filter_map(|id| subscriptions.get(id))
                    .any(|sub| sub.planned.iter().any(|shape| shape.covers(op, store)))
            })
            .cloned()
            .collect();
        if operations.is_empty() {
            return None;
        }
        let view = Transaction::new(
            transaction.origin.clone(),
            transaction.commit_timestamp,
            operations,
        )
        .ok()?;
        Some(match &transaction.lsn {
            Some(lsn) => view.with_lsn(lsn.clone()),
            None => view,
        })
    }
}

/// Shared server state, guarded by the context lock.
struct ServerState {
    oplog: ServerOplog,
    store: TableStore,
    clients: HashMap<u64, ClientLink>,
    subscriptions: HashMap<String, Subscription>,
}

/// Context for request handling, shared by every connection.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    state: Mutex<ServerState>,
    next_connection: AtomicU64,
}

impl HandlerContext {
    /// Creates a context with an empty log and store.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ServerState {
                oplog: ServerOplog::new(),
                store: TableStore::new(),
                clients: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Registers a connection. Dropping its link later resolves `close`.
    pub fn attach(&self, outbox: Outbox, close: oneshot::Sender<()>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        self.state.lock().clients.insert(
            id,
            ClientLink {
                client_id: None,
                outbox,
                replicating: false,
                subscriptions: BTreeSet::new(),
                _close: close,
            },
        );
        debug!(connection = id, "connection attached");
        id
    }

    /// Forgets a connection, closing its outbox.
    pub fn detach(&self, connection: u64) {
        if self.state.lock().clients.remove(&connection).is_some() {
            debug!(connection, "connection detached");
        }
    }

    /// Closes every connection. Returns how many were open.
    pub fn drop_connections(&self) -> usize {
        let dropped = self.state.lock().clients.drain().count();
        info!(connections = dropped, "dropped all connections");
        dropped
    }

    /// Queues `message` for `connection`, if it is still attached.
    pub fn reply(&self, connection: u64, message: SatelliteMessage) {
        if let Some(link) = self.state.lock().clients.get(&connection) {
            link.send(message);
        }
    }

    /// Appends a transaction to the log, merges it and forwards it to every
    /// replicating client whose subscriptions cover it.
    ///
    /// `origin` identifies the submitting connection and the client position
    /// to acknowledge; it is `None` for transactions injected server-side.
    pub fn publish(
        &self,
        transaction: Transaction,
        origin: Option<(u64, Lsn)>,
    ) -> ServerResult<Transaction> {
        if let Some(op) = transaction
            .operations()
            .iter()
            .find(|op| self.config.relation(&op.table).is_none())
        {
            return Err(ServerError::UnknownTable(op.table.clone()));
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let stamped = state.oplog.append(transaction);
        for op in stamped.operations() {
            state.store.apply(op);
        }
        for (id, link) in &state.clients {
            if !link.replicating || origin.as_ref().is_some_and(|(from, _)| from == id) {
                continue;
            }
            if let Some(view) = link.view_of(&stamped, &state.subscriptions, &state.store) {
                link.send(SatelliteMessage::Transaction(view));
            }
        }
        if let Some((from, client_lsn)) = origin {
            if let Some(link) = state.clients.get(&from) {
                link.send(SatelliteMessage::TransactionAck(TransactionAck { lsn: client_lsn }));
            }
        }
        debug!(
            origin = %stamped.origin,
            lsn = state.oplog.head(),
            operations = stamped.operations().len(),
            "transaction published"
        );
        Ok(stamped)
    }

    /// Discards log entries below `lsn`.
    pub fn compact_before(&self, lsn: u64) {
        self.state.lock().oplog.compact_before(lsn);
        info!(lsn, "compacted server log");
    }

    /// Highest issued LSN.
    pub fn head(&self) -> u64 {
        self.state.lock().oplog.head()
    }

    /// Retained transactions in commit order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().oplog.transactions()
    }

    /// Visible rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.lock().store.rows(table)
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Number of known subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    fn plan(&self, definition: &ShapeDefinition) -> Result<PlannedShape, (ShapeErrorCode, String)> {
        let relation = self.config.relation(&definition.table).ok_or_else(|| {
            (
                ShapeErrorCode::TableNotFound,
                format!("table '{}' is not replicated", definition.table),
            )
        })?;
        let filter = Filter::parse(definition.filter.as_deref())
            .map_err(|err| (ShapeErrorCode::InvalidFilter, err.to_string()))?;
        let mut include = Vec::new();
        for nested in &definition.include {
            let child = self.plan(&nested.select)?;
            let child_relation = self.config.relation(&child.table).ok_or_else(|| {
                (
                    ShapeErrorCode::TableNotFound,
                    format!("table '{}' is not replicated", child.table),
                )
            })?;
            let mut pairs = Vec::new();
            for column in &nested.foreign_key {
                let fk = child_relation
                    .foreign_keys
                    .iter()
                    .find(|fk| &fk.column == column && fk.references_table == relation.table)
                    .ok_or_else(|| {
                        (
                            ShapeErrorCode::InvalidFilter,
                            format!(
                                "'{}.{column}' does not reference '{}'",
                                child.table, relation.table
                            ),
                        )
                    })?;
                pairs.push((fk.column.clone(), fk.references_column.clone()));
            }
            include.push((pairs, child));
        }
        Ok(PlannedShape {
            table: definition.table.clone(),
            filter,
            include,
        })
    }

    fn plan_all(&self, shapes: &[ShapeRequest]) -> Result<Vec<PlannedShape>, SubscriptionError> {
        let mut planned = Vec::new();
        let mut shape_errors = Vec::new();
        for request in shapes {
            match self.plan(&request.definition) {
                Ok(shape) => planned.push(shape),
                Err((code, message)) => shape_errors.push(ShapeRequestError {
                    request_id: request.request_id.clone(),
                    code,
                    message,
                }),
            }
        }
        match shape_errors.first() {
            None => Ok(planned),
            Some(first) => Err(SubscriptionError {
                code: first.code,
                message: format!("{} shape request(s) rejected", shape_errors.len()),
                shape_errors,
            }),
        }
    }
}

fn collect(
    store: &TableStore,
    shape: &PlannedShape,
    parents: Option<(&[(String, String)], &[Row])>,
    seen: &mut BTreeSet<(String, String)>,
    out: &mut Vec<Operation>,
) {
    let mut images = Vec::new();
    for op in store.select(&shape.table, &shape.filter) {
        let mut image = op.values.clone();
        image.extend(op.primary_key.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some((pairs, parent_images)) = parents {
            let joined = parent_images.iter().any(|parent| {
                pairs.iter().all(|(child_column, parent_column)| {
                    image
                        .get(child_column)
                        .is_some_and(|v| !v.is_null() && Some(v) == parent.get(parent_column))
                })
            });
            if !joined {
                continue;
            }
        }
        images.push(image);
        if seen.insert((op.table.clone(), key_string(&op.primary_key))) {
            out.push(op);
        }
    }
    for (pairs, child) in &shape.include {
        collect(store, child, Some((pairs, &images)), seen, out);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingAuth,
    Authenticated,
    Replicating,
}

/// Handler for the messages of one connection.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
    connection: u64,
    phase: Phase,
    client_id: Option<String>,
}

impl RequestHandler {
    /// Creates a handler for an attached connection.
    pub fn new(context: Arc<HandlerContext>, connection: u64) -> Self {
        Self {
            context,
            connection,
            phase: Phase::AwaitingAuth,
            client_id: None,
        }
    }

    /// Authenticated client id.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Handles one message. An error ends the connection.
    pub fn handle(&mut self, message: SatelliteMessage) -> ServerResult<()> {
        match (self.phase, message) {
            (Phase::AwaitingAuth, SatelliteMessage::AuthRequest(request)) => {
                self.handle_auth(request);
                Ok(())
            }
            (_, SatelliteMessage::AuthRequest(_)) => {
                Err(ServerError::InvalidRequest("already authenticated".into()))
            }
            (Phase::AwaitingAuth, other) => Err(ServerError::InvalidRequest(format!(
                "{} before authentication",
                other.name()
            ))),
            (_, SatelliteMessage::StartReplicationRequest(request)) => {
                self.handle_start(request)
            }
            (Phase::Replicating, SatelliteMessage::SubscriptionRequest(request)) => {
                self.handle_subscribe(request)
            }
            (Phase::Replicating, SatelliteMessage::UnsubscribeRequest(request)) => {
                self.handle_unsubscribe(request);
                Ok(())
            }
            (Phase::Replicating, SatelliteMessage::Transaction(transaction)) => {
                self.handle_transaction(transaction)
            }
            (Phase::Replicating, SatelliteMessage::StopReplicationRequest(_)) => {
                self.phase = Phase::Authenticated;
                self.with_link(|link| {
                    link.replicating = false;
                    link.send(SatelliteMessage::StopReplicationResponse(
                        StopReplicationResponse {},
                    ));
                });
                Ok(())
            }
            (_, SatelliteMessage::TransactionAck(_)) => Ok(()),
            (_, other) => Err(ServerError::InvalidRequest(format!(
                "unexpected {}",
                other.name()
            ))),
        }
    }

    fn with_link<R>(&self, f: impl FnOnce(&mut ClientLink) -> R) -> Option<R> {
        self.context
            .state
            .lock()
            .clients
            .get_mut(&self.connection)
            .map(f)
    }

    fn handle_auth(&mut self, request: AuthRequest) {
        let config = &self.context.config;
        if !config.accepts(&request.token) {
            warn!(client_id = %request.client_id, "rejected credentials");
            self.context.reply(
                self.connection,
                SatelliteMessage::AuthResponse(AuthResponse::error(
                    AuthErrorCode::InvalidToken,
                    "token rejected",
                )),
            );
            return;
        }
        let server_id = config.server_id.clone();
        let client_id = request.client_id;
        info!(client_id = %client_id, "client authenticated");
        self.with_link(|link| {
            link.client_id = Some(client_id.clone());
            link.send(SatelliteMessage::AuthResponse(AuthResponse::success(server_id)));
        });
        self.client_id = Some(client_id);
        self.phase = Phase::Authenticated;
    }

    fn handle_start(&mut self, request: StartReplicationRequest) -> ServerResult<()> {
        let context = Arc::clone(&self.context);
        let mut guard = context.state.lock();
        let state = &mut *guard;
        let link = state
            .clients
            .get_mut(&self.connection)
            .ok_or_else(|| ServerError::Internal("connection is closed".into()))?;

        let refused = |code, message: String| {
            warn!(client_id = ?self.client_id, ?code, %message, "replication refused");
            SatelliteMessage::StartReplicationResponse(StartReplicationResponse::error(
                code, message,
            ))
        };
        if let Some(missing) = request
            .subscription_ids
            .iter()
            .find(|id| !state.subscriptions.contains_key(*id))
        {
            link.send(refused(
                StartReplicationErrorCode::SubscriptionNotFound,
                format!("unknown subscription {missing}"),
            ));
            return Ok(());
        }
        let backlog = match state.oplog.since(&request.lsn) {
            Ok(backlog) => backlog,
            Err(ServerError::BehindWindow(message)) => {
                link.send(refused(StartReplicationErrorCode::BehindWindow, message));
                return Ok(());
            }
            Err(ServerError::InvalidPosition(message)) => {
                link.send(refused(StartReplicationErrorCode::InvalidPosition, message));
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        link.send(SatelliteMessage::StartReplicationResponse(
            StartReplicationResponse::ok(),
        ));
        for relation in &context.config.relations {
            link.send(SatelliteMessage::Relation(relation.clone()));
        }
        link.replicating = true;
        link.subscriptions = request.subscription_ids.into_iter().collect();
        let mut replayed = 0;
        for transaction in &backlog {
            if let Some(view) = link.view_of(transaction, &state.subscriptions, &state.store) {
                link.send(SatelliteMessage::Transaction(view));
                replayed += 1;
            }
        }
        self.phase = Phase::Replicating;
        info!(
            client_id = ?self.client_id,
            lsn = %request.lsn,
            subscriptions = link.subscriptions.len(),
            replayed,
            "replication started"
        );
        Ok(())
    }

    fn handle_subscribe(&mut self, request: SubscriptionRequest) -> ServerResult<()> {
        let context = Arc::clone(&self.context);
        let mut guard = context.state.lock();
        let state = &mut *guard;
        let link = state
            .clients
            .get_mut(&self.connection)
            .ok_or_else(|| ServerError::Internal("connection is closed".into()))?;
        let id = request.subscription_id;

        let rejected = |error: SubscriptionError| {
            warn!(subscription_id = %id, code = ?error.code, "subscription rejected");
            SatelliteMessage::SubscriptionResponse(SubscriptionResponse {
                subscription_id: id.clone(),
                error: Some(error),
            })
        };
        let planned = match context.plan_all(&request.shapes) {
            Ok(planned) => planned,
            Err(error) => {
                link.send(rejected(error));
                return Ok(());
            }
        };
        // A known id is re-delivered when the shapes match, e.g. after a
        // client resync; reusing an id for different shapes is refused.
        if let Some(existing) = state.subscriptions.get(&id) {
            if existing.shapes != request.shapes {
                link.send(rejected(SubscriptionError {
                    code: ShapeErrorCode::DuplicateSubscription,
                    message: format!("subscription {id} already exists"),
                    shape_errors: Vec::new(),
                }));
                return Ok(());
            }
        }
        link.send(SatelliteMessage::SubscriptionResponse(SubscriptionResponse {
            subscription_id: id.clone(),
            error: None,
        }));

        let mut seen = BTreeSet::new();
        let mut operations = Vec::new();
        for shape in &planned {
            collect(&state.store, shape, None, &mut seen, &mut operations);
        }
        if operations.len() > context.config.max_shape_rows {
            warn!(
                subscription_id = %id,
                rows = operations.len(),
                limit = context.config.max_shape_rows,
                "shape too large"
            );
            link.send(SatelliteMessage::SubscriptionDataError(SubscriptionDataError {
                subscription_id: id.clone(),
                error: SubscriptionError {
                    code: ShapeErrorCode::SizeLimitExceeded,
                    message: format!(
                        "{} rows exceed the limit of {}",
                        operations.len(),
                        context.config.max_shape_rows
                    ),
                    shape_errors: Vec::new(),
                },
            }));
            return Ok(());
        }

        let lsn = Lsn::from_u64(state.oplog.head());
        link.send(SatelliteMessage::SubscriptionDataBegin(SubscriptionDataBegin {
            subscription_id: id.clone(),
            lsn: lsn.clone(),
        }));
        let rows = operations.len();
        for operation in operations {
            link.send(SatelliteMessage::DataChange(DataChange {
                subscription_id: id.clone(),
                operation,
            }));
        }
        link.send(SatelliteMessage::SubscriptionDataCommit(
            SubscriptionDataCommit {
                subscription_id: id.clone(),
            },
        ));
        link.subscriptions.insert(id.clone());
        info!(subscription_id = %id, rows, lsn = %lsn, "shape delivered");
        state.subscriptions.insert(
            id,
            Subscription {
                shapes: request.shapes,
                planned,
            },
        );
        Ok(())
    }

    fn handle_unsubscribe(&mut self, request: UnsubscribeRequest) {
        let mut state = self.context.state.lock();
        for id in &request.subscription_ids {
            state.subscriptions.remove(id);
        }
        if let Some(link) = state.clients.get_mut(&self.connection) {
            for id in &request.subscription_ids {
                link.subscriptions.remove(id);
            }
            link.send(SatelliteMessage::UnsubscribeResponse(UnsubscribeResponse {}));
        }
        debug!(subscriptions = ?request.subscription_ids, "unsubscribed");
    }

    fn handle_transaction(&mut self, transaction: Transaction) -> ServerResult<()> {
        if self.client_id.as_deref() != Some(transaction.origin.as_str()) {
            return Err(ServerError::InvalidRequest(format!(
                "transaction origin '{}' is not the authenticated client",
                transaction.origin
            )));
        }
        let client_lsn = transaction
            .lsn
            .clone()
            .ok_or_else(|| ServerError::InvalidRequest("transaction without lsn".into()))?;
        self.context
            .publish(transaction, Some((self.connection, client_lsn)))?;
        Ok(())
    }
}

/// Builds the error frame sent before closing a connection.
pub(crate) fn error_message(err: &ServerError) -> SatelliteMessage {
    SatelliteMessage::Error(ErrorMessage {
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_protocol::{row, ColumnType, Relation, Tag, Value};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn context(config: ServerConfig) -> Arc<HandlerContext> {
        Arc::new(HandlerContext::new(
            config
                .with_relation(
                    Relation::new("projects")
                        .with_key("id", ColumnType::Integer)
                        .with_column("name", ColumnType::Text),
                )
                .with_relation(
                    Relation::new("issues")
                        .with_key("id", ColumnType::Integer)
                        .with_column("project_id", ColumnType::Integer)
                        .with_column("status", ColumnType::Text)
                        .with_foreign_key("project_id", "projects", "id"),
                ),
        ))
    }

    struct Client {
        handler: RequestHandler,
        inbox: UnboundedReceiver<SatelliteMessage>,
        _closed: oneshot::Receiver<()>,
    }

    impl Client {
        fn attach(context: &Arc<HandlerContext>) -> Self {
            let (outbox, inbox) = mpsc::unbounded_channel();
            let (close, closed) = oneshot::channel();
            let connection = context.attach(outbox, close);
            Self {
                handler: RequestHandler::new(Arc::clone(context), connection),
                inbox,
                _closed: closed,
            }
        }

        fn replicating(context: &Arc<HandlerContext>, client_id: &str) -> Self {
            let mut client = Self::attach(context);
            client
                .handler
                .handle(SatelliteMessage::AuthRequest(AuthRequest {
                    client_id: client_id.into(),
                    token: "token".into(),
                }))
                .unwrap();
            client
                .handler
                .handle(SatelliteMessage::StartReplicationRequest(
                    StartReplicationRequest {
                        lsn: Lsn::beginning(),
                        subscription_ids: Vec::new(),
                    },
                ))
                .unwrap();
            client.drain();
            client
        }

        fn drain(&mut self) -> Vec<SatelliteMessage> {
            let mut out = Vec::new();
            while let Ok(message) = self.inbox.try_recv() {
                out.push(message);
            }
            out
        }

        fn subscribe(&mut self, id: &str, definition: ShapeDefinition) -> Vec<SatelliteMessage> {
            self.handler
                .handle(SatelliteMessage::SubscriptionRequest(SubscriptionRequest {
                    subscription_id: id.into(),
                    shapes: vec![ShapeRequest::new(format!("{id}-0"), definition)],
                }))
                .unwrap();
            self.drain()
        }
    }

    fn project(id: i64, name: &str, tag: Tag) -> Transaction {
        let origin = tag.origin.clone();
        let timestamp = tag.timestamp;
        let op = Operation::insert("projects", row([("id", id)]), row([("name", name)]), tag);
        Transaction::new(origin, timestamp, vec![op]).unwrap()
    }

    fn issue(id: i64, project_id: i64, status: &str, tag: Tag) -> Transaction {
        let origin = tag.origin.clone();
        let timestamp = tag.timestamp;
        let op = Operation::insert(
            "issues",
            row([("id", id)]),
            row([
                ("project_id", Value::from(project_id)),
                ("status", Value::from(status)),
            ]),
            tag,
        );
        Transaction::new(origin, timestamp, vec![op]).unwrap()
    }

    #[test]
    fn auth_success_and_rejection() {
        let ctx = context(ServerConfig::new("peer").with_token("good"));
        let mut client = Client::attach(&ctx);

        client
            .handler
            .handle(SatelliteMessage::AuthRequest(AuthRequest {
                client_id: "c1".into(),
                token: "bad".into(),
            }))
            .unwrap();
        assert!(matches!(
            client.drain().as_slice(),
            [SatelliteMessage::AuthResponse(AuthResponse { error: Some(_), .. })]
        ));

        client
            .handler
            .handle(SatelliteMessage::AuthRequest(AuthRequest {
                client_id: "c1".into(),
                token: "good".into(),
            }))
            .unwrap();
        assert_eq!(
            client.drain(),
            vec![SatelliteMessage::AuthResponse(AuthResponse::success("peer"))]
        );
        assert_eq!(client.handler.client_id(), Some("c1"));
    }

    #[test]
    fn messages_before_auth_are_rejected() {
        let ctx = context(ServerConfig::default());
        let mut client = Client::attach(&ctx);
        let err = client
            .handler
            .handle(SatelliteMessage::StartReplicationRequest(
                StartReplicationRequest {
                    lsn: Lsn::beginning(),
                    subscription_ids: Vec::new(),
                },
            ))
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn start_announces_relations() {
        let ctx = context(ServerConfig::default());
        let mut client = Client::attach(&ctx);
        client
            .handler
            .handle(SatelliteMessage::AuthRequest(AuthRequest {
                client_id: "c1".into(),
                token: "t".into(),
            }))
            .unwrap();
        client.drain();
        client
            .handler
            .handle(SatelliteMessage::StartReplicationRequest(
                StartReplicationRequest {
                    lsn: Lsn::beginning(),
                    subscription_ids: Vec::new(),
                },
            ))
            .unwrap();
        let messages = client.drain();
        assert_eq!(
            messages[0],
            SatelliteMessage::StartReplicationResponse(StartReplicationResponse::ok())
        );
        assert_eq!(
            messages
                .iter()
                .filter(|m| matches!(m, SatelliteMessage::Relation(_)))
                .count(),
            2
        );
    }

    #[test]
    fn start_refusals() {
        let ctx = context(ServerConfig::default());
        for id in 1..=4 {
            ctx.publish(project(id, "p", Tag::new("remote", id as u64)), None)
                .unwrap();
        }
        ctx.compact_before(3);

        let start = |lsn: Lsn, ids: Vec<String>| {
            let mut client = Client::attach(&ctx);
            client
                .handler
                .handle(SatelliteMessage::AuthRequest(AuthRequest {
                    client_id: "c1".into(),
                    token: "t".into(),
                }))
                .unwrap();
            client
                .handler
                .handle(SatelliteMessage::StartReplicationRequest(
                    StartReplicationRequest {
                        lsn,
                        subscription_ids: ids,
                    },
                ))
                .unwrap();
            match client.drain().pop() {
                Some(SatelliteMessage::StartReplicationResponse(response)) => {
                    response.error.map(|e| e.code)
                }
                other => panic!("unexpected {other:?}"),
            }
        };

        assert_eq!(
            start(Lsn::from_u64(1), Vec::new()),
            Some(StartReplicationErrorCode::BehindWindow)
        );
        assert_eq!(
            start(Lsn::from_u64(9), Vec::new()),
            Some(StartReplicationErrorCode::InvalidPosition)
        );
        assert_eq!(
            start(Lsn::beginning(), vec!["ghost".into()]),
            Some(StartReplicationErrorCode::SubscriptionNotFound)
        );
    }

    #[test]
    fn subscription_delivers_snapshot_with_includes() {
        let ctx = context(ServerConfig::default());
        ctx.publish(project(1, "alpha", Tag::new("r", 1)), None).unwrap();
        ctx.publish(project(2, "beta", Tag::new("r", 2)), None).unwrap();
        ctx.publish(issue(10, 1, "open", Tag::new("r", 3)), None).unwrap();
        ctx.publish(issue(11, 2, "open", Tag::new("r", 4)), None).unwrap();
        ctx.publish(issue(12, 1, "closed", Tag::new("r", 5)), None).unwrap();

        let mut client = Client::replicating(&ctx, "c1");
        let messages = client.subscribe(
            "s1",
            ShapeDefinition::table("projects")
                .with_filter("name = 'alpha'")
                .with_include("project_id", ShapeDefinition::table("issues")),
        );

        assert!(matches!(
            &messages[0],
            SatelliteMessage::SubscriptionResponse(SubscriptionResponse { error: None, .. })
        ));
        assert_eq!(
            messages[1],
            SatelliteMessage::SubscriptionDataBegin(SubscriptionDataBegin {
                subscription_id: "s1".into(),
                lsn: Lsn::from_u64(5),
            })
        );
        let delivered: Vec<(String, Row)> = messages
            .iter()
            .filter_map(|m| match m {
                SatelliteMessage::DataChange(change) => Some((
                    change.operation.table.clone(),
                    change.operation.primary_key.clone(),
                )),
                _ => None,
            })
            .collect();
        assert_eq!(
            delivered,
            vec![
                ("projects".to_string(), row([("id", 1)])),
                ("issues".to_string(), row([("id", 10)])),
                ("issues".to_string(), row([("id", 12)])),
            ]
        );
        assert!(matches!(
            messages.last(),
            Some(SatelliteMessage::SubscriptionDataCommit(_))
        ));
        assert_eq!(ctx.subscription_count(), 1);
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        let ctx = context(ServerConfig::default());
        let mut client = Client::replicating(&ctx, "c1");

        let code_of = |messages: Vec<SatelliteMessage>| match messages.as_slice() {
            [SatelliteMessage::SubscriptionResponse(SubscriptionResponse {
                error: Some(error),
                ..
            })] => error.code,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            code_of(client.subscribe("s1", ShapeDefinition::table("ghosts"))),
            ShapeErrorCode::TableNotFound
        );
        assert_eq!(
            code_of(client.subscribe(
                "s2",
                ShapeDefinition::table("issues").with_filter("status ~ 'open'")
            )),
            ShapeErrorCode::InvalidFilter
        );
        assert_eq!(ctx.subscription_count(), 0);
    }

    #[test]
    fn size_limit_fails_delivery() {
        let ctx = context(ServerConfig::default().with_max_shape_rows(1));
        ctx.publish(project(1, "a", Tag::new("r", 1)), None).unwrap();
        ctx.publish(project(2, "b", Tag::new("r", 2)), None).unwrap();

        let mut client = Client::replicating(&ctx, "c1");
        let messages = client.subscribe("s1", ShapeDefinition::table("projects"));
        assert!(matches!(
            messages.last(),
            Some(SatelliteMessage::SubscriptionDataError(SubscriptionDataError {
                error: SubscriptionError {
                    code: ShapeErrorCode::SizeLimitExceeded,
                    ..
                },
                ..
            }))
        ));
        assert_eq!(ctx.subscription_count(), 0);
    }

    #[test]
    fn live_transactions_follow_subscriptions() {
        let ctx = context(ServerConfig::default());
        let mut writer = Client::replicating(&ctx, "writer");
        let mut reader = Client::replicating(&ctx, "reader");
        reader.subscribe("s1", ShapeDefinition::table("issues").with_filter("status = 'open'"));

        let mut submitted = issue(1, 1, "open", Tag::new("writer", 1)).with_lsn(Lsn::from_u64(1));
        writer
            .handler
            .handle(SatelliteMessage::Transaction(submitted.clone()))
            .unwrap();
        // The writer only gets its acknowledgement, never an echo.
        assert_eq!(
            writer.drain(),
            vec![SatelliteMessage::TransactionAck(TransactionAck {
                lsn: Lsn::from_u64(1)
            })]
        );
        match reader.drain().as_slice() {
            [SatelliteMessage::Transaction(received)] => {
                assert_eq!(received.lsn, Some(Lsn::from_u64(1)));
                assert_eq!(received.operations(), submitted.operations());
            }
            other => panic!("unexpected {other:?}"),
        }

        submitted = issue(2, 1, "closed", Tag::new("writer", 2)).with_lsn(Lsn::from_u64(2));
        writer
            .handler
            .handle(SatelliteMessage::Transaction(submitted))
            .unwrap();
        assert!(reader.drain().is_empty());
        assert_eq!(ctx.rows("issues").len(), 2);
    }

    #[test]
    fn resume_replays_backlog() {
        let ctx = context(ServerConfig::default());
        let mut first = Client::replicating(&ctx, "c1");
        first.subscribe("s1", ShapeDefinition::table("projects"));
        ctx.detach(first.handler.connection);

        ctx.publish(project(1, "a", Tag::new("r", 1)), None).unwrap();
        ctx.publish(project(2, "b", Tag::new("r", 2)), None).unwrap();

        let mut again = Client::attach(&ctx);
        again
            .handler
            .handle(SatelliteMessage::AuthRequest(AuthRequest {
                client_id: "c1".into(),
                token: "t".into(),
            }))
            .unwrap();
        again
            .handler
            .handle(SatelliteMessage::StartReplicationRequest(
                StartReplicationRequest {
                    lsn: Lsn::from_u64(0),
                    subscription_ids: vec!["s1".into()],
                },
            ))
            .unwrap();
        let replayed: Vec<Option<Lsn>> = again
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                SatelliteMessage::Transaction(t) => Some(t.lsn),
                _ => None,
            })
            .collect();
        assert_eq!(
            replayed,
            vec![Some(Lsn::from_u64(1)), Some(Lsn::from_u64(2))]
        );
    }

    #[test]
    fn foreign_origin_and_unknown_tables_are_errors() {
        let ctx = context(ServerConfig::default());
        let mut client = Client::replicating(&ctx, "c1");
        let spoofed = project(1, "a", Tag::new("someone-else", 1)).with_lsn(Lsn::from_u64(1));
        assert!(client
            .handler
            .handle(SatelliteMessage::Transaction(spoofed))
            .is_err());

        let op = Operation::insert("ghosts", row([("id", 1)]), Row::new(), Tag::new("c1", 2));
        let unknown = Transaction::new("c1", 2, vec![op])
            .unwrap()
            .with_lsn(Lsn::from_u64(2));
        assert_eq!(
            client.handler.handle(SatelliteMessage::Transaction(unknown)),
            Err(ServerError::UnknownTable("ghosts".into()))
        );
    }

    #[test]
    fn drop_connections_detaches_everyone() {
        let ctx = context(ServerConfig::default());
        let _a = Client::replicating(&ctx, "a");
        let _b = Client::replicating(&ctx, "b");
        assert_eq!(ctx.connection_count(), 2);
        assert_eq!(ctx.drop_connections(), 2);
        assert_eq!(ctx.connection_count(), 0);
    }
}
