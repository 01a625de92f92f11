//! End-to-end tests: satellite processes replicating through the reference
//! server over in-memory transports.

use satellite_engine::{
    BackoffConfig, ChangeOrigin, ChannelNotifier, ConnectivityStatus, ErrorKind, LocalChange,
    MemoryAdapter, MemoryTransport, Registry, Satellite, SatelliteConfig, SatelliteError,
    SatelliteProcess, SubscriptionState,
};
use satellite_protocol::{
    row, ColumnType, Lsn, Operation, Relation, Row, ShapeDefinition, ShapeErrorCode, Tag,
    Transaction, Value,
};
use satellite_server::{SatelliteServer, ServerConfig};
use std::sync::Arc;
use std::time::Duration;

const TOKEN: &str = "secret";

/// Routes engine and server logs to the test output; `RUST_LOG` selects.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn schema() -> Vec<Relation> {
    vec![
        Relation::new("projects")
            .with_key("id", ColumnType::Integer)
            .with_column("name", ColumnType::Text),
        Relation::new("issues")
            .with_key("id", ColumnType::Integer)
            .with_column("project_id", ColumnType::Integer)
            .with_column("status", ColumnType::Text)
            .with_foreign_key("project_id", "projects", "id"),
    ]
}

fn server_with(config: ServerConfig) -> Arc<SatelliteServer> {
    init_tracing();
    let config = schema()
        .into_iter()
        .fold(config.with_token(TOKEN), ServerConfig::with_relation);
    Arc::new(SatelliteServer::new(config))
}

fn server() -> Arc<SatelliteServer> {
    server_with(ServerConfig::new("reference"))
}

struct Client {
    process: Arc<SatelliteProcess>,
    adapter: Arc<MemoryAdapter>,
    notifier: Arc<ChannelNotifier>,
}

impl Client {
    fn new(server: &SatelliteServer, client_id: &str) -> Self {
        Self::with_adapter(server, client_id, TOKEN, Arc::new(MemoryAdapter::new()))
    }

    fn with_adapter(
        server: &SatelliteServer,
        client_id: &str,
        token: &str,
        adapter: Arc<MemoryAdapter>,
    ) -> Self {
        let (transport, acceptor) = MemoryTransport::new(64);
        server.listen(acceptor);
        let notifier = Arc::new(ChannelNotifier::default());
        let config = SatelliteConfig::new(format!("{client_id}.db"))
            .with_client_id(client_id)
            .with_token(token)
            .with_backoff(
                BackoffConfig::new(20)
                    .with_initial_delay(Duration::from_millis(10))
                    .with_max_delay(Duration::from_millis(50))
                    .with_jitter(false),
            );
        let process = SatelliteProcess::new(
            config,
            Arc::<MemoryAdapter>::clone(&adapter),
            Arc::new(transport),
            Arc::<ChannelNotifier>::clone(&notifier),
            schema(),
        );
        Self {
            process: Arc::new(process),
            adapter,
            notifier,
        }
    }

    async fn connected(server: &SatelliteServer, client_id: &str) -> Self {
        let client = Self::new(server, client_id);
        client.process.start().await.unwrap();
        client.process.connect().await.unwrap();
        client
    }

    async fn subscribe(&self, shape: ShapeDefinition) -> String {
        let handle = self.process.subscribe(vec![shape]).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.synced())
            .await
            .unwrap()
            .unwrap();
        handle.id().to_string()
    }

    fn name_of(&self, project: i64) -> Option<Value> {
        self.adapter
            .row("projects", &row([("id", project)]))
            .and_then(|r| r.get("name").cloned())
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn project(id: i64, name: &str) -> LocalChange {
    LocalChange::insert("projects", row([("id", id)]), row([("name", name)]))
}

fn remote_project(id: i64, name: &str, timestamp: u64) -> Transaction {
    let tag = Tag::new("remote", timestamp);
    let op = Operation::insert("projects", row([("id", id)]), row([("name", name)]), tag);
    Transaction::new("remote", timestamp, vec![op]).unwrap()
}

fn remote_issue(id: i64, project_id: i64, timestamp: u64) -> Transaction {
    let tag = Tag::new("remote", timestamp);
    let values: Row = row([
        ("project_id", Value::from(project_id)),
        ("status", Value::from("open")),
    ]);
    let op = Operation::insert("issues", row([("id", id)]), values, tag);
    Transaction::new("remote", timestamp, vec![op]).unwrap()
}

#[tokio::test]
async fn local_write_is_replicated_and_acknowledged() {
    let server = server();
    let client = Client::connected(&server, "c1").await;
    let mut changes = client.notifier.subscribe();

    client.process.transact(vec![project(1, "alpha")]).unwrap();
    let change = changes.recv().await.unwrap();
    assert_eq!(change.origin, ChangeOrigin::Local);
    assert!(change.tables.contains("projects"));

    eventually("server row", || server.rows("projects").len() == 1).await;
    eventually("acknowledgement", || {
        client.process.pending_transactions().unwrap() == 0
    })
    .await;
    assert_eq!(server.transactions()[0].origin, "c1");
}

#[tokio::test]
async fn writes_reach_subscribed_clients() {
    let server = server();
    let writer = Client::connected(&server, "writer").await;
    let reader = Client::connected(&server, "reader").await;
    reader.subscribe(ShapeDefinition::table("projects")).await;
    let mut changes = reader.notifier.subscribe();

    writer.process.transact(vec![project(7, "shared")]).unwrap();
    eventually("replicated row", || {
        reader.name_of(7) == Some(Value::from("shared"))
    })
    .await;
    let change = changes.recv().await.unwrap();
    assert_eq!(change.origin, ChangeOrigin::Remote);
    assert_eq!(reader.process.lsn().unwrap(), server.head());
}

#[tokio::test]
async fn concurrent_updates_converge() {
    let server = server();
    let a = Client::connected(&server, "a").await;
    let b = Client::connected(&server, "b").await;
    a.subscribe(ShapeDefinition::table("projects")).await;
    b.subscribe(ShapeDefinition::table("projects")).await;

    a.process.transact(vec![project(1, "start")]).unwrap();
    eventually("initial row on b", || b.name_of(1).is_some()).await;

    let key = row([("id", 1)]);
    a.process
        .transact(vec![LocalChange::update("projects", key.clone(), row([("name", "from a")]))])
        .unwrap();
    b.process
        .transact(vec![LocalChange::update("projects", key, row([("name", "from b")]))])
        .unwrap();

    eventually("convergence", || {
        let on_server = server
            .rows("projects")
            .first()
            .and_then(|r| r.get("name").cloned());
        a.process.pending_transactions().unwrap() == 0
            && b.process.pending_transactions().unwrap() == 0
            && a.name_of(1).is_some()
            && a.name_of(1) == b.name_of(1)
            && a.name_of(1) == on_server
    })
    .await;
}

#[tokio::test]
async fn shape_includes_related_rows() {
    let server = server();
    server.insert_remote(remote_project(1, "kept", 1)).unwrap();
    server.insert_remote(remote_project(2, "skipped", 2)).unwrap();
    server.insert_remote(remote_issue(10, 1, 3)).unwrap();
    server.insert_remote(remote_issue(20, 2, 4)).unwrap();

    let client = Client::connected(&server, "c1").await;
    client
        .subscribe(
            ShapeDefinition::table("projects")
                .with_filter("name = 'kept'")
                .with_include("project_id", ShapeDefinition::table("issues")),
        )
        .await;

    assert_eq!(client.adapter.rows("projects").len(), 1);
    let issues = client.adapter.rows("issues");
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].get("id"), Some(&Value::from(10)));
    assert_eq!(client.process.lsn().unwrap(), Lsn::from_u64(4));
}

#[tokio::test]
async fn reconnect_resumes_from_last_position() {
    let server = server();
    server.insert_remote(remote_project(1, "before", 1)).unwrap();
    let client = Client::connected(&server, "c1").await;
    let id = client.subscribe(ShapeDefinition::table("projects")).await;

    let mut transitions = client.process.watch_connectivity();
    assert_eq!(server.drop_connections(), 1);
    server.insert_remote(remote_project(2, "while away", 2)).unwrap();

    let lost = transitions.recv().await.unwrap();
    assert_eq!(lost.to, ConnectivityStatus::Disconnected);
    assert_eq!(lost.reason.map(|r| r.kind()), Some(ErrorKind::Transport));

    eventually("resumed replication", || {
        client.process.connectivity().status == ConnectivityStatus::Connected
            && client.name_of(2).is_some()
    })
    .await;
    // The subscription was re-asserted, not delivered again.
    let info = client.process.subscriptions();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].id, id);
    assert_eq!(info[0].state, SubscriptionState::Fulfilled);
    assert_eq!(client.adapter.rows("projects").len(), 2);
    assert_eq!(client.process.lsn().unwrap(), server.head());
}

#[tokio::test]
async fn behind_window_triggers_resync() {
    let server = server();
    server.insert_remote(remote_project(1, "one", 1)).unwrap();
    let client = Client::connected(&server, "c1").await;
    client.subscribe(ShapeDefinition::table("projects")).await;
    assert_eq!(client.process.lsn().unwrap(), Lsn::from_u64(1));

    client.process.disconnect(None);
    server.insert_remote(remote_project(2, "two", 2)).unwrap();
    server.insert_remote(remote_project(3, "three", 3)).unwrap();
    server.compact_before(3);

    client.process.connect().await.unwrap();
    eventually("resynced data", || {
        client.adapter.rows("projects").len() == 3
            && client
                .process
                .subscriptions()
                .iter()
                .all(|s| s.state == SubscriptionState::Fulfilled)
    })
    .await;
    assert_eq!(client.process.lsn().unwrap(), Lsn::from_u64(3));
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let server = server();
    let client = Client::with_adapter(&server, "c1", "wrong", Arc::new(MemoryAdapter::new()));
    client.process.start().await.unwrap();

    let err = client.process.connect_with_backoff().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    let state = client.process.connectivity();
    assert_eq!(state.status, ConnectivityStatus::Disconnected);
    assert!(matches!(state.reason, Some(SatelliteError::Auth(_))));
}

#[tokio::test]
async fn oversized_shape_fails_only_that_subscription() {
    let server = server_with(ServerConfig::new("reference").with_max_shape_rows(1));
    server.insert_remote(remote_project(1, "a", 1)).unwrap();
    server.insert_remote(remote_project(2, "b", 2)).unwrap();
    let client = Client::connected(&server, "c1").await;

    let handle = client
        .process
        .subscribe(vec![ShapeDefinition::table("projects")])
        .unwrap();
    match handle.synced().await {
        Err(SatelliteError::Shape { code, .. }) => {
            assert_eq!(code, ShapeErrorCode::SizeLimitExceeded)
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(client.adapter.rows("projects").is_empty());
    assert_eq!(
        client.process.connectivity().status,
        ConnectivityStatus::Connected
    );
}

#[tokio::test]
async fn unknown_tables_are_rejected_locally() {
    let server = server();
    let client = Client::connected(&server, "c1").await;
    assert_eq!(
        client
            .process
            .subscribe(vec![ShapeDefinition::table("ghosts")])
            .unwrap_err(),
        SatelliteError::TableNotFound("ghosts".into())
    );
    let write = LocalChange::insert("ghosts", row([("id", 1)]), Row::new());
    assert!(client.process.transact(vec![write]).is_err());
}

#[tokio::test]
async fn failed_delivery_leaves_no_partial_data() {
    let server = server();
    server.insert_remote(remote_project(1, "a", 1)).unwrap();
    server.insert_remote(remote_project(2, "b", 2)).unwrap();
    let adapter = Arc::new(MemoryAdapter::new());
    let client = Client::with_adapter(&server, "c1", TOKEN, Arc::clone(&adapter));
    client.process.start().await.unwrap();
    client.process.connect().await.unwrap();

    adapter.fail_next(1);
    let handle = client
        .process
        .subscribe(vec![ShapeDefinition::table("projects")])
        .unwrap();
    let err = handle.synced().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(adapter.rows("projects").is_empty());
    eventually("process failure", || client.process.failure().is_some()).await;
    client.process.stop().await.unwrap();

    // A fresh process over the same database starts clean.
    let restarted = Client::with_adapter(&server, "c1", TOKEN, adapter);
    restarted.process.start().await.unwrap();
    restarted.process.connect().await.unwrap();
    assert!(restarted.process.subscriptions().is_empty());
    restarted.subscribe(ShapeDefinition::table("projects")).await;
    assert_eq!(restarted.adapter.rows("projects").len(), 2);
}

#[tokio::test]
async fn unsubscribe_removes_rows_no_shape_covers() {
    let server = server();
    server.insert_remote(remote_project(1, "a", 1)).unwrap();
    let client = Client::connected(&server, "c1").await;
    let id = client.subscribe(ShapeDefinition::table("projects")).await;
    assert_eq!(server.subscription_count(), 1);
    assert_eq!(client.adapter.rows("projects").len(), 1);
    let mut changes = client.notifier.subscribe();

    client.process.unsubscribe(&id).unwrap();
    assert!(client.adapter.rows("projects").is_empty());
    let change = changes.recv().await.unwrap();
    assert_eq!(change.origin, ChangeOrigin::Local);
    assert!(change.tables.contains("projects"));
    eventually("server release", || server.subscription_count() == 0).await;
    assert!(client.process.subscriptions().is_empty());

    // Later writes no longer reach this client.
    server.insert_remote(remote_project(2, "b", 2)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.name_of(2).is_none());
    assert!(client.process.failure().is_none());
}

#[tokio::test]
async fn registry_runs_one_process_per_database() {
    let server = server();
    let registry = Arc::new(Registry::new());

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let registry = Arc::clone(&registry);
        let process = Arc::clone(&Client::new(&server, "shared").process);
        tasks.push(tokio::spawn(async move {
            registry
                .ensure_started("shared.db", move || Ok(process as Arc<dyn Satellite>))
                .await
                .map(|s| Arc::as_ptr(&s) as *const () as usize)
        }));
    }
    let mut started = Vec::new();
    for task in tasks {
        started.push(task.await.unwrap().unwrap());
    }
    assert!(started.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(registry.names(), vec!["shared.db".to_string()]);

    let duplicate = Client::new(&server, "shared").process as Arc<dyn Satellite>;
    assert_eq!(
        registry.register(duplicate).err(),
        Some(SatelliteError::AlreadyRunning("shared.db".into()))
    );

    let running = registry.get("shared.db").unwrap();
    running.connect().await.unwrap();
    registry.stop("shared.db").await.unwrap();
    assert!(registry.is_empty());
    assert_eq!(
        running.connectivity().status,
        ConnectivityStatus::Disconnected
    );
}
