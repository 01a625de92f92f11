//! The satellite process: one per logical database.

use crate::adapter::DatabaseAdapter;
use crate::config::{BackoffConfig, SatelliteConfig};
use crate::connectivity::{
    ConnectivityController, ConnectivityState, ConnectivityStatus, ConnectivityTransition,
    Supervisor,
};
use crate::error::{SatelliteError, SatelliteResult};
use crate::notifier::Notifier;
use crate::replica::{LocalChange, Replica};
use crate::session::SessionState;
use crate::shapes::{SubscriptionHandle, SubscriptionInfo};
use crate::transport::Transport;
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use satellite_protocol::{Lsn, Relation, ShapeDefinition, Transaction};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::info;

/// The capability every satellite implementation offers.
///
/// Implemented by [`SatelliteProcess`] and by the test double
/// [`crate::MockSatellite`].
#[async_trait]
pub trait Satellite: Send + Sync {
    /// Logical database name.
    fn db_name(&self) -> &str;

    /// Loads persisted state. Idempotent.
    async fn start(&self) -> SatelliteResult<()>;

    /// Starts connecting with a single attempt. Connectivity is `Connecting`
    /// when this returns; the future resolves once replicating or failed.
    fn connect(&self) -> BoxFuture<'static, SatelliteResult<()>>;

    /// Like [`Satellite::connect`], retrying with the configured backoff.
    fn connect_with_backoff(&self) -> BoxFuture<'static, SatelliteResult<()>>;

    /// Drops the connection and cancels reconnection until the next connect.
    fn disconnect(&self, reason: Option<SatelliteError>);

    /// Disconnects and releases the process. Terminal.
    async fn stop(&self) -> SatelliteResult<()>;

    /// Requests shapes; the handle resolves when their data is applied.
    fn subscribe(&self, shapes: Vec<ShapeDefinition>) -> SatelliteResult<SubscriptionHandle>;

    /// Releases a fulfilled subscription.
    fn unsubscribe(&self, subscription_id: &str) -> SatelliteResult<()>;

    /// Releases every subscription, returning their ids.
    fn unsubscribe_all(&self) -> SatelliteResult<Vec<String>>;

    /// Applies local changes as one transaction.
    fn transact(&self, changes: Vec<LocalChange>) -> SatelliteResult<Transaction>;

    /// Current connectivity.
    fn connectivity(&self) -> ConnectivityState;

    /// Receives every later connectivity transition.
    fn watch_connectivity(&self) -> broadcast::Receiver<ConnectivityTransition>;

    /// Snapshot of all subscriptions.
    fn subscriptions(&self) -> Vec<SubscriptionInfo>;
}

struct ProcessInner {
    config: SatelliteConfig,
    adapter: Arc<dyn DatabaseAdapter>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    schema: Vec<Relation>,
    controller: Arc<ConnectivityController>,
    wakeup: Arc<Notify>,
    replica: RwLock<Option<Arc<Replica>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stopped: RwLock<bool>,
}

/// The real satellite: replicates one database through a [`Transport`].
pub struct SatelliteProcess {
    inner: Arc<ProcessInner>,
}

impl SatelliteProcess {
    /// Creates a process. `schema` is the local table schema; shapes may
    /// only name tables it contains.
    pub fn new(
        config: SatelliteConfig,
        adapter: Arc<dyn DatabaseAdapter>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        schema: Vec<Relation>,
    ) -> Self {
        let controller = Arc::new(ConnectivityController::new(config.db_name.clone()));
        Self {
            inner: Arc::new(ProcessInner {
                config,
                adapter,
                transport,
                notifier,
                schema,
                controller,
                wakeup: Arc::new(Notify::new()),
                replica: RwLock::new(None),
                supervisor: Mutex::new(None),
                stopped: RwLock::new(false),
            }),
        }
    }

    /// Configuration the process was created with.
    pub fn config(&self) -> &SatelliteConfig {
        &self.inner.config
    }

    fn replica(&self) -> SatelliteResult<Arc<Replica>> {
        if *self.inner.stopped.read() {
            return Err(SatelliteError::Stopped);
        }
        let replica = self
            .inner
            .replica
            .read()
            .clone()
            .ok_or(SatelliteError::NotStarted)?;
        match replica.fatal() {
            Some(err) => Err(err),
            None => Ok(replica),
        }
    }

    /// This process's origin id.
    pub fn client_id(&self) -> SatelliteResult<String> {
        Ok(self.replica()?.client_id().to_string())
    }

    /// Protocol state of the current session.
    pub fn session_state(&self) -> SessionState {
        self.inner
            .replica
            .read()
            .as_ref()
            .map_or(SessionState::Disconnected, |r| r.session_state())
    }

    /// Last applied inbound LSN.
    pub fn lsn(&self) -> SatelliteResult<Lsn> {
        Ok(self.replica()?.lsn())
    }

    /// Number of local transactions the peer has not acknowledged.
    pub fn pending_transactions(&self) -> SatelliteResult<usize> {
        self.replica()?.pending_count()
    }

    /// The unrecoverable error that stopped replication, if any.
    pub fn failure(&self) -> Option<SatelliteError> {
        self.inner.replica.read().as_ref().and_then(|r| r.fatal())
    }

    fn spawn_supervisor(&self, initial: BackoffConfig) -> BoxFuture<'static, SatelliteResult<()>> {
        let replica = match self.replica() {
            Ok(replica) => replica,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        let mut supervisor = self.inner.supervisor.lock();
        if let Some(running) = supervisor.take() {
            if !running.is_finished()
                && self.inner.controller.status() == ConnectivityStatus::Connected
            {
                *supervisor = Some(running);
                return future::ready(Ok(())).boxed();
            }
            running.abort();
            replica.end_session(None);
        }

        self.inner.controller.connecting();
        let (first, outcome) = oneshot::channel();
        let task = Supervisor {
            replica,
            transport: Arc::clone(&self.inner.transport),
            controller: Arc::clone(&self.inner.controller),
            config: self.inner.config.clone(),
            wakeup: Arc::clone(&self.inner.wakeup),
        };
        *supervisor = Some(tokio::spawn(task.run(initial, first)));
        async move {
            outcome
                .await
                .unwrap_or_else(|_| Err(SatelliteError::Cancelled("connect".into())))
        }
        .boxed()
    }
}

#[async_trait]
impl Satellite for SatelliteProcess {
    fn db_name(&self) -> &str {
        &self.inner.config.db_name
    }

    async fn start(&self) -> SatelliteResult<()> {
        if *self.inner.stopped.read() {
            return Err(SatelliteError::Stopped);
        }
        let mut slot = self.inner.replica.write();
        if slot.is_some() {
            return Ok(());
        }
        let replica = Replica::open(
            &self.inner.config,
            Arc::clone(&self.inner.adapter),
            Arc::clone(&self.inner.notifier),
            &self.inner.schema,
            Arc::clone(&self.inner.wakeup),
        )?;
        info!(db = %self.inner.config.db_name, client_id = %replica.client_id(), "satellite started");
        *slot = Some(Arc::new(replica));
        Ok(())
    }

    fn connect(&self) -> BoxFuture<'static, SatelliteResult<()>> {
        self.spawn_supervisor(BackoffConfig::no_retry())
    }

    fn connect_with_backoff(&self) -> BoxFuture<'static, SatelliteResult<()>> {
        self.spawn_supervisor(self.inner.config.backoff.clone())
    }

    fn disconnect(&self, reason: Option<SatelliteError>) {
        if let Some(running) = self.inner.supervisor.lock().take() {
            running.abort();
        }
        if let Some(replica) = self.inner.replica.read().as_ref() {
            replica.end_session(None);
        }
        self.inner.controller.disconnected(reason);
    }

    async fn stop(&self) -> SatelliteResult<()> {
        self.disconnect(None);
        *self.inner.stopped.write() = true;
        self.inner.replica.write().take();
        info!(db = %self.inner.config.db_name, "satellite stopped");
        Ok(())
    }

    fn subscribe(&self, shapes: Vec<ShapeDefinition>) -> SatelliteResult<SubscriptionHandle> {
        self.replica()?.subscribe(shapes)
    }

    fn unsubscribe(&self, subscription_id: &str) -> SatelliteResult<()> {
        self.replica()?.unsubscribe(subscription_id)
    }

    fn unsubscribe_all(&self) -> SatelliteResult<Vec<String>> {
        self.replica()?.unsubscribe_all()
    }

    fn transact(&self, changes: Vec<LocalChange>) -> SatelliteResult<Transaction> {
        self.replica()?.transact(changes)
    }

    fn connectivity(&self) -> ConnectivityState {
        self.inner.controller.state()
    }

    fn watch_connectivity(&self) -> broadcast::Receiver<ConnectivityTransition> {
        self.inner.controller.subscribe()
    }

    fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .replica
            .read()
            .as_ref()
            .map(|r| r.subscriptions())
            .unwrap_or_default()
    }
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        if let Some(running) = self.supervisor.get_mut().take() {
            running.abort();
        }
    }
}
