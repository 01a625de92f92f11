//! Test double for [`Satellite`].

use crate::connectivity::{ConnectivityController, ConnectivityState, ConnectivityTransition};
use crate::error::{SatelliteError, SatelliteResult};
use crate::notifier::{ChangeOrigin, Notifier, TableChange};
use crate::process::Satellite;
use crate::replica::LocalChange;
use crate::shapes::{SubscriptionHandle, SubscriptionInfo, SubscriptionState, SubscriptionStatus};
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use satellite_protocol::{Operation, ShapeDefinition, ShapeRequest, Tag, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

struct MockSubscription {
    shapes: Vec<ShapeRequest>,
    status: watch::Sender<SubscriptionStatus>,
}

/// A satellite that never talks to a peer.
///
/// Connecting succeeds at once, subscriptions are fulfilled as soon as they
/// are made, and local writes are recorded instead of replicated.
pub struct MockSatellite {
    db_name: String,
    client_id: String,
    tables: BTreeSet<String>,
    notifier: Arc<dyn Notifier>,
    controller: ConnectivityController,
    started: AtomicBool,
    stopped: AtomicBool,
    clock: AtomicU64,
    subscriptions: Mutex<BTreeMap<String, MockSubscription>>,
    transactions: Mutex<Vec<Transaction>>,
}

impl MockSatellite {
    /// Creates a mock for `db_name` knowing the given tables.
    pub fn new<I, S>(db_name: impl Into<String>, tables: I, notifier: Arc<dyn Notifier>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let db_name = db_name.into();
        Self {
            controller: ConnectivityController::new(db_name.clone()),
            db_name,
            client_id: format!("mock-{}", Uuid::new_v4()),
            tables: tables.into_iter().map(Into::into).collect(),
            notifier,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            subscriptions: Mutex::new(BTreeMap::new()),
            transactions: Mutex::new(Vec::new()),
        }
    }

    /// Every transaction written through the mock, in order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.lock().clone()
    }

    /// Whether `start` has been called.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ready(&self) -> SatelliteResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SatelliteError::Stopped);
        }
        if !self.is_started() {
            return Err(SatelliteError::NotStarted);
        }
        Ok(())
    }

    fn connect_now(&self) -> BoxFuture<'static, SatelliteResult<()>> {
        let outcome = self.ready().map(|()| {
            self.controller.connecting();
            self.controller.connected();
        });
        future::ready(outcome).boxed()
    }
}

#[async_trait]
impl Satellite for MockSatellite {
    fn db_name(&self) -> &str {
        &self.db_name
    }

    async fn start(&self) -> SatelliteResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SatelliteError::Stopped);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connect(&self) -> BoxFuture<'static, SatelliteResult<()>> {
        self.connect_now()
    }

    fn connect_with_backoff(&self) -> BoxFuture<'static, SatelliteResult<()>> {
        self.connect_now()
    }

    fn disconnect(&self, reason: Option<SatelliteError>) {
        self.controller.disconnected(reason);
    }

    async fn stop(&self) -> SatelliteResult<()> {
        self.disconnect(None);
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe(&self, shapes: Vec<ShapeDefinition>) -> SatelliteResult<SubscriptionHandle> {
        self.ready()?;
        for shape in &shapes {
            if let Some(missing) = shape.tables().into_iter().find(|t| !self.tables.contains(t)) {
                return Err(SatelliteError::TableNotFound(missing));
            }
        }
        let id = Uuid::new_v4().to_string();
        let (status, receiver) = watch::channel(SubscriptionStatus {
            state: SubscriptionState::Fulfilled,
            error: None,
        });
        let shapes = shapes
            .into_iter()
            .map(|definition| ShapeRequest::new(Uuid::new_v4().to_string(), definition))
            .collect();
        self.subscriptions
            .lock()
            .insert(id.clone(), MockSubscription { shapes, status });
        Ok(SubscriptionHandle::new(id, receiver))
    }

    fn unsubscribe(&self, subscription_id: &str) -> SatelliteResult<()> {
        self.ready()?;
        self.subscriptions
            .lock()
            .remove(subscription_id)
            .map(|_| ())
            .ok_or_else(|| SatelliteError::SubscriptionNotFound(subscription_id.to_string()))
    }

    fn unsubscribe_all(&self) -> SatelliteResult<Vec<String>> {
        self.ready()?;
        let mut subscriptions = self.subscriptions.lock();
        let ids = subscriptions.keys().cloned().collect();
        subscriptions.clear();
        Ok(ids)
    }

    fn transact(&self, changes: Vec<LocalChange>) -> SatelliteResult<Transaction> {
        self.ready()?;
        if let Some(change) = changes.iter().find(|c| !self.tables.contains(c.table())) {
            return Err(SatelliteError::TableNotFound(change.table().to_string()));
        }
        let timestamp = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let tag = Tag::new(self.client_id.clone(), timestamp);
        let operations: Vec<Operation> = changes
            .into_iter()
            .map(|change| change.into_operation(tag.clone()))
            .collect();
        let transaction = Transaction::new(self.client_id.clone(), timestamp, operations)
            .map_err(|e| SatelliteError::InvalidChange(e.to_string()))?;
        self.transactions.lock().push(transaction.clone());
        self.notifier.tables_changed(&TableChange {
            db_name: self.db_name.clone(),
            tables: transaction.tables(),
            origin: ChangeOrigin::Local,
        });
        Ok(transaction)
    }

    fn connectivity(&self) -> ConnectivityState {
        self.controller.state()
    }

    fn watch_connectivity(&self) -> broadcast::Receiver<ConnectivityTransition> {
        self.controller.subscribe()
    }

    fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(id, sub)| SubscriptionInfo {
                id: id.clone(),
                state: sub.status.borrow().state,
                shapes: sub.shapes.clone(),
                lsn: None,
            })
            .collect()
    }
}
