//! Shape subscription lifecycle.
//!
//! ```text
//! subscribe ──► Requested ──begin──► Fulfilling ──commit──► Fulfilled
//!                   │                    │
//!                   └──── error ─────────┴──────────────► Errored
//! ```
//!
//! Delivery frames arrive strictly as `begin → data* → commit` for one
//! subscription at a time. Data is buffered until commit and handed to the
//! caller to apply as one local transaction; only after that commits is the
//! subscription marked fulfilled and persisted.

use crate::error::{SatelliteError, SatelliteResult};
use satellite_protocol::{
    from_cbor, shape_hash, to_cbor, DataChange, Lsn, Operation, ShapeDefinition, ShapeRequest,
    SubscriptionError, SubscriptionRequest, SubscriptionResponse, UnsubscribeRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// Sent (or waiting to be sent) to the peer.
    Requested,
    /// Initial data is streaming.
    Fulfilling,
    /// Initial data applied; live changes flow.
    Fulfilled,
    /// Failed; see the handle's error.
    Errored,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Requested => "requested",
            SubscriptionState::Fulfilling => "fulfilling",
            SubscriptionState::Fulfilled => "fulfilled",
            SubscriptionState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// State published to handles.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionStatus {
    /// Current state.
    pub state: SubscriptionState,
    /// Failure, when errored.
    pub error: Option<SatelliteError>,
}

impl SubscriptionStatus {
    fn new(state: SubscriptionState) -> Self {
        Self { state, error: None }
    }
}

/// Handle returned by `subscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    status: watch::Receiver<SubscriptionStatus>,
}

impl SubscriptionHandle {
    /// Creates a handle from a status channel.
    pub fn new(id: impl Into<String>, status: watch::Receiver<SubscriptionStatus>) -> Self {
        Self {
            id: id.into(),
            status,
        }
    }

    /// Subscription id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        self.status.borrow().state
    }

    /// Waits until the subscription is fulfilled or has failed.
    pub async fn synced(&self) -> SatelliteResult<()> {
        let mut status = self.status.clone();
        loop {
            {
                let current = status.borrow_and_update();
                match current.state {
                    SubscriptionState::Fulfilled => return Ok(()),
                    SubscriptionState::Errored => {
                        return Err(current.error.clone().unwrap_or_else(|| {
                            SatelliteError::Cancelled(format!("subscription {}", self.id))
                        }))
                    }
                    SubscriptionState::Requested | SubscriptionState::Fulfilling => {}
                }
            }
            if status.changed().await.is_err() {
                return Err(SatelliteError::Cancelled(format!(
                    "subscription {} was released",
                    self.id
                )));
            }
        }
    }
}

/// Read-only view of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    /// Subscription id.
    pub id: String,
    /// Current state.
    pub state: SubscriptionState,
    /// Requested shapes.
    pub shapes: Vec<ShapeRequest>,
    /// Snapshot LSN, once data has begun.
    pub lsn: Option<Lsn>,
}

/// A request waiting to go out on the next session.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Ask the peer for shapes.
    Subscribe(SubscriptionRequest),
    /// Release shapes on the peer.
    Unsubscribe(UnsubscribeRequest),
}

/// Buffered initial data ready to be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Subscription id.
    pub subscription_id: String,
    /// Snapshot LSN.
    pub lsn: Lsn,
    /// Rows, as inserts, in arrival order.
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Persisted {
    id: String,
    hash: String,
    shapes: Vec<ShapeRequest>,
    lsn: Option<Lsn>,
}

struct Entry {
    persisted: Persisted,
    status: watch::Sender<SubscriptionStatus>,
    sent_at: Option<Instant>,
}

impl Entry {
    fn state(&self) -> SubscriptionState {
        self.status.borrow().state
    }

    fn set_state(&self, state: SubscriptionState) {
        self.status.send_replace(SubscriptionStatus::new(state));
    }

    fn fail(&self, error: SatelliteError) {
        self.status.send_replace(SubscriptionStatus {
            state: SubscriptionState::Errored,
            error: Some(error),
        });
    }

    fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle::new(self.persisted.id.clone(), self.status.subscribe())
    }

    fn tables(&self) -> BTreeSet<String> {
        self.persisted
            .shapes
            .iter()
            .flat_map(|s| s.definition.tables())
            .collect()
    }

    fn request(&self) -> SubscriptionRequest {
        SubscriptionRequest {
            subscription_id: self.persisted.id.clone(),
            shapes: self.persisted.shapes.clone(),
        }
    }
}

struct InFlight {
    delivery: Delivery,
    // Frames for a subscription cancelled mid-delivery are consumed and dropped.
    dropped: bool,
}

/// Owns every subscription of one process.
pub struct ShapeSubscriptionManager {
    entries: BTreeMap<String, Entry>,
    in_flight: Option<InFlight>,
    outbox: VecDeque<Outgoing>,
}

impl ShapeSubscriptionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            in_flight: None,
            outbox: VecDeque::new(),
        }
    }

    /// Restores fulfilled subscriptions from their persisted form.
    pub fn restore(bytes: Option<&[u8]>) -> SatelliteResult<Self> {
        let mut manager = Self::new();
        let Some(bytes) = bytes else {
            return Ok(manager);
        };
        let persisted: Vec<Persisted> = from_cbor(bytes)
            .map_err(|e| SatelliteError::storage(format!("corrupt subscription state: {e}")))?;
        for p in persisted {
            let (status, _) = watch::channel(SubscriptionStatus::new(SubscriptionState::Fulfilled));
            manager.entries.insert(
                p.id.clone(),
                Entry {
                    persisted: p,
                    status,
                    sent_at: None,
                },
            );
        }
        Ok(manager)
    }

    /// Serializes fulfilled subscriptions, treating `also` as fulfilled.
    pub fn serialize_with(&self, also: Option<&str>) -> SatelliteResult<Vec<u8>> {
        let persisted: Vec<&Persisted> = self
            .entries
            .values()
            .filter(|e| {
                e.state() == SubscriptionState::Fulfilled || Some(e.persisted.id.as_str()) == also
            })
            .map(|e| &e.persisted)
            .collect();
        Ok(to_cbor(&persisted)?)
    }

    /// Serializes fulfilled subscriptions.
    pub fn serialize(&self) -> SatelliteResult<Vec<u8>> {
        self.serialize_with(None)
    }

    /// Registers a subscription for `definitions`.
    ///
    /// `table_exists` decides whether a table is known locally. A request
    /// identical to a live subscription returns that subscription's handle.
    pub fn subscribe(
        &mut self,
        definitions: Vec<ShapeDefinition>,
        table_exists: impl Fn(&str) -> bool,
    ) -> SatelliteResult<SubscriptionHandle> {
        if definitions.is_empty() {
            return Err(SatelliteError::shape(
                satellite_protocol::ShapeErrorCode::Internal,
                "a subscription needs at least one shape",
            ));
        }
        for definition in &definitions {
            if let Some(missing) = definition.tables().into_iter().find(|t| !table_exists(t)) {
                return Err(SatelliteError::TableNotFound(missing));
            }
        }

        let hash = shape_hash(&definitions)?;
        if let Some(existing) = self
            .entries
            .values()
            .find(|e| e.persisted.hash == hash && e.state() != SubscriptionState::Errored)
        {
            debug!(subscription_id = %existing.persisted.id, "reusing identical subscription");
            return Ok(existing.handle());
        }

        let id = Uuid::new_v4().to_string();
        let shapes = definitions
            .into_iter()
            .map(|d| ShapeRequest::new(Uuid::new_v4().to_string(), d))
            .collect();
        let (status, _) = watch::channel(SubscriptionStatus::new(SubscriptionState::Requested));
        let entry = Entry {
            persisted: Persisted {
                id: id.clone(),
                hash,
                shapes,
                lsn: None,
            },
            status,
            sent_at: None,
        };
        self.outbox.push_back(Outgoing::Subscribe(entry.request()));
        let handle = entry.handle();
        self.entries.insert(id.clone(), entry);
        info!(subscription_id = %id, "subscription requested");
        Ok(handle)
    }

    /// Drains requests to send, stamping subscribe requests as sent.
    pub fn take_outgoing(&mut self, now: Instant) -> Vec<Outgoing> {
        let outgoing: Vec<Outgoing> = self.outbox.drain(..).collect();
        for message in &outgoing {
            if let Outgoing::Subscribe(request) = message {
                if let Some(entry) = self.entries.get_mut(&request.subscription_id) {
                    entry.sent_at = Some(now);
                }
            }
        }
        outgoing
    }

    /// Handles the peer's verdict on a subscription request.
    pub fn on_response(&mut self, response: &SubscriptionResponse) {
        let Some(entry) = self.entries.get(&response.subscription_id) else {
            warn!(subscription_id = %response.subscription_id, "response for unknown subscription");
            return;
        };
        if let Some(error) = &response.error {
            warn!(subscription_id = %response.subscription_id, code = ?error.code, "subscription rejected");
            entry.fail(shape_error(error));
        }
    }

    /// Starts a delivery. Returns false if its frames are to be dropped.
    pub fn begin(&mut self, subscription_id: &str, lsn: Lsn) -> SatelliteResult<bool> {
        if let Some(in_flight) = &self.in_flight {
            return Err(SatelliteError::Protocol(format!(
                "delivery for {subscription_id} began while {} is still open",
                in_flight.delivery.subscription_id
            )));
        }
        let dropped = match self.entries.get(subscription_id).map(|e| (e, e.state())) {
            Some((entry, SubscriptionState::Requested)) => {
                entry.set_state(SubscriptionState::Fulfilling);
                false
            }
            // Failed locally (a timeout) while the peer kept streaming.
            Some((_, SubscriptionState::Errored)) | None => true,
            Some((_, state)) => {
                return Err(SatelliteError::Protocol(format!(
                    "delivery for {subscription_id} began in state {state}"
                )))
            }
        };
        self.in_flight = Some(InFlight {
            delivery: Delivery {
                subscription_id: subscription_id.to_string(),
                lsn,
                operations: Vec::new(),
            },
            dropped,
        });
        Ok(!dropped)
    }

    /// Buffers one row of the open delivery.
    pub fn data(&mut self, change: DataChange) -> SatelliteResult<()> {
        let in_flight = self.open_delivery(&change.subscription_id)?;
        if !in_flight.dropped {
            in_flight.delivery.operations.push(change.operation);
        }
        Ok(())
    }

    /// Closes the open delivery, returning the data to apply (or `None` if
    /// the subscription was cancelled while it streamed).
    pub fn commit(&mut self, subscription_id: &str) -> SatelliteResult<Option<Delivery>> {
        self.open_delivery(subscription_id)?;
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(None);
        };
        if in_flight.dropped {
            // The peer registered the subscription when it sent the data.
            debug!(subscription_id, "releasing dropped delivery on the peer");
            self.outbox.push_back(Outgoing::Unsubscribe(UnsubscribeRequest {
                subscription_ids: vec![subscription_id.to_string()],
            }));
            return Ok(None);
        }
        Ok(Some(in_flight.delivery))
    }

    fn open_delivery(&mut self, subscription_id: &str) -> SatelliteResult<&mut InFlight> {
        match self.in_flight.as_ref().map(|f| f.delivery.subscription_id.as_str()) {
            Some(open) if open == subscription_id => {}
            Some(open) => {
                return Err(SatelliteError::Protocol(format!(
                    "frame for {subscription_id} while delivering {open}"
                )))
            }
            None => {
                return Err(SatelliteError::Protocol(format!(
                    "frame for {subscription_id} outside a delivery"
                )))
            }
        }
        self.in_flight
            .as_mut()
            .ok_or_else(|| SatelliteError::Protocol(format!("no delivery for {subscription_id}")))
    }

    /// Marks a subscription fulfilled after its data has been committed.
    pub fn mark_fulfilled(&mut self, subscription_id: &str, lsn: Lsn) {
        if let Some(entry) = self.entries.get_mut(subscription_id) {
            entry.persisted.lsn = Some(lsn);
            entry.sent_at = None;
            entry.set_state(SubscriptionState::Fulfilled);
            info!(subscription_id, "subscription fulfilled");
        }
    }

    /// Fails a subscription, discarding any partial data it had.
    pub fn fail(&mut self, subscription_id: &str, error: SatelliteError) {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.delivery.subscription_id == subscription_id)
        {
            self.in_flight = None;
        }
        if let Some(entry) = self.entries.get(subscription_id) {
            warn!(subscription_id, %error, "subscription errored");
            entry.fail(error);
        }
    }

    /// Handles a peer-reported delivery failure.
    pub fn delivery_error(&mut self, subscription_id: &str, error: &SubscriptionError) {
        self.fail(subscription_id, shape_error(error));
    }

    /// Releases a fulfilled subscription.
    pub fn unsubscribe(&mut self, subscription_id: &str) -> SatelliteResult<()> {
        let entry = self
            .entries
            .get(subscription_id)
            .ok_or_else(|| SatelliteError::SubscriptionNotFound(subscription_id.to_string()))?;
        let state = entry.state();
        if state != SubscriptionState::Fulfilled {
            return Err(SatelliteError::InvalidSubscriptionState {
                id: subscription_id.to_string(),
                state: state.to_string(),
                expected: SubscriptionState::Fulfilled.to_string(),
            });
        }
        self.entries.remove(subscription_id);
        self.outbox.push_back(Outgoing::Unsubscribe(UnsubscribeRequest {
            subscription_ids: vec![subscription_id.to_string()],
        }));
        info!(subscription_id, "unsubscribed");
        Ok(())
    }

    /// Releases every subscription: fulfilled ones on the peer, pending ones
    /// by cancelling their handles. Returns the released ids.
    pub fn unsubscribe_all(&mut self) -> Vec<String> {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        let fulfilled: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.state() == SubscriptionState::Fulfilled)
            .map(|e| e.persisted.id.clone())
            .collect();
        for entry in self.entries.values() {
            if entry.state() != SubscriptionState::Fulfilled {
                entry.fail(SatelliteError::Cancelled(format!(
                    "subscription {}",
                    entry.persisted.id
                )));
            }
        }
        if let Some(in_flight) = &mut self.in_flight {
            in_flight.dropped = true;
        }
        self.entries.clear();
        self.outbox.retain(|o| !matches!(o, Outgoing::Subscribe(_)));
        if !fulfilled.is_empty() {
            self.outbox.push_back(Outgoing::Unsubscribe(UnsubscribeRequest {
                subscription_ids: fulfilled,
            }));
        }
        ids
    }

    /// Ids of fulfilled subscriptions, re-asserted on reconnect.
    pub fn fulfilled_ids(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.state() == SubscriptionState::Fulfilled)
            .map(|e| e.persisted.id.clone())
            .collect()
    }

    /// Session ended: drop partial data and queue unfulfilled requests to be
    /// sent again on the next session.
    pub fn on_session_end(&mut self) {
        self.in_flight = None;
        self.outbox.retain(|o| !matches!(o, Outgoing::Subscribe(_)));
        for entry in self.entries.values_mut() {
            match entry.state() {
                SubscriptionState::Fulfilling | SubscriptionState::Requested => {
                    entry.set_state(SubscriptionState::Requested);
                    entry.sent_at = None;
                    self.outbox.push_back(Outgoing::Subscribe(entry.request()));
                }
                SubscriptionState::Fulfilled | SubscriptionState::Errored => {}
            }
        }
    }

    /// Full resync: every fulfilled subscription is requested again from
    /// scratch. Returns the tables whose local data must be cleared.
    pub fn reset_for_resync(&mut self) -> BTreeSet<String> {
        self.on_session_end();
        let mut tables = BTreeSet::new();
        for entry in self.entries.values_mut() {
            if entry.state() == SubscriptionState::Fulfilled {
                tables.extend(entry.tables());
                entry.persisted.lsn = None;
                entry.set_state(SubscriptionState::Requested);
                self.outbox.push_back(Outgoing::Subscribe(entry.request()));
            }
        }
        tables
    }

    /// Fails subscriptions sent more than `timeout` ago and still unfulfilled.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| {
                matches!(
                    e.state(),
                    SubscriptionState::Requested | SubscriptionState::Fulfilling
                ) && e
                    .sent_at
                    .is_some_and(|sent| now.saturating_duration_since(sent) >= timeout)
            })
            .map(|e| e.persisted.id.clone())
            .collect();
        for id in &expired {
            // Frames still on the wire for it are consumed and dropped.
            if let Some(in_flight) = self
                .in_flight
                .as_mut()
                .filter(|f| f.delivery.subscription_id == *id)
            {
                in_flight.dropped = true;
                in_flight.delivery.operations.clear();
            }
            if let Some(entry) = self.entries.get(id) {
                entry.fail(SatelliteError::Timeout(format!("delivery of subscription {id}")));
            }
        }
        expired
    }

    /// Tables covered by fulfilled subscriptions.
    pub fn fulfilled_tables(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|e| e.state() == SubscriptionState::Fulfilled)
            .flat_map(Entry::tables)
            .collect()
    }

    /// Tables covered by every subscription that has not failed.
    pub fn active_tables(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|e| e.state() != SubscriptionState::Errored)
            .flat_map(Entry::tables)
            .collect()
    }

    /// Current state of a subscription.
    pub fn state(&self, subscription_id: &str) -> Option<SubscriptionState> {
        self.entries.get(subscription_id).map(Entry::state)
    }

    /// Tables covered by a subscription.
    pub fn tables_of(&self, subscription_id: &str) -> BTreeSet<String> {
        self.entries
            .get(subscription_id)
            .map(Entry::tables)
            .unwrap_or_default()
    }

    /// Snapshot of every subscription.
    pub fn info(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .values()
            .map(|e| SubscriptionInfo {
                id: e.persisted.id.clone(),
                state: e.state(),
                shapes: e.persisted.shapes.clone(),
                lsn: e.persisted.lsn.clone(),
            })
            .collect()
    }
}

impl Default for ShapeSubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn shape_error(error: &SubscriptionError) -> SatelliteError {
    let detail = error
        .shape_errors
        .iter()
        .map(|e| format!("{}: {}", e.request_id, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    let message = if detail.is_empty() {
        error.message.clone()
    } else {
        format!("{} ({detail})", error.message)
    };
    SatelliteError::shape(error.code, message)
}
