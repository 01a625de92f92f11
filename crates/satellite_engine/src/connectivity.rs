//! Connectivity state and the reconnection supervisor.
//!
//! The controller is the single owner of [`ConnectivityState`]. Every change
//! goes through [`ConnectivityController::transition`], which publishes the
//! transition before returning, so a status read right after `connect()`
//! already observes `Connecting`.

use crate::config::{BackoffConfig, SatelliteConfig};
use crate::error::{ErrorKind, SatelliteError, SatelliteResult};
use crate::replica::Replica;
use crate::session::{ReplicationSession, SessionSettings};
use crate::transport::Transport;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, info, warn};

/// Connection status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    /// Not connected, not trying.
    Disconnected,
    /// Opening a connection or waiting to retry.
    Connecting,
    /// A session is replicating.
    Connected,
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityStatus::Disconnected => "disconnected",
            ConnectivityStatus::Connecting => "connecting",
            ConnectivityStatus::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Current status and the error behind the last disconnect, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityState {
    /// Current status.
    pub status: ConnectivityStatus,
    /// Why the last disconnect happened.
    pub reason: Option<SatelliteError>,
}

/// A published status change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityTransition {
    /// Database the transition belongs to.
    pub db_name: String,
    /// Previous status.
    pub from: ConnectivityStatus,
    /// New status.
    pub to: ConnectivityStatus,
    /// Error that caused the transition, if any.
    pub reason: Option<SatelliteError>,
}

/// Owns the connectivity state of one process and publishes its changes.
pub struct ConnectivityController {
    db_name: String,
    state: RwLock<ConnectivityState>,
    transitions: broadcast::Sender<ConnectivityTransition>,
}

impl ConnectivityController {
    /// Creates a disconnected controller.
    pub fn new(db_name: impl Into<String>) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            db_name: db_name.into(),
            state: RwLock::new(ConnectivityState {
                status: ConnectivityStatus::Disconnected,
                reason: None,
            }),
            transitions,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectivityState {
        self.state.read().clone()
    }

    /// Current status.
    pub fn status(&self) -> ConnectivityStatus {
        self.state.read().status
    }

    /// Receives every later transition.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityTransition> {
        self.transitions.subscribe()
    }

    /// Moves to `to`. Returns false, publishing nothing, if already there.
    pub fn transition(&self, to: ConnectivityStatus, reason: Option<SatelliteError>) -> bool {
        let mut state = self.state.write();
        let from = state.status;
        if from == to {
            if reason.is_some() {
                state.reason = reason;
            }
            return false;
        }
        state.status = to;
        state.reason = reason.clone();
        // Published under the lock so subscribers see transitions in order.
        let _ = self.transitions.send(ConnectivityTransition {
            db_name: self.db_name.clone(),
            from,
            to,
            reason,
        });
        drop(state);
        info!(db = %self.db_name, %from, %to, "connectivity changed");
        true
    }

    /// Shorthand for a transition to `Connecting`.
    pub fn connecting(&self) -> bool {
        self.transition(ConnectivityStatus::Connecting, None)
    }

    /// Shorthand for a transition to `Connected`.
    pub fn connected(&self) -> bool {
        self.transition(ConnectivityStatus::Connected, None)
    }

    /// Shorthand for a transition to `Disconnected`.
    pub fn disconnected(&self, reason: Option<SatelliteError>) -> bool {
        self.transition(ConnectivityStatus::Disconnected, reason)
    }
}

/// What the supervisor does after a failed attempt or a lost session.
#[derive(Debug, PartialEq)]
enum Recovery {
    /// Wait out the backoff delay and try again.
    Retry,
    /// Clear local shape data and try again immediately.
    Resync,
    /// Stay disconnected.
    GiveUp,
    /// Stop the process.
    Fail,
}

fn recovery_for(err: &SatelliteError, clear_on_behind_window: bool, resynced: bool) -> Recovery {
    match err.kind() {
        ErrorKind::Transport if err.is_retryable() => Recovery::Retry,
        ErrorKind::BehindWindow if clear_on_behind_window && !resynced => Recovery::Resync,
        ErrorKind::Protocol | ErrorKind::Storage => Recovery::Fail,
        _ => Recovery::GiveUp,
    }
}

/// Drives connection attempts, sessions and reconnection for one process.
pub(crate) struct Supervisor {
    pub(crate) replica: Arc<Replica>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) controller: Arc<ConnectivityController>,
    pub(crate) config: SatelliteConfig,
    pub(crate) wakeup: Arc<Notify>,
}

impl Supervisor {
    fn settings(&self) -> SessionSettings {
        SessionSettings {
            token: self.config.token.clone(),
            handshake_timeout: self.config.handshake_timeout,
            shape_delivery_timeout: self.config.shape_delivery_timeout,
        }
    }

    async fn attempt(&self) -> SatelliteResult<ReplicationSession> {
        let connection = self.transport.connect().await?;
        ReplicationSession::establish(Arc::clone(&self.replica), connection, self.settings()).await
    }

    /// Connects with `initial` backoff, reporting the outcome of the first
    /// connection on `first`. Lost sessions are re-established with the
    /// configured backoff until a non-retryable error or `disconnect`.
    pub(crate) async fn run(self, initial: BackoffConfig, first: oneshot::Sender<SatelliteResult<()>>) {
        let db = self.config.db_name.clone();
        let mut first = Some(first);
        let mut backoff = initial;
        let mut attempt: u32 = 0;
        let mut resynced = false;
        let mut last_error: Option<SatelliteError> = None;

        loop {
            if attempt >= backoff.max_attempts {
                let err = last_error.take().unwrap_or_else(|| {
                    SatelliteError::transport_retryable("no connection attempts allowed")
                });
                warn!(db = %db, attempts = attempt, "giving up reconnecting");
                self.controller.disconnected(Some(err.clone()));
                report(&mut first, Err(err));
                return;
            }
            let delay = backoff.delay_for_attempt(attempt);
            if !delay.is_zero() {
                debug!(db = %db, attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
            self.controller.connecting();

            let err = match self.attempt().await {
                Ok(session) => {
                    self.controller.connected();
                    report(&mut first, Ok(()));
                    attempt = 0;
                    resynced = false;
                    backoff = self.config.backoff.clone();
                    session.run(Arc::clone(&self.wakeup)).await
                }
                Err(err) => err,
            };

            match recovery_for(&err, self.config.clear_on_behind_window, resynced) {
                Recovery::Retry => {
                    debug!(db = %db, error = %err, "connection lost");
                    self.controller.disconnected(Some(err.clone()));
                    last_error = Some(err);
                }
                Recovery::Resync => {
                    warn!(db = %db, error = %err, "behind replication window, resyncing");
                    if let Err(reset) = self.replica.reset_for_resync() {
                        self.controller.disconnected(Some(reset.clone()));
                        report(&mut first, Err(reset));
                        return;
                    }
                    resynced = true;
                    attempt = 0;
                }
                Recovery::GiveUp => {
                    warn!(db = %db, error = %err, "not reconnecting");
                    self.controller.disconnected(Some(err.clone()));
                    report(&mut first, Err(err));
                    return;
                }
                Recovery::Fail => {
                    self.replica.poison(err.clone());
                    self.controller.disconnected(Some(err.clone()));
                    report(&mut first, Err(err));
                    return;
                }
            }
        }
    }
}

fn report(first: &mut Option<oneshot::Sender<SatelliteResult<()>>>, outcome: SatelliteResult<()>) {
    if let Some(sender) = first.take() {
        let _ = sender.send(outcome);
    }
}
