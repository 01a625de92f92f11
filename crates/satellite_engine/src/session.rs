//! Replication session protocol state machine.
//!
//! ```text
//! Disconnected ──► Authenticating ──► Negotiating ──► Replicating
//!       ▲                │                 │               │
//!       └────────────────┴──── error / transport loss ─────┘
//! ```
//!
//! Once replicating, the inbound and outbound flows run as two futures on
//! the same task: a writer suspended on a full transport buffer never stops
//! the reader from applying inbound frames.

use crate::error::{SatelliteError, SatelliteResult};
use crate::replica::Replica;
use crate::transport::{Connection, FrameReceiver, FrameSender};
use satellite_protocol::{
    AuthRequest, SatelliteMessage, StartReplicationErrorCode, StartReplicationRequest,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Protocol state of the replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Credentials sent, waiting for the verdict.
    Authenticating,
    /// Resume point and subscriptions sent, waiting for the peer.
    Negotiating,
    /// Both flows running.
    Replicating,
}

/// Settings for one session.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub(crate) token: String,
    pub(crate) handshake_timeout: Duration,
    pub(crate) shape_delivery_timeout: Duration,
}

/// A negotiated session, ready to replicate.
pub(crate) struct ReplicationSession {
    replica: Arc<Replica>,
    settings: SessionSettings,
    epoch: u64,
    sender: FrameSender,
    receiver: FrameReceiver,
}

async fn send(sender: &FrameSender, message: &SatelliteMessage) -> SatelliteResult<()> {
    let frame = message.encode()?;
    sender
        .send(frame)
        .await
        .map_err(|_| SatelliteError::transport_retryable("connection closed while sending"))
}

async fn recv(receiver: &mut FrameReceiver) -> SatelliteResult<SatelliteMessage> {
    match receiver.recv().await {
        Some(frame) => Ok(SatelliteMessage::decode(&frame)?),
        None => Err(SatelliteError::transport_retryable("connection closed by peer")),
    }
}

fn unexpected(message: &SatelliteMessage, during: &str) -> SatelliteError {
    SatelliteError::Protocol(format!("unexpected {} during {during}", message.name()))
}

impl ReplicationSession {
    /// Authenticates and negotiates the resume point.
    ///
    /// On error the session epoch is already closed.
    pub(crate) async fn establish(
        replica: Arc<Replica>,
        connection: Connection,
        settings: SessionSettings,
    ) -> SatelliteResult<Self> {
        let epoch = replica.begin_session()?;
        let mut session = Self {
            replica,
            settings,
            epoch,
            sender: connection.sender,
            receiver: connection.receiver,
        };
        match session.handshake().await {
            Ok(()) => Ok(session),
            Err(err) => {
                session.replica.end_session(Some(epoch));
                Err(err)
            }
        }
    }

    async fn next_handshake_message(&mut self, during: &str) -> SatelliteResult<SatelliteMessage> {
        tokio::time::timeout(self.settings.handshake_timeout, recv(&mut self.receiver))
            .await
            .map_err(|_| SatelliteError::Timeout(during.to_string()))?
    }

    async fn handshake(&mut self) -> SatelliteResult<()> {
        let db = self.replica.db_name().to_string();
        send(
            &self.sender,
            &SatelliteMessage::AuthRequest(AuthRequest {
                client_id: self.replica.client_id().to_string(),
                token: self.settings.token.clone(),
            }),
        )
        .await?;
        match self.next_handshake_message("authentication").await? {
            SatelliteMessage::AuthResponse(response) => {
                if let Some(error) = response.error {
                    warn!(db = %db, code = ?error.code, "authentication rejected");
                    return Err(SatelliteError::Auth(error.message));
                }
                debug!(db = %db, server_id = ?response.server_id, "authenticated");
            }
            SatelliteMessage::Error(error) => return Err(SatelliteError::Protocol(error.message)),
            other => return Err(unexpected(&other, "authentication")),
        }

        self.replica
            .set_session_state(self.epoch, SessionState::Negotiating);
        let (lsn, subscription_ids) = self.replica.resume_point();
        info!(db = %db, lsn = %lsn, subscriptions = subscription_ids.len(), "starting replication");
        send(
            &self.sender,
            &SatelliteMessage::StartReplicationRequest(StartReplicationRequest {
                lsn,
                subscription_ids,
            }),
        )
        .await?;
        loop {
            match self.next_handshake_message("replication start").await? {
                SatelliteMessage::StartReplicationResponse(response) => {
                    if let Some(error) = response.error {
                        return Err(match error.code {
                            StartReplicationErrorCode::BehindWindow
                            | StartReplicationErrorCode::InvalidPosition
                            | StartReplicationErrorCode::SubscriptionNotFound => {
                                SatelliteError::BehindWindow(error.message)
                            }
                            StartReplicationErrorCode::Internal => {
                                SatelliteError::transport_retryable(error.message)
                            }
                        });
                    }
                    break;
                }
                SatelliteMessage::Relation(relation) => {
                    self.replica.apply_relation(self.epoch, relation)?;
                }
                SatelliteMessage::Error(error) => {
                    return Err(SatelliteError::Protocol(error.message))
                }
                other => return Err(unexpected(&other, "replication start")),
            }
        }

        self.replica
            .set_session_state(self.epoch, SessionState::Replicating);
        info!(db = %db, "replicating");
        Ok(())
    }

    /// Runs both flows until one fails. Returns the error that ended the
    /// session; the session epoch is closed before returning.
    pub(crate) async fn run(self, wakeup: Arc<Notify>) -> SatelliteError {
        let Self {
            replica,
            settings,
            epoch,
            sender,
            mut receiver,
        } = self;
        // Anything queued before the session started goes out first.
        wakeup.notify_one();

        let inbound = inbound_flow(&replica, epoch, &mut receiver);
        let outbound = outbound_flow(&replica, epoch, &sender, &wakeup, &settings);
        let ended = tokio::select! {
            result = inbound => result,
            result = outbound => result,
        };
        replica.end_session(Some(epoch));
        match ended {
            Err(err) => err,
            Ok(never) => match never {},
        }
    }
}

async fn inbound_flow(
    replica: &Replica,
    epoch: u64,
    receiver: &mut FrameReceiver,
) -> SatelliteResult<Infallible> {
    loop {
        match recv(receiver).await? {
            SatelliteMessage::Relation(relation) => replica.apply_relation(epoch, relation)?,
            SatelliteMessage::Transaction(transaction) => {
                replica.apply_transaction(epoch, transaction)?
            }
            SatelliteMessage::TransactionAck(ack) => replica.acknowledge(epoch, &ack.lsn)?,
            SatelliteMessage::SubscriptionResponse(response) => {
                replica.on_subscription_response(epoch, &response)?
            }
            SatelliteMessage::SubscriptionDataBegin(begin) => replica.on_data_begin(epoch, begin)?,
            SatelliteMessage::DataChange(change) => replica.on_data_change(epoch, change)?,
            SatelliteMessage::SubscriptionDataCommit(commit) => {
                replica.on_data_commit(epoch, &commit.subscription_id)?
            }
            SatelliteMessage::SubscriptionDataError(error) => replica.on_data_error(epoch, &error)?,
            reply @ (SatelliteMessage::UnsubscribeResponse(_)
            | SatelliteMessage::StopReplicationResponse(_)) => {
                debug!(db = %replica.db_name(), message = reply.name(), "acknowledged");
            }
            SatelliteMessage::StopReplicationRequest(_) => {
                return Err(SatelliteError::transport_retryable("peer stopped replication"))
            }
            SatelliteMessage::Error(error) => return Err(SatelliteError::Protocol(error.message)),
            other => return Err(unexpected(&other, "replication")),
        }
    }
}

async fn outbound_flow(
    replica: &Replica,
    epoch: u64,
    sender: &FrameSender,
    wakeup: &Notify,
    settings: &SessionSettings,
) -> SatelliteResult<Infallible> {
    let period = (settings.shape_delivery_timeout / 4).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if let Some(err) = replica.fatal() {
            return Err(err);
        }
        let batch = replica.outbound(epoch)?;
        for message in &batch.messages {
            send(sender, message).await?;
        }
        if batch.more {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = wakeup.notified() => {}
            _ = ticker.tick() => {
                replica.expire(epoch, settings.shape_delivery_timeout)?;
            }
        }
    }
}
