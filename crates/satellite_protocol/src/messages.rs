//! Wire messages exchanged between a satellite and its peer.
//!
//! A frame is one type-code byte followed by the CBOR body of the message.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::lsn::Lsn;
use crate::operation::Operation;
use crate::relation::Relation;
use crate::shape::ShapeRequest;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum SatelliteMessage {
    /// Client credentials.
    AuthRequest(AuthRequest),
    /// Server verdict on credentials.
    AuthResponse(AuthResponse),
    /// Schema of one table.
    Relation(Relation),
    /// Request for one or more shapes.
    SubscriptionRequest(SubscriptionRequest),
    /// Accept or reject a subscription.
    SubscriptionResponse(SubscriptionResponse),
    /// Start of a subscription's initial data.
    SubscriptionDataBegin(SubscriptionDataBegin),
    /// One row of a subscription's initial data.
    DataChange(DataChange),
    /// End of a subscription's initial data.
    SubscriptionDataCommit(SubscriptionDataCommit),
    /// Delivery of a subscription failed.
    SubscriptionDataError(SubscriptionDataError),
    /// Release subscriptions.
    UnsubscribeRequest(UnsubscribeRequest),
    /// Subscriptions released.
    UnsubscribeResponse(UnsubscribeResponse),
    /// Begin streaming from an LSN.
    StartReplicationRequest(StartReplicationRequest),
    /// Streaming accepted or refused.
    StartReplicationResponse(StartReplicationResponse),
    /// Stop streaming.
    StopReplicationRequest(StopReplicationRequest),
    /// Streaming stopped.
    StopReplicationResponse(StopReplicationResponse),
    /// A committed transaction, in either direction.
    Transaction(Transaction),
    /// Peer has durably received client transactions up to `lsn`.
    TransactionAck(TransactionAck),
    /// Peer reports a protocol violation.
    Error(ErrorMessage),
}

impl SatelliteMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SatelliteMessage::AuthRequest(_) => 0x01,
            SatelliteMessage::AuthResponse(_) => 0x02,
            SatelliteMessage::Relation(_) => 0x03,
            SatelliteMessage::SubscriptionRequest(_) => 0x10,
            SatelliteMessage::SubscriptionResponse(_) => 0x11,
            SatelliteMessage::SubscriptionDataBegin(_) => 0x12,
            SatelliteMessage::DataChange(_) => 0x13,
            SatelliteMessage::SubscriptionDataCommit(_) => 0x14,
            SatelliteMessage::SubscriptionDataError(_) => 0x15,
            SatelliteMessage::UnsubscribeRequest(_) => 0x16,
            SatelliteMessage::UnsubscribeResponse(_) => 0x17,
            SatelliteMessage::StartReplicationRequest(_) => 0x20,
            SatelliteMessage::StartReplicationResponse(_) => 0x21,
            SatelliteMessage::StopReplicationRequest(_) => 0x22,
            SatelliteMessage::StopReplicationResponse(_) => 0x23,
            SatelliteMessage::Transaction(_) => 0x30,
            SatelliteMessage::TransactionAck(_) => 0x31,
            SatelliteMessage::Error(_) => 0x7f,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SatelliteMessage::AuthRequest(_) => "AuthRequest",
            SatelliteMessage::AuthResponse(_) => "AuthResponse",
            SatelliteMessage::Relation(_) => "Relation",
            SatelliteMessage::SubscriptionRequest(_) => "SubscriptionRequest",
            SatelliteMessage::SubscriptionResponse(_) => "SubscriptionResponse",
            SatelliteMessage::SubscriptionDataBegin(_) => "SubscriptionDataBegin",
            SatelliteMessage::DataChange(_) => "DataChange",
            SatelliteMessage::SubscriptionDataCommit(_) => "SubscriptionDataCommit",
            SatelliteMessage::SubscriptionDataError(_) => "SubscriptionDataError",
            SatelliteMessage::UnsubscribeRequest(_) => "UnsubscribeRequest",
            SatelliteMessage::UnsubscribeResponse(_) => "UnsubscribeResponse",
            SatelliteMessage::StartReplicationRequest(_) => "StartReplicationRequest",
            SatelliteMessage::StartReplicationResponse(_) => "StartReplicationResponse",
            SatelliteMessage::StopReplicationRequest(_) => "StopReplicationRequest",
            SatelliteMessage::StopReplicationResponse(_) => "StopReplicationResponse",
            SatelliteMessage::Transaction(_) => "Transaction",
            SatelliteMessage::TransactionAck(_) => "TransactionAck",
            SatelliteMessage::Error(_) => "Error",
        }
    }

    /// Encodes the message as a frame.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let body = match self {
            SatelliteMessage::AuthRequest(m) => to_cbor(m)?,
            SatelliteMessage::AuthResponse(m) => to_cbor(m)?,
            SatelliteMessage::Relation(m) => to_cbor(m)?,
            SatelliteMessage::SubscriptionRequest(m) => to_cbor(m)?,
            SatelliteMessage::SubscriptionResponse(m) => to_cbor(m)?,
            SatelliteMessage::SubscriptionDataBegin(m) => to_cbor(m)?,
            SatelliteMessage::DataChange(m) => to_cbor(m)?,
            SatelliteMessage::SubscriptionDataCommit(m) => to_cbor(m)?,
            SatelliteMessage::SubscriptionDataError(m) => to_cbor(m)?,
            SatelliteMessage::UnsubscribeRequest(m) => to_cbor(m)?,
            SatelliteMessage::UnsubscribeResponse(m) => to_cbor(m)?,
            SatelliteMessage::StartReplicationRequest(m) => to_cbor(m)?,
            SatelliteMessage::StartReplicationResponse(m) => to_cbor(m)?,
            SatelliteMessage::StopReplicationRequest(m) => to_cbor(m)?,
            SatelliteMessage::StopReplicationResponse(m) => to_cbor(m)?,
            SatelliteMessage::Transaction(m) => m.encode()?,
            SatelliteMessage::TransactionAck(m) => to_cbor(m)?,
            SatelliteMessage::Error(m) => to_cbor(m)?,
        };
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(self.type_code());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes a frame.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        let (&code, body) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let message = match code {
            0x01 => SatelliteMessage::AuthRequest(from_cbor(body)?),
            0x02 => SatelliteMessage::AuthResponse(from_cbor(body)?),
            0x03 => SatelliteMessage::Relation(from_cbor(body)?),
            0x10 => SatelliteMessage::SubscriptionRequest(from_cbor(body)?),
            0x11 => SatelliteMessage::SubscriptionResponse(from_cbor(body)?),
            0x12 => SatelliteMessage::SubscriptionDataBegin(from_cbor(body)?),
            0x13 => SatelliteMessage::DataChange(from_cbor(body)?),
            0x14 => SatelliteMessage::SubscriptionDataCommit(from_cbor(body)?),
            0x15 => SatelliteMessage::SubscriptionDataError(from_cbor(body)?),
            0x16 => SatelliteMessage::UnsubscribeRequest(from_cbor(body)?),
            0x17 => SatelliteMessage::UnsubscribeResponse(from_cbor(body)?),
            0x20 => SatelliteMessage::StartReplicationRequest(from_cbor(body)?),
            0x21 => SatelliteMessage::StartReplicationResponse(from_cbor(body)?),
            0x22 => SatelliteMessage::StopReplicationRequest(from_cbor(body)?),
            0x23 => SatelliteMessage::StopReplicationResponse(from_cbor(body)?),
            0x30 => SatelliteMessage::Transaction(Transaction::decode(body)?),
            0x31 => SatelliteMessage::TransactionAck(from_cbor(body)?),
            0x7f => SatelliteMessage::Error(from_cbor(body)?),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(message)
    }
}

/// Client credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Stable client id (the origin of its tags).
    pub client_id: String,
    /// Bearer token.
    pub token: String,
}

/// Why authentication failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthErrorCode {
    /// Token was not accepted.
    InvalidToken,
    /// Token has expired.
    ExpiredToken,
    /// Server-side failure.
    Internal,
}

/// Authentication failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthError {
    /// Failure code.
    pub code: AuthErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Server verdict on credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Server id on success.
    pub server_id: Option<String>,
    /// Failure, if any.
    pub error: Option<AuthError>,
}

impl AuthResponse {
    /// Successful authentication.
    pub fn success(server_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            error: None,
        }
    }

    /// Rejected authentication.
    pub fn error(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            server_id: None,
            error: Some(AuthError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Per-shape failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeErrorCode {
    /// The shape names a table the server does not know.
    TableNotFound,
    /// The shape selects more data than the server will deliver.
    SizeLimitExceeded,
    /// The row filter could not be understood.
    InvalidFilter,
    /// The subscription id is already used.
    DuplicateSubscription,
    /// Server-side failure.
    Internal,
}

/// Failure of one shape request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeRequestError {
    /// Failing request id.
    pub request_id: String,
    /// Failure code.
    pub code: ShapeErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Failure of a whole subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionError {
    /// Overall code (the first shape error's code when there are any).
    pub code: ShapeErrorCode,
    /// Human-readable detail.
    pub message: String,
    /// Individual shape failures.
    #[serde(default)]
    pub shape_errors: Vec<ShapeRequestError>,
}

/// Request for one or more shapes under a single subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Subscription id.
    pub subscription_id: String,
    /// Requested shapes.
    pub shapes: Vec<ShapeRequest>,
}

/// Accept or reject a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    /// Subscription id.
    pub subscription_id: String,
    /// Failure, if rejected.
    pub error: Option<SubscriptionError>,
}

/// Start of a subscription's initial data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDataBegin {
    /// Subscription id.
    pub subscription_id: String,
    /// Stream position the snapshot is consistent with.
    pub lsn: Lsn,
}

/// One row of a subscription's initial data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChange {
    /// Subscription id.
    pub subscription_id: String,
    /// The row, as an insert.
    pub operation: Operation,
}

/// End of a subscription's initial data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDataCommit {
    /// Subscription id.
    pub subscription_id: String,
}

/// Delivery of a subscription failed mid-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDataError {
    /// Subscription id.
    pub subscription_id: String,
    /// Failure.
    pub error: SubscriptionError,
}

/// Release subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    /// Subscription ids.
    pub subscription_ids: Vec<String>,
}

/// Subscriptions released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeResponse {}

/// Begin streaming transactions after `lsn`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReplicationRequest {
    /// Last applied position; empty means from the beginning.
    pub lsn: Lsn,
    /// Previously fulfilled subscriptions being re-asserted.
    #[serde(default)]
    pub subscription_ids: Vec<String>,
}

/// Why replication could not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartReplicationErrorCode {
    /// The server no longer retains history back to the requested LSN.
    BehindWindow,
    /// The LSN is not one the server issued.
    InvalidPosition,
    /// A re-asserted subscription is unknown to the server.
    SubscriptionNotFound,
    /// Server-side failure.
    Internal,
}

/// Replication start failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReplicationError {
    /// Failure code.
    pub code: StartReplicationErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Streaming accepted or refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReplicationResponse {
    /// Failure, if refused.
    pub error: Option<StartReplicationError>,
}

impl StartReplicationResponse {
    /// Accepted.
    pub fn ok() -> Self {
        Self { error: None }
    }

    /// Refused.
    pub fn error(code: StartReplicationErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: Some(StartReplicationError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Stop streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReplicationRequest {}

/// Streaming stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReplicationResponse {}

/// Acknowledgement of client transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAck {
    /// Highest acknowledged client position.
    pub lsn: Lsn,
}

/// Peer-reported protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Human-readable detail.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ShapeDefinition;
    use crate::tag::Tag;
    use crate::value::row;

    fn roundtrip(message: SatelliteMessage) {
        let frame = message.encode().unwrap();
        assert_eq!(frame[0], message.type_code());
        assert_eq!(SatelliteMessage::decode(&frame).unwrap(), message);
    }

    #[test]
    fn handshake_messages() {
        roundtrip(SatelliteMessage::AuthRequest(AuthRequest {
            client_id: "c1".into(),
            token: "secret".into(),
        }));
        roundtrip(SatelliteMessage::AuthResponse(AuthResponse::error(
            AuthErrorCode::InvalidToken,
            "nope",
        )));
        roundtrip(SatelliteMessage::StartReplicationResponse(
            StartReplicationResponse::error(StartReplicationErrorCode::BehindWindow, "too old"),
        ));
    }

    #[test]
    fn subscription_messages() {
        roundtrip(SatelliteMessage::SubscriptionRequest(SubscriptionRequest {
            subscription_id: "s1".into(),
            shapes: vec![ShapeRequest::new(
                "r1",
                ShapeDefinition::table("items").with_filter("status = 'open'"),
            )],
        }));
        roundtrip(SatelliteMessage::DataChange(DataChange {
            subscription_id: "s1".into(),
            operation: Operation::insert(
                "items",
                row([("id", 1)]),
                row([("status", "open")]),
                Tag::new("server", 1),
            ),
        }));
        roundtrip(SatelliteMessage::StopReplicationRequest(
            StopReplicationRequest {},
        ));
    }

    #[test]
    fn transaction_frame_checks_invariants() {
        let tx = Transaction::new(
            "c1",
            5,
            vec![Operation::delete("items", row([("id", 1)]), Tag::new("c1", 5))],
        )
        .unwrap()
        .with_lsn(Lsn::from_u64(1));
        roundtrip(SatelliteMessage::Transaction(tx));
    }

    #[test]
    fn rejects_bad_frames() {
        assert_eq!(
            SatelliteMessage::decode(&[]).unwrap_err(),
            ProtocolError::EmptyFrame
        );
        assert_eq!(
            SatelliteMessage::decode(&[0x55]).unwrap_err(),
            ProtocolError::UnknownMessageType(0x55)
        );
        assert!(matches!(
            SatelliteMessage::decode(&[0x01, 0xff]).unwrap_err(),
            ProtocolError::Decode { .. }
        ));
    }
}
