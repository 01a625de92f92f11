//! # Satellite Protocol
//!
//! Replication data model and wire codec for the satellite sync engine.
//!
//! This crate provides:
//! - [`Tag`] causal write tags and [`Lsn`] stream positions
//! - [`Operation`] and [`Transaction`] replication records
//! - [`Relation`] table schemas and [`ShapeDefinition`] partial-replication requests
//! - [`SatelliteMessage`] frames and their CBOR encoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod lsn;
mod messages;
mod operation;
mod relation;
mod shape;
mod tag;
mod transaction;
mod value;

pub use codec::{from_cbor, to_cbor};
pub use error::{ProtocolError, ProtocolResult};
pub use lsn::Lsn;
pub use messages::{
    AuthError, AuthErrorCode, AuthRequest, AuthResponse, DataChange, ErrorMessage,
    SatelliteMessage, ShapeErrorCode, ShapeRequestError, StartReplicationError,
    StartReplicationErrorCode, StartReplicationRequest, StartReplicationResponse,
    StopReplicationRequest, StopReplicationResponse, SubscriptionDataBegin,
    SubscriptionDataCommit, SubscriptionDataError, SubscriptionError, SubscriptionRequest,
    SubscriptionResponse, TransactionAck, UnsubscribeRequest, UnsubscribeResponse,
};
pub use operation::{Operation, OperationKind};
pub use relation::{ColumnType, ForeignKey, Relation, RelationColumn};
pub use shape::{shape_hash, ShapeDefinition, ShapeInclude, ShapeRequest};
pub use tag::Tag;
pub use transaction::Transaction;
pub use value::{key_string, row, Row, Value};
