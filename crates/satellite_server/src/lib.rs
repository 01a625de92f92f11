//! # Satellite Server
//!
//! Reference replication peer for satellite clients.
//!
//! This crate provides:
//! - A transaction log with a retention window
//! - Column-wise merged table state built from the log
//! - Shape subscriptions with filters and foreign-key includes
//! - Per-connection handling of the satellite protocol
//! - Test hooks for injecting remote writes, dropping connections and
//!   compacting the log
//!
//! # Protocol
//!
//! A connection runs through these phases:
//! 1. Client authenticates with its id and a token
//! 2. Client starts replication at an LSN and names its subscriptions;
//!    the server replays the retained log after that LSN
//! 3. Client subscribes to shapes and receives each snapshot as one
//!    delivery stamped with the log head
//! 4. Both sides exchange transactions; the server acknowledges client
//!    transactions and forwards them to every other subscribed client
//!
//! Transports are plain frame channels, so the server runs in-process next
//! to clients in tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod filter;
mod handler;
mod oplog;
mod server;
mod store;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use filter::Filter;
pub use handler::{HandlerContext, Outbox, RequestHandler};
pub use oplog::ServerOplog;
pub use server::{Incoming, SatelliteServer};
pub use store::TableStore;
