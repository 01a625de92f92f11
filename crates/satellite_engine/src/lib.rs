//! # Satellite Engine
//!
//! Client-side replication for local-first applications.
//!
//! A satellite keeps one local database in sync with a replication peer:
//! - Local writes are tagged, merged into the shadow state and appended to
//!   an oplog in the same database transaction
//! - Oplog entries stream to the peer until acknowledged
//! - Inbound transactions and shape deliveries merge through the same
//!   conflict resolver, so every replica converges
//! - Connectivity is supervised with backoff and resumes from the last
//!   applied LSN
//!
//! ## Architecture
//!
//! ```text
//!            Registry ── one process per database name
//!               │
//!        SatelliteProcess ── Satellite trait ── MockSatellite
//!          │          │
//!  Connectivity    Replica ── OplogStore ── DatabaseAdapter
//!   Supervisor        │  └── ShapeSubscriptionManager
//!          │          └───── Applier ── ConflictResolver
//!   ReplicationSession ── Transport
//! ```
//!
//! ## Key Invariants
//!
//! - A local write and its oplog entry commit together or not at all
//! - A shape delivery is applied atomically, with its LSN and subscription
//!   state
//! - Frames from a cancelled session never touch the replica
//! - Tags from one origin are strictly increasing

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod apply;
mod clock;
mod config;
mod connectivity;
mod error;
mod merge;
mod meta;
mod mock;
mod notifier;
mod oplog;
mod process;
mod registry;
mod replica;
mod session;
mod shapes;
mod transport;

pub use adapter::{
    AdapterError, AdapterResult, DatabaseAdapter, MemoryAdapter, Predicate, Statement,
};
pub use apply::{clear_tables, fold_operations, Applier, Relations, StagedChanges};
pub use clock::TagClock;
pub use config::{BackoffConfig, CompensationPolicy, SatelliteConfig};
pub use connectivity::{
    ConnectivityController, ConnectivityState, ConnectivityStatus, ConnectivityTransition,
};
pub use error::{ErrorKind, SatelliteError, SatelliteResult};
pub use merge::{ColumnState, ConflictResolver, Resolution, RowState};
pub use meta::{
    get_meta, get_meta_u64, is_reserved_table, set_meta, set_meta_u64, CLIENT_ID_KEY, LSN_KEY,
    META_TABLE, OPLOG_ACKED_KEY, OPLOG_NEXT_KEY, OPLOG_TABLE, SHADOW_TABLE, SUBSCRIPTIONS_KEY,
};
pub use mock::MockSatellite;
pub use notifier::{ChangeOrigin, ChannelNotifier, Notifier, TableChange};
pub use oplog::{OplogEntry, OplogStore, Pending, PendingAppend};
pub use process::{Satellite, SatelliteProcess};
pub use registry::Registry;
pub use replica::LocalChange;
pub use session::SessionState;
pub use shapes::{
    Delivery, Outgoing, ShapeSubscriptionManager, SubscriptionHandle, SubscriptionInfo,
    SubscriptionState, SubscriptionStatus,
};
pub use transport::{
    Acceptor, Connection, FrameReceiver, FrameSender, MemoryTransport, Transport,
};
