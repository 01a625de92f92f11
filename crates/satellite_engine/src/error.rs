//! Error types for the satellite engine.

use crate::adapter::AdapterError;
use satellite_protocol::{ProtocolError, ShapeErrorCode};
use thiserror::Error;

/// Result type for satellite operations.
pub type SatelliteResult<T> = Result<T, SatelliteError>;

/// Broad class of an error, deciding how it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection lost or refused; handled by reconnecting with backoff.
    Transport,
    /// Malformed or out-of-sequence message; fatal to the process.
    Protocol,
    /// Peer discarded history we need; handled by a full resync.
    BehindWindow,
    /// Failure of one subscription only.
    Shape,
    /// Local database failure; fatal to the process.
    Storage,
    /// Credentials rejected; not retried automatically.
    Auth,
    /// Misuse of the public API.
    Usage,
}

/// Errors that can occur in a satellite process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SatelliteError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether reconnecting may help.
        retryable: bool,
    },

    /// Malformed or out-of-sequence message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer no longer has the history needed to resume.
    #[error("behind replication window: {0}")]
    BehindWindow(String),

    /// A subscription failed.
    #[error("shape error ({code:?}): {message}")]
    Shape {
        /// Failure code.
        code: ShapeErrorCode,
        /// Human-readable detail.
        message: String,
    },

    /// Local database failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Credentials rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A shape names a table missing from the local schema.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A local change is malformed.
    #[error("invalid change: {0}")]
    InvalidChange(String),

    /// No subscription with this id.
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Operation not valid in the subscription's current state.
    #[error("subscription {id} is {state}, expected {expected}")]
    InvalidSubscriptionState {
        /// Subscription id.
        id: String,
        /// Current state.
        state: String,
        /// Required state.
        expected: String,
    },

    /// A process for this database is already registered.
    #[error("a satellite process is already running for database '{0}'")]
    AlreadyRunning(String),

    /// No process registered for this database.
    #[error("no satellite process for database '{0}'")]
    NotRunning(String),

    /// A process was offered under a database name that is not its own.
    #[error("satellite for database '{actual}' cannot be registered as '{expected}'")]
    DatabaseMismatch {
        /// Name it was registered under.
        expected: String,
        /// Name the process serves.
        actual: String,
    },

    /// The process has not been started.
    #[error("satellite process not started")]
    NotStarted,

    /// The process has been stopped.
    #[error("satellite process stopped")]
    Stopped,

    /// The operation was cancelled by `disconnect` or `stop`.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Timed out waiting for the peer.
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl SatelliteError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a shape error.
    pub fn shape(code: ShapeErrorCode, message: impl Into<String>) -> Self {
        Self::Shape {
            code,
            message: message.into(),
        }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns the error's class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SatelliteError::Transport { .. } | SatelliteError::Timeout(_) => ErrorKind::Transport,
            SatelliteError::Protocol(_) => ErrorKind::Protocol,
            SatelliteError::BehindWindow(_) => ErrorKind::BehindWindow,
            SatelliteError::Shape { .. } | SatelliteError::TableNotFound(_) => ErrorKind::Shape,
            SatelliteError::Storage(_) => ErrorKind::Storage,
            SatelliteError::Auth(_) => ErrorKind::Auth,
            SatelliteError::InvalidChange(_)
            | SatelliteError::SubscriptionNotFound(_)
            | SatelliteError::InvalidSubscriptionState { .. }
            | SatelliteError::AlreadyRunning(_)
            | SatelliteError::NotRunning(_)
            | SatelliteError::DatabaseMismatch { .. }
            | SatelliteError::NotStarted
            | SatelliteError::Stopped
            | SatelliteError::Cancelled(_) => ErrorKind::Usage,
        }
    }

    /// Returns true if reconnecting with backoff may resolve the error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SatelliteError::Transport { retryable, .. } => *retryable,
            SatelliteError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Returns true if the replication session cannot continue.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport
                | ErrorKind::Protocol
                | ErrorKind::BehindWindow
                | ErrorKind::Storage
                | ErrorKind::Auth
        )
    }

    /// Returns true if the owning process must stop.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Storage)
    }
}

impl From<ProtocolError> for SatelliteError {
    fn from(err: ProtocolError) -> Self {
        SatelliteError::Protocol(err.to_string())
    }
}

impl From<AdapterError> for SatelliteError {
    fn from(err: AdapterError) -> Self {
        SatelliteError::Storage(err.to_string())
    }
}
