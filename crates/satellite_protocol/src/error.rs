//! Error types for the replication protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or (de)serializing protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A value could not be encoded.
    #[error("encoding failed: {message}")]
    Encode {
        /// Description of the failure.
        message: String,
    },

    /// Bytes could not be decoded into the expected value.
    #[error("decoding failed: {message}")]
    Decode {
        /// Description of the failure.
        message: String,
    },

    /// A frame carried a message type code we do not know.
    #[error("unknown message type code: {0:#04x}")]
    UnknownMessageType(u8),

    /// A frame was empty.
    #[error("empty frame")]
    EmptyFrame,

    /// A transaction must contain at least one operation.
    #[error("transaction has no operations")]
    EmptyTransaction,

    /// Operations inside one transaction disagree on origin.
    #[error("operation origin '{found}' does not match transaction origin '{expected}'")]
    MixedOrigin {
        /// Origin of the transaction.
        expected: String,
        /// Origin found on an operation.
        found: String,
    },

    /// A tag string was not of the form `origin@timestamp`.
    #[error("invalid tag '{0}'")]
    InvalidTag(String),
}

impl ProtocolError {
    /// Creates an encode error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}
