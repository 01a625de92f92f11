//! Error types for the replication peer.

use satellite_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the replication peer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServerError {
    /// Message not valid in the connection's current phase.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The table is not replicated by this server.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A shape filter could not be parsed.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// The requested position is older than the retained log.
    #[error("behind replication window: {0}")]
    BehindWindow(String),

    /// The requested position was never issued.
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the client caused the error.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::UnknownTable(_)
                | ServerError::InvalidFilter(_)
                | ServerError::BehindWindow(_)
                | ServerError::InvalidPosition(_)
                | ServerError::Codec(_)
        )
    }

    /// Returns true if the server is at fault.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::BehindWindow("compacted".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn error_display() {
        let err = ServerError::UnknownTable("ghosts".into());
        assert!(err.to_string().contains("ghosts"));
    }
}
