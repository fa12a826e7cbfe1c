//! Transport errors. Callers only need to tell a missing answer (timeout,
//! broken connection) from a request that could not be built or read.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// NATS connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// no reply within the request timeout
    #[error("timeout: {0}")]
    Timeout(String),

    /// payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. missing required fields).
    #[error("configuration error: {0}")]
    Config(String),

    /// The client is not connected or connection was lost.
    #[error("not connected: {0}")]
    NotConnected(String),
}

impl TransportError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Transport(_) | TransportError::Timeout(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// Shorthand result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
