//! Transport error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a notification transport.
///
/// Authentication is classified structurally by variant, never by matching on
/// message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server rejected the credential (handshake 401/403, or an explicit
    /// rejection on an open connection).
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The connection is gone; nothing can be sent on it.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Auth failures are terminal for a connection; everything else is retried.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}
