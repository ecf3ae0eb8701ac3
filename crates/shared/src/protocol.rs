//! Notification socket protocol.
//!
//! Frames are JSON text messages shaped as `{"id", "ts", "type", "data"}`:
//! a [`WsEnvelope`](crate::WsEnvelope) with an adjacently tagged payload.

use serde::{Deserialize, Serialize};

use crate::models::Notification;

/// Close code a server sends when the credential is missing or invalid.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Close code a server sends when the credential is valid but not allowed.
pub const CLOSE_FORBIDDEN: u16 = 4003;

/// `code` of a [`ServerEvent::Error`] that rejects the connection's credential.
pub const ERROR_CODE_UNAUTHORIZED: &str = "unauthorized";

/// Format a bearer credential for the upgrade request.
pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Returns true if a server close code means the credential was rejected.
pub fn is_auth_close_code(code: u16) -> bool {
    code == CLOSE_UNAUTHORIZED || code == CLOSE_FORBIDDEN
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Ask the server to re-push every notification after `last_seen_id`.
    FetchMissedNotifications {
        #[serde(rename = "lastSeenId")]
        last_seen_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Notification(Notification),
    Error {
        code: String,
        message: String,
        #[serde(
            default,
            rename = "correlationId",
            skip_serializing_if = "Option::is_none"
        )]
        correlation_id: Option<String>,
    },
}

impl ServerEvent {
    /// Returns true for an error event rejecting the connection's credential.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, ServerEvent::Error { code, .. } if code == ERROR_CODE_UNAUTHORIZED)
    }
}
