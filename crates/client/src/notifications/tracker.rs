//! Last-seen marker persistence and backlog requests.

use std::sync::Arc;

use notifier_shared::{ClientCommand, Notification};

use crate::storage::MarkerStore;
use crate::ws::WsHandle;
use crate::{log_debug, log_info, log_warn};

/// Storage key of the marker when no identity is known.
pub const MARKER_KEY: &str = "notifications_last_seen";

/// Storage key of the marker for `identity`.
pub fn marker_key(identity: Option<&str>) -> String {
    match identity {
        Some(id) if !id.is_empty() => format!("{}:{}", MARKER_KEY, id),
        _ => MARKER_KEY.to_string(),
    }
}

/// Remembers the id of the most recently processed notification.
///
/// The marker follows processing order, not id order: it is overwritten by
/// every notification that carries an id. Writes to the store are deferred
/// until [`flush`](Self::flush), so a burst costs one write.
pub struct MissedMessageTracker {
    store: Arc<dyn MarkerStore>,
    key: String,
    last_seen: Option<String>,
    dirty: bool,
}

impl MissedMessageTracker {
    /// Load the persisted marker stored under `key`, if any.
    pub fn new(store: Arc<dyn MarkerStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let last_seen = store.get(&key);
        Self {
            store,
            key,
            last_seen,
            dirty: false,
        }
    }

    /// Switch to another identity's marker.
    pub fn set_scope(&mut self, key: impl Into<String>) {
        let key = key.into();
        if key == self.key {
            return;
        }
        self.flush();
        log_debug!("Marker scope changed to '{}'", key);
        self.last_seen = self.store.get(&key);
        self.key = key;
    }

    pub fn record_seen(&mut self, notification: &Notification) {
        let Some(id) = notification.id() else {
            return;
        };
        self.last_seen = Some(id.to_string());
        self.dirty = true;
    }

    /// Persist the marker if it changed since the last flush.
    pub fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(id) = self.last_seen.as_deref() {
            if !self.store.set(&self.key, id) {
                log_warn!("Failed to persist last-seen marker '{}'", id);
            }
        }
        self.dirty = false;
    }

    pub fn last_seen(&self) -> Option<&str> {
        self.last_seen.as_deref()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The backlog request for the current marker, if there is one.
    pub fn backlog_command(&self) -> Option<ClientCommand> {
        self.last_seen
            .as_ref()
            .map(|id| ClientCommand::FetchMissedNotifications {
                last_seen_id: id.clone(),
            })
    }

    /// Fire-and-forget backlog request. Returns `true` if a request was sent.
    ///
    /// Send failures are logged only: the next successful connection asks again.
    pub fn request_backlog(&self, handle: &WsHandle) -> bool {
        let Some(command) = self.backlog_command() else {
            return false;
        };
        match handle.send(command) {
            Ok(()) => {
                log_info!("Requested missed notifications since {:?}", self.last_seen);
                true
            }
            Err(e) => {
                log_warn!("Backlog request failed: {}", e);
                false
            }
        }
    }
}
