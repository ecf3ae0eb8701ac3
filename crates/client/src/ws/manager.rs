//! Owner of the single shared notification connection.
//!
//! State machine:
//!
//! ```text
//!                          network error: retry after backoff
//!                                ┌──────┐
//!                                ▼      │
//! Disconnected ──────────────► Connecting ─────────► Connected
//!   ▲  ▲  ▲                      │                      │
//!   │  │  └─── cap exceeded ─────┘                      │
//!   │  └────── dropped or closed by server ─────────────┘
//!   │          (reconnect scheduled)
//!   │
//!   └── reset_auth_failure ◄── AuthFailed ◄── credential rejected
//! ```
//!
//! Every connection task carries a generation number. Tearing down or
//! replacing a connection bumps the generation and aborts the task, so late
//! callbacks from an old task are ignored and at most one task is ever live.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use notifier_shared::{ServerEvent, TransportError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::connection::{Channel, DisconnectReason, Transport, TransportEvent, WsHandle};
use crate::auth_session::AuthProvider;
use crate::config::{ClientConfig, ReconnectConfig};
use crate::notifications::DispatchHandle;
use crate::{log_debug, log_error, log_info, log_warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    AuthFailed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    /// Connected or on its way there.
    pub fn is_live(&self) -> bool {
        self.is_connected() || self.is_connecting()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub server_close_delay: Duration,
}

impl From<&ClientConfig> for ConnectionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect.clone(),
            server_close_delay: config.server_close_delay,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

/// What the connection task does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    RetryAfter(Duration),
    Stop,
}

struct Inner {
    state: ConnectionState,
    reconnect_attempts: u32,
    generation: u64,
    /// Physical channels opened so far; identifies a binding.
    channel_seq: u64,
    bound: Option<(u64, u64)>,
    auth_failed: bool,
    connections_opened: u64,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    dispatch: DispatchHandle,
    config: ConnectionConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Owns the lifecycle of the one shared transport connection.
///
/// Cloning yields another handle to the same connection. Methods that may
/// open a connection must be called from within a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Retries and reconnects read a fresh token from `auth` before each attempt.
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        dispatch: DispatchHandle,
        config: ConnectionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                transport,
                auth,
                dispatch,
                config,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    reconnect_attempts: 0,
                    generation: 0,
                    channel_seq: 0,
                    bound: None,
                    auth_failed: false,
                    connections_opened: 0,
                    task: None,
                }),
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Receiver updated on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock().reconnect_attempts
    }

    /// Logical connections started (not counting retries inside one).
    pub fn connections_opened(&self) -> u64 {
        self.shared.lock().connections_opened
    }

    /// True between an authentication failure and [`reset_auth_failure`](Self::reset_auth_failure).
    pub fn is_auth_failed(&self) -> bool {
        self.shared.lock().auth_failed
    }

    /// Return the live connection, or start one authenticated with `token`.
    ///
    /// Idempotent while `Connecting` or `Connected`. An empty token, or an
    /// unresolved authentication failure, makes this a no-op.
    pub fn get_or_create_connection(&self, token: &str) -> ConnectionState {
        if token.trim().is_empty() {
            log_debug!("No token available, not connecting");
            return self.state();
        }

        let mut inner = self.shared.lock();
        if inner.auth_failed {
            log_debug!("Connection suppressed until auth failure is reset");
            return inner.state;
        }
        if inner.state.is_live() {
            return inner.state;
        }

        if let Some(stale) = inner.task.take() {
            stale.abort();
        }
        inner.generation += 1;
        inner.reconnect_attempts = 0;
        inner.bound = None;
        inner.connections_opened += 1;
        let generation = inner.generation;
        self.shared.set_state(&mut inner, ConnectionState::Connecting);

        let shared = self.shared.clone();
        let token = token.to_string();
        inner.task = Some(tokio::spawn(run_connection(shared, generation, token)));
        inner.state
    }

    /// Reconnection watchdog: connect unless already connected.
    pub fn ensure_connected(&self, token: Option<&str>) -> ConnectionState {
        let state = self.state();
        if state.is_connected() {
            return state;
        }
        match token {
            Some(token) if !token.trim().is_empty() => self.get_or_create_connection(token),
            _ => state,
        }
    }

    /// Tear down the connection and forget every subscriber and queued notification.
    ///
    /// An unresolved authentication failure stays in force.
    pub fn disconnect(&self) {
        {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.reconnect_attempts = 0;
            inner.bound = None;
            self.shared.set_state(&mut inner, ConnectionState::Disconnected);
        }
        self.shared.dispatch.clear();
        log_info!("Notification connection closed");
    }

    /// Lift the authentication short-circuit after a fresh login.
    pub fn reset_auth_failure(&self) {
        let mut inner = self.shared.lock();
        if inner.auth_failed {
            log_info!("Authentication failure reset");
        }
        inner.auth_failed = false;
        if inner.state == ConnectionState::AuthFailed {
            self.shared.set_state(&mut inner, ConnectionState::Disconnected);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            log_debug!("Connection state {:?} -> {:?}", inner.state, state);
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn begin_attempt(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        self.set_state(&mut inner, ConnectionState::Connecting);
        true
    }

    /// Register the event handlers of a physical channel: the backlog
    /// request and queue drain on the dispatch loop.
    ///
    /// Returns `false`, doing nothing, if this channel is already bound.
    fn bind(&self, generation: u64, channel: u64, handle: &WsHandle) -> bool {
        {
            let mut inner = self.lock();
            if inner.generation != generation || inner.bound == Some((generation, channel)) {
                return false;
            }
            inner.bound = Some((generation, channel));
        }
        self.dispatch.connected(handle.clone());
        true
    }

    /// Returns the id of the new physical channel, or `None` if `generation` is stale.
    fn on_connected(&self, generation: u64) -> Option<u64> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return None;
        }
        inner.reconnect_attempts = 0;
        inner.channel_seq += 1;
        self.set_state(&mut inner, ConnectionState::Connected);
        log_info!("Notification connection established");
        Some(inner.channel_seq)
    }

    /// Token for the next attempt: the provider's current one, else the last used.
    fn next_token(&self, last: &str) -> String {
        match self.auth.token() {
            Some(token) if !token.trim().is_empty() => token,
            _ => last.to_string(),
        }
    }

    fn on_connection_error(&self, generation: u64, err: &TransportError) -> Next {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Next::Stop;
        }
        inner.bound = None;

        if err.is_auth_failure() {
            log_error!("Notification connection rejected: {}", err);
            inner.auth_failed = true;
            inner.task = None;
            self.set_state(&mut inner, ConnectionState::AuthFailed);
            return Next::Stop;
        }

        inner.reconnect_attempts += 1;
        let attempts = inner.reconnect_attempts;
        if !self.config.reconnect.allows(attempts) {
            log_warn!(
                "Max reconnect attempts ({}) exceeded: {}",
                self.config.reconnect.max_attempts,
                err
            );
            inner.task = None;
            self.set_state(&mut inner, ConnectionState::Disconnected);
            return Next::Stop;
        }

        let delay = self.config.reconnect.delay(attempts - 1);
        log_warn!(
            "Connection attempt failed ({}), retrying in {:?} (attempt {})",
            err,
            delay,
            attempts
        );
        self.set_state(&mut inner, ConnectionState::Connecting);
        Next::RetryAfter(delay)
    }

    fn on_disconnected(&self, generation: u64, reason: &DisconnectReason) -> Next {
        if reason.is_auth_failure() {
            return self.on_connection_error(
                generation,
                &TransportError::Unauthorized(reason.to_string()),
            );
        }

        let mut inner = self.lock();
        if inner.generation != generation {
            return Next::Stop;
        }
        inner.bound = None;
        self.set_state(&mut inner, ConnectionState::Disconnected);
        log_warn!("Notification connection {}", reason);

        if *reason == DisconnectReason::ClientClosed {
            inner.task = None;
            return Next::Stop;
        }

        inner.reconnect_attempts += 1;
        let attempts = inner.reconnect_attempts;
        if !self.config.reconnect.allows(attempts) {
            log_warn!(
                "Max reconnect attempts ({}) exceeded, waiting for an external trigger",
                self.config.reconnect.max_attempts
            );
            inner.task = None;
            return Next::Stop;
        }

        let delay = if reason.is_server_forced() {
            self.config.server_close_delay
        } else {
            self.config.reconnect.delay(attempts - 1)
        };
        log_info!("Reconnecting in {:?} (attempt {})", delay, attempts);
        Next::RetryAfter(delay)
    }

    /// Forward a channel's events until it closes.
    ///
    /// A credential rejection on the open channel ends it with an auth error.
    async fn pump(
        &self,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<DisconnectReason, TransportError> {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(event) if event.is_auth_rejection() => {
                    return Err(TransportError::Unauthorized(
                        "credential rejected on open channel".into(),
                    ));
                }
                TransportEvent::Message(ServerEvent::Notification(notification)) => {
                    self.dispatch.inbound(notification);
                }
                TransportEvent::Message(ServerEvent::Error { code, message, .. }) => {
                    log_warn!("Server error {}: {}", code, message);
                }
                TransportEvent::Closed(reason) => return Ok(reason),
            }
        }
        Ok(DisconnectReason::TransportLost("event stream ended".into()))
    }
}

async fn run_connection(shared: Arc<Shared>, generation: u64, mut token: String) {
    loop {
        if !shared.begin_attempt(generation) {
            return;
        }

        let timeout = shared.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, shared.transport.connect(&token)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        let Channel { handle, mut events } = match result {
            Ok(channel) => channel,
            Err(err) => match shared.on_connection_error(generation, &err) {
                Next::RetryAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    token = shared.next_token(&token);
                    continue;
                }
                Next::Stop => return,
            },
        };

        let Some(channel) = shared.on_connected(generation) else {
            return;
        };
        if !shared.bind(generation, channel, &handle) {
            log_debug!("Channel {} handlers already bound", channel);
        }

        let next = match shared.pump(&mut events).await {
            Ok(reason) => shared.on_disconnected(generation, &reason),
            Err(err) => shared.on_connection_error(generation, &err),
        };
        drop(handle);
        drop(events);

        match next {
            Next::RetryAfter(delay) => {
                tokio::time::sleep(delay).await;
                token = shared.next_token(&token);
            }
            Next::Stop => return,
        }
    }
}
