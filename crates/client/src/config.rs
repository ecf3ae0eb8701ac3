//! Client configuration from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::log_warn;

/// Default notification socket endpoint.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/api/notifications/ws";

/// Configuration for reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts per failure episode (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u32).min(self.max_delay_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_for_attempt(attempt) as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts <= self.max_attempts
    }
}

/// Notifier client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ws_url: String,
    /// Bound on a single connection attempt; exceeding it counts as a network error.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Fixed delay before the reconnect that follows a server-forced close.
    pub server_close_delay: Duration,
    /// Grace window between unsubscribe and physical removal.
    pub unsubscribe_grace: Duration,
    /// Cap on notifications buffered while nobody is subscribed.
    pub queue_capacity: usize,
    /// Directory for the persisted last-seen marker. `None` uses the platform default.
    pub storage_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            connect_timeout: Duration::from_secs(20),
            reconnect: ReconnectConfig::default(),
            server_close_delay: Duration::from_secs(1),
            unsubscribe_grace: Duration::from_millis(2000),
            queue_capacity: 1000,
            storage_dir: None,
        }
    }
}

impl ClientConfig {
    /// Build configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NOTIFIER_WS_URL`: socket endpoint (default: `ws://localhost:8080/api/notifications/ws`)
    /// - `NOTIFIER_CONNECT_TIMEOUT_SECS`: connection attempt timeout (default: 20)
    /// - `NOTIFIER_MAX_RECONNECT_ATTEMPTS`: reconnect cap, 0 = unbounded (default: 5)
    /// - `NOTIFIER_UNSUBSCRIBE_GRACE_MS`: unsubscribe grace window (default: 2000)
    /// - `NOTIFIER_QUEUE_CAPACITY`: offline queue cap (default: 1000)
    /// - `NOTIFIER_STORAGE_DIR`: marker storage directory (default: platform config dir)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("NOTIFIER_WS_URL") {
            config.ws_url = url;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "NOTIFIER_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var::<u32>(&lookup, "NOTIFIER_MAX_RECONNECT_ATTEMPTS") {
            config.reconnect.max_attempts = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "NOTIFIER_UNSUBSCRIBE_GRACE_MS") {
            config.unsubscribe_grace = Duration::from_millis(ms);
        }
        if let Some(cap) = parse_var::<usize>(&lookup, "NOTIFIER_QUEUE_CAPACITY") {
            config.queue_capacity = cap.max(1);
        }
        if let Some(dir) = lookup("NOTIFIER_STORAGE_DIR") {
            config.storage_dir = Some(PathBuf::from(dir));
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log_warn!("Ignoring {}={:?}: not a valid number, using default", key, raw);
            None
        }
    }
}
