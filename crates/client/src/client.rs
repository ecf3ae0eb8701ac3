//! Consumer-facing notification client.
//!
//! ```rust,no_run
//! use notifier_client::{AuthContext, NotificationClient};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), notifier_client::ClientError> {
//! let auth = AuthContext::new();
//! let client = NotificationClient::builder()
//!     .auth(Arc::new(auth.clone()))
//!     .build()?;
//! client.bind_auth(&auth);
//!
//! let subscription = client.subscribe(|n| println!("notification {:?}", n.id()));
//! auth.login("alice", "token");
//! // ...
//! subscription.unsubscribe();
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notifier_shared::Notification;
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use crate::auth_session::{AuthContext, AuthProvider, AuthSession};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::notifications::dispatch::{self, DispatchHandle, DispatchStats, Dispatcher};
use crate::notifications::{
    callback, marker_key, Callback, MissedMessageTracker, NotificationQueue, Subscriber,
    SubscriberRegistry,
};
use crate::storage::{FileStore, MarkerStore, MemoryStore};
use crate::ws::{ConnectionConfig, ConnectionManager, ConnectionState, Transport, WsTransport};
use crate::{log_debug, log_info, log_warn};

static GLOBAL: OnceCell<NotificationClient> = OnceCell::new();

/// Install the process-wide client. Fails (returning it) if one is already installed.
pub fn install_global(
    client: NotificationClient,
) -> Result<&'static NotificationClient, NotificationClient> {
    GLOBAL.try_insert(client).map_err(|(_, rejected)| rejected)
}

/// The process-wide client, if one was installed.
pub fn global() -> Option<&'static NotificationClient> {
    GLOBAL.get()
}

/// A registered interest. Unsubscribes when dropped.
pub struct Subscription {
    subscriber: Subscriber,
    dispatch: DispatchHandle,
    active: AtomicBool,
}

impl Subscription {
    /// Schedule removal after the grace window. Idempotent.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.dispatch.unregister(self.subscriber.clone());
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The registered callback; pass it to
    /// [`NotificationClient::subscribe_callback`] to re-subscribe as the same subscriber.
    pub fn callback(&self) -> Callback {
        self.subscriber.callback().clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[derive(Default)]
pub struct NotificationClientBuilder {
    config: Option<ClientConfig>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn MarkerStore>>,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl NotificationClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Transport to use instead of a [`WsTransport`] for `config.ws_url`.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Marker storage. Defaults to a [`FileStore`] in `config.storage_dir`
    /// or the platform config directory.
    pub fn store(mut self, store: Arc<dyn MarkerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Build the client and start its dispatch loop on the current tokio runtime.
    pub fn build(self) -> Result<NotificationClient, ClientError> {
        let config = self.config.unwrap_or_default();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let url = Url::parse(&config.ws_url).map_err(|source| ClientError::InvalidUrl {
                    url: config.ws_url.clone(),
                    source,
                })?;
                Arc::new(WsTransport::new(url))
            }
        };

        let store: Arc<dyn MarkerStore> = match (self.store, &config.storage_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => {
                Arc::new(FileStore::with_dir(dir).ok_or_else(|| ClientError::Storage(dir.clone()))?)
            }
            (None, None) => match FileStore::platform_default() {
                Some(store) => Arc::new(store),
                None => {
                    log_warn!("No config directory available, last-seen marker kept in memory");
                    Arc::new(MemoryStore::new())
                }
            },
        };

        let auth = self
            .auth
            .unwrap_or_else(|| Arc::new(AuthContext::new()) as Arc<dyn AuthProvider>);

        let tracker = MissedMessageTracker::new(store, marker_key(auth.identity().as_deref()));
        let dispatcher = Dispatcher::new(
            SubscriberRegistry::new(config.unsubscribe_grace),
            NotificationQueue::new(config.queue_capacity),
            tracker,
        );
        let (dispatch, dispatch_task) = dispatch::spawn(dispatcher);
        let connection = ConnectionManager::new(
            transport,
            auth.clone(),
            dispatch.clone(),
            ConnectionConfig::from(&config),
        );

        Ok(NotificationClient {
            config,
            connection,
            dispatch,
            auth,
            tasks: Mutex::new(vec![dispatch_task]),
        })
    }
}

/// The notification delivery client: one shared connection, many subscribers.
pub struct NotificationClient {
    config: ClientConfig,
    connection: ConnectionManager,
    dispatch: DispatchHandle,
    auth: Arc<dyn AuthProvider>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationClient {
    pub fn builder() -> NotificationClientBuilder {
        NotificationClientBuilder::default()
    }

    /// Register `f` for every notification processed from now on, plus
    /// anything queued while nobody was listening.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe_callback(callback(f))
    }

    /// Like [`subscribe`](Self::subscribe), keyed by the callback allocation.
    ///
    /// Re-subscribing the same `Arc` within the grace window of an
    /// unsubscribe cancels the pending removal.
    pub fn subscribe_callback(&self, callback: Callback) -> Subscription {
        if let Some(token) = self.auth.token() {
            self.connection.get_or_create_connection(&token);
        }
        let subscriber = Subscriber::new(callback);
        self.dispatch.register(subscriber.clone());
        Subscription {
            subscriber,
            dispatch: self.dispatch.clone(),
            active: AtomicBool::new(true),
        }
    }

    /// Explicit teardown, e.g. on logout.
    pub fn disconnect_all(&self) {
        self.connection.disconnect();
    }

    /// Clear the authentication short-circuit after a fresh login.
    pub fn reset_auth_failure(&self) {
        self.connection.reset_auth_failure();
    }

    /// Connect with the current token unless already connected.
    pub fn ensure_connected(&self) -> ConnectionState {
        self.connection
            .ensure_connected(self.auth.token().as_deref())
    }

    /// Hook for "the process became active again" (focus, resume, wake).
    pub fn on_became_active(&self) -> ConnectionState {
        log_debug!("Process became active, checking notification connection");
        self.ensure_connected()
    }

    /// Call [`ensure_connected`](Self::ensure_connected) every `interval`.
    pub fn spawn_watchdog(&self, interval: Duration) {
        let connection = self.connection.clone();
        let auth = self.auth.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                connection.ensure_connected(auth.token().as_deref());
            }
        });
        self.track(task);
    }

    /// Follow login, token refresh and logout on `auth`.
    ///
    /// New credentials lift an authentication failure and reconnect; a
    /// different user switches the persisted marker; logout disconnects.
    pub fn bind_auth(&self, auth: &AuthContext) {
        let mut rx = auth.subscribe();
        let initial = rx.borrow_and_update().clone();
        let connection = self.connection.clone();
        let dispatch = self.dispatch.clone();
        let task = tokio::spawn(async move {
            let mut previous: Option<AuthSession> = None;
            let mut current = initial;
            loop {
                match (&previous, &current) {
                    (Some(_), None) => {
                        log_info!("Logged out, closing notification connection");
                        connection.disconnect();
                    }
                    (_, Some(session)) => {
                        let same_user =
                            previous.as_ref().map(|p| &p.user_id) == Some(&session.user_id);
                        if !same_user {
                            dispatch.set_scope(marker_key(Some(session.user_id.as_str())));
                        }
                        let new_token = previous.as_ref().map(|p| &p.token) != Some(&session.token);
                        if new_token {
                            connection.reset_auth_failure();
                        }
                        connection.ensure_connected(Some(&session.token));
                    }
                    (None, None) => {}
                }
                previous = current;
                if rx.changed().await.is_err() {
                    break;
                }
                current = rx.borrow_and_update().clone();
            }
        });
        self.track(task);
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    pub async fn stats(&self) -> DispatchStats {
        self.dispatch.stats().await
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Close the connection and stop every background task.
    pub fn shutdown(&self) {
        self.connection.disconnect();
        self.dispatch.shutdown();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

impl Drop for NotificationClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
