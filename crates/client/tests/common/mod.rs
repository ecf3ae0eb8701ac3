//! Scripted in-process transport for driving the client without a network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver};
use futures_util::{FutureExt, StreamExt};
use notifier_client::{
    Channel, ClientCommand, ClientConfig, DisconnectReason, MarkerStore, MemoryStore,
    Notification, NotificationClient, ServerEvent, StaticToken, Transport, TransportError,
    TransportEvent, WsHandle,
};
use notifier_shared::WsEnvelope;
use tokio::sync::mpsc;

/// What the next `connect` call does.
#[derive(Debug, Clone)]
pub enum Outcome {
    Accept,
    Reject(TransportError),
    /// Never resolves; exercises the connect timeout.
    Hang,
}

/// Server half of one accepted channel.
pub struct Session {
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: UnboundedReceiver<WsEnvelope<ClientCommand>>,
}

impl Session {
    pub fn push(&self, notification: Notification) {
        let _ = self
            .events
            .send(TransportEvent::Message(ServerEvent::Notification(notification)));
    }

    pub fn send(&self, event: ServerEvent) {
        let _ = self.events.send(TransportEvent::Message(event));
    }

    pub fn close(&self, reason: DisconnectReason) {
        let _ = self.events.send(TransportEvent::Closed(reason));
    }

    /// Commands the client has written so far.
    pub fn commands(&mut self) -> Vec<ClientCommand> {
        let mut out = Vec::new();
        while let Some(Some(envelope)) = self.commands.next().now_or_never() {
            out.push(envelope.payload);
        }
        out
    }
}

#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Outcome>>,
    connects: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    sessions: Mutex<Vec<Option<Session>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(outcomes: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        let transport = Self::default();
        transport.script.lock().unwrap().extend(outcomes);
        Arc::new(transport)
    }

    pub fn push_outcome(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Take the server half of the `index`th accepted channel.
    pub fn session(&self, index: usize) -> Session {
        self.sessions.lock().unwrap()[index]
            .take()
            .expect("session already taken")
    }

    pub fn latest_session(&self) -> Session {
        let index = self.sessions() - 1;
        self.session(index)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, token: &str) -> Result<Channel, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.to_string());

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Accept);
        match outcome {
            Outcome::Accept => {
                let (cmd_tx, cmd_rx) = unbounded();
                let (event_tx, event_rx) = mpsc::unbounded_channel();
                self.sessions.lock().unwrap().push(Some(Session {
                    events: event_tx,
                    commands: cmd_rx,
                }));
                Ok(Channel {
                    handle: WsHandle::new(cmd_tx),
                    events: event_rx,
                })
            }
            Outcome::Reject(err) => Err(err),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

/// Let spawned tasks run. Advances paused time by one millisecond.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        storage_dir: None,
        ..ClientConfig::default()
    }
}

pub fn client_with(
    transport: Arc<MockTransport>,
    store: Arc<dyn MarkerStore>,
) -> NotificationClient {
    NotificationClient::builder()
        .config(test_config())
        .transport(transport)
        .store(store)
        .auth(Arc::new(StaticToken("secret".into())))
        .build()
        .expect("client builds")
}

pub fn client(transport: Arc<MockTransport>) -> NotificationClient {
    client_with(transport, Arc::new(MemoryStore::new()))
}

/// Subscriber callback that records the ids it receives.
pub fn recorder() -> (
    impl Fn(&Notification) + Send + Sync + 'static,
    Arc<Mutex<Vec<String>>>,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let f = move |n: &Notification| {
        sink.lock()
            .unwrap()
            .push(n.id().unwrap_or_default().to_string());
    };
    (f, seen)
}

pub fn ids(seen: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    seen.lock().unwrap().clone()
}
