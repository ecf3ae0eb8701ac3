//! Notifier Client - real-time notification delivery
//!
//! This crate keeps one authenticated socket to the notification service,
//! fans inbound notifications out to any number of subscribers, buffers
//! them while nobody listens, and asks for the backlog after reconnects.

pub mod logging;

pub mod auth_session;
pub mod client;
pub mod config;
pub mod error;
pub mod notifications;
pub mod storage;
pub mod ws;

pub use auth_session::{AuthContext, AuthProvider, AuthSession, StaticToken};
pub use client::{global, install_global, NotificationClient, NotificationClientBuilder, Subscription};
pub use config::{ClientConfig, ReconnectConfig};
pub use error::ClientError;
pub use notifications::{callback, Callback, DispatchStats};
pub use storage::{FileStore, MarkerStore, MemoryStore};
pub use ws::{
    Channel, ConnectionManager, ConnectionState, DisconnectReason, Transport, TransportEvent,
    WsHandle, WsTransport,
};

pub use notifier_shared::{ClientCommand, Notification, ServerEvent, TransportError};
