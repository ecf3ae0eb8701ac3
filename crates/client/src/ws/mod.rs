//! Notification socket: the transport seam and the connection manager.
//!
//! ```text
//!  subscribe() ──► ConnectionManager ──► Transport::connect ──► Channel
//!                       │                                        │
//!                       │ state, retries, auth short-circuit     │ TransportEvent
//!                       ▼                                        ▼
//!                 DispatchHandle ◄──────────── pump ◄────────────┘
//! ```

mod connection;
mod manager;

pub use connection::{Channel, DisconnectReason, Transport, TransportEvent, WsHandle, WsTransport};
pub use manager::{ConnectionConfig, ConnectionManager, ConnectionState};
