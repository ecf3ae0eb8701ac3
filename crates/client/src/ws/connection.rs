//! A single physical notification socket and the seam used to open one.

use std::fmt;

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use notifier_shared::{
    bearer, is_auth_close_code, ClientCommand, ServerEvent, TransportError, WsEnvelope,
};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{header::AUTHORIZATION, HeaderValue},
    protocol::Message,
    Error as WsError,
};
use url::Url;

/// Handle for sending commands through an open connection
#[derive(Clone)]
pub struct WsHandle {
    sender: UnboundedSender<WsEnvelope<ClientCommand>>,
}

impl WsHandle {
    pub fn new(sender: UnboundedSender<WsEnvelope<ClientCommand>>) -> Self {
        Self { sender }
    }

    /// Send a command to the server
    pub fn send(&self, cmd: ClientCommand) -> Result<(), TransportError> {
        crate::log_debug!("WsHandle::send: {:?}", cmd);
        self.sender
            .unbounded_send(WsEnvelope::new(cmd))
            .map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server sent a close frame.
    ServerClosed { code: Option<u16>, reason: String },
    /// The socket failed or ended without a close frame.
    TransportLost(String),
    /// The local side dropped the connection.
    ClientClosed,
}

impl DisconnectReason {
    /// The remote end deliberately closed the channel.
    pub fn is_server_forced(&self) -> bool {
        matches!(self, DisconnectReason::ServerClosed { .. })
    }

    /// The server closed the channel because it rejected the credential.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ServerClosed { code: Some(code), .. } if is_auth_close_code(*code)
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerClosed { code: Some(code), reason } => {
                write!(f, "closed by server (code {}): {}", code, reason)
            }
            DisconnectReason::ServerClosed { code: None, reason } => {
                write!(f, "closed by server: {}", reason)
            }
            DisconnectReason::TransportLost(reason) => write!(f, "connection lost: {}", reason),
            DisconnectReason::ClientClosed => write!(f, "closed by client"),
        }
    }
}

/// Something that happened on an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerEvent),
    /// Always the last event of a channel.
    Closed(DisconnectReason),
}

/// An open connection: a command sender plus the stream of inbound events.
///
/// Dropping both halves closes the underlying socket.
pub struct Channel {
    pub handle: WsHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections to the notification server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection authenticated with `token`.
    ///
    /// A rejected credential must surface as [`TransportError::Unauthorized`].
    async fn connect(&self, token: &str) -> Result<Channel, TransportError>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: Url,
}

impl WsTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, token: &str) -> Result<Channel, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Protocol(format!("Failed to build request: {}", e)))?;
        let auth = HeaderValue::from_str(&bearer(token))
            .map_err(|_| TransportError::Protocol("Token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (socket, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(WsError::Http(response)) => {
                let status = response.status().as_u16();
                return Err(match status {
                    401 => TransportError::Unauthorized("server requires valid credentials".into()),
                    403 => TransportError::Unauthorized("access to notifications denied".into()),
                    code => TransportError::Network(format!("HTTP error {}", code)),
                });
            }
            Err(e) => return Err(TransportError::Network(e.to_string())),
        };
        crate::log_info!("WebSocket connected to {}", self.url);

        let (mut sink, mut stream) = socket.split();
        let (cmd_tx, mut cmd_rx) = unbounded::<WsEnvelope<ClientCommand>>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Send task: runs until every WsHandle is dropped
        tokio::spawn(async move {
            while let Some(envelope) = cmd_rx.next().await {
                match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        if let Err(e) = sink.send(Message::Text(json.into())).await {
                            crate::log_warn!("Send failed, stopping send task: {}", e);
                            break;
                        }
                    }
                    Err(e) => crate::log_error!("Serialize failed: {}", e),
                }
            }
            let _ = sink.close().await;
        });

        // Receive task: forwards server events, ends with exactly one Closed
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = event_tx.closed() => break DisconnectReason::ClientClosed,
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<WsEnvelope<ServerEvent>>(&text) {
                                Ok(envelope) => {
                                    let _ = event_tx.send(TransportEvent::Message(envelope.payload));
                                }
                                Err(e) => crate::log_warn!("Ignoring undecodable frame: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break match frame {
                                Some(frame) => DisconnectReason::ServerClosed {
                                    code: Some(u16::from(frame.code)),
                                    reason: frame.reason.to_string(),
                                },
                                None => DisconnectReason::ServerClosed {
                                    code: None,
                                    reason: String::new(),
                                },
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break DisconnectReason::TransportLost(e.to_string()),
                        None => break DisconnectReason::TransportLost("stream ended".into()),
                    },
                }
            };
            crate::log_debug!("WebSocket receive task finished: {}", reason);
            let _ = event_tx.send(TransportEvent::Closed(reason));
        });

        Ok(Channel {
            handle: WsHandle::new(cmd_tx),
            events: event_rx,
        })
    }
}
