//! WebSocket server with project-room routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  handshake (token)   ┌── reader task ──► HubHandle ──┐
//!            ├──────────────────────┤                               ▼
//! Client B ──┘                      └── writer task ◄── ClientChannel ◄── Hub
//!                                                                    │
//!                                         RoomRegistry + Broadcaster ┘
//! ```
//!
//! Each accepted connection gets:
//! - a handshake check: no token, no upgrade (HTTP 401)
//! - a reader task decoding JSON text frames into hub intents
//! - a writer task draining the connection's reliable and volatile lanes
//!
//! The socket closing, for any reason, detaches the session from the hub,
//! which purges its presence and editing state.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{self, AcceptNonEmpty, Credential, TokenVerifier};
use crate::broadcast::{ClientChannel, DEFAULT_RELIABLE_CAPACITY, DEFAULT_VOLATILE_CAPACITY};
use crate::hub::{Hub, HubClosed, HubHandle};
use crate::metrics::{MetricsProvider, TaskTally};
use crate::protocol::ClientIntent;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames a connection may have queued before it is evicted as lagging
    pub reliable_capacity: usize,
    /// Capacity of each connection's volatile (cursor) lane
    pub volatile_capacity: usize,
    /// Largest accepted inbound message, in bytes
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            reliable_capacity: DEFAULT_RELIABLE_CAPACITY,
            volatile_capacity: DEFAULT_VOLATILE_CAPACITY,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Hub(#[from] HubClosed),
}

/// The realtime server.
///
/// Construct inside a tokio runtime: the hub task is spawned immediately.
pub struct RealtimeServer {
    config: ServerConfig,
    hub: HubHandle,
    verifier: Arc<dyn TokenVerifier>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RealtimeServer {
    /// Create a server that tallies metrics from the task events it relays.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_metrics(config, Arc::new(TaskTally::new()))
    }

    /// Create a server whose task mutations feed `provider`.
    pub fn with_metrics(config: ServerConfig, provider: Arc<dyn MetricsProvider>) -> Self {
        let (hub, _task) = Hub::spawn(provider);
        Self {
            config,
            hub,
            verifier: Arc::new(AcceptNonEmpty),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Replace the handshake token verifier.
    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Realtime server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let verifier = self.verifier.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, verifier, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: HubHandle,
        verifier: Arc<dyn TokenVerifier>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let mut credential: Option<Credential> = None;
        let check = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match auth::authenticate(request, verifier.as_ref()) {
                Ok(granted) => {
                    credential = Some(granted);
                    Ok(response)
                }
                Err(e) => {
                    let mut rejection = ErrorResponse::new(Some(e.to_string()));
                    *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(rejection)
                }
            }
        };
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(config.max_frame_bytes))
            .max_frame_size(Some(config.max_frame_bytes));

        let ws_stream =
            match tokio_tungstenite::accept_hdr_async_with_config(stream, check, Some(ws_config)).await {
                Ok(ws) => ws,
                Err(e) => {
                    stats.write().await.rejected_handshakes += 1;
                    log::warn!("Handshake with {addr} failed: {e}");
                    return Ok(());
                }
            };
        let Some(credential) = credential else {
            return Ok(());
        };

        let (channel, mut outbound) = ClientChannel::with_capacity(config.reliable_capacity, config.volatile_capacity);
        let channel_id = channel.id();
        hub.attach(channel, credential)?;
        log::info!("WebSocket connection established from {addr} (session {channel_id})");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Writer: ends when the hub drops the session's channel.
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                    log::debug!("Write to session {channel_id} failed: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += text.len() as u64;
                    }
                    match ClientIntent::decode(text.as_str()) {
                        Ok(intent) => {
                            if hub.intent(channel_id, intent).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            stats.write().await.malformed_frames += 1;
                            log::warn!("Dropping malformed frame from {addr}: {e}");
                        }
                    }
                }
                Ok(Message::Binary(data)) => {
                    log::debug!("Ignoring {}-byte binary frame from {addr}", data.len());
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break;
                }
            }
        }

        let _ = hub.detach(channel_id);
        let _ = writer.await;
        stats.write().await.active_connections -= 1;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Handle to the hub, for queries.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }
}
