//! # impactflow-realtime — Realtime collaboration layer for ImpactFlow
//!
//! Pushes task, approval, comment, presence and co-editing events between
//! everyone looking at the same project, over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐     WebSocket      ┌──────────────────┐
//! │ ReconnectController │ ◄────────────────► │ RealtimeServer   │
//! │ (per browser tab)   │   JSON text frames │ (central)        │
//! └──────────┬──────────┘                    └────────┬─────────┘
//!            │                                        │ HubCommand
//!            ▼                                        ▼
//! ┌─────────────────────┐                    ┌──────────────────┐
//! │ NotificationMailbox │                    │ Hub (one task)   │
//! │ (RocksDB / memory)  │                    │  RoomRegistry    │
//! └─────────────────────┘                    │  Broadcaster     │
//!                                            │  Sessions        │
//!                                            └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Event vocabulary and JSON wire format
//! - [`registry`] — Project rooms and task editing sessions
//! - [`broadcast`] — Room fan-out with reliable and volatile lanes
//! - [`session`] — Per-connection state machine
//! - [`hub`] — Actor owning all room state
//! - [`auth`] — Handshake token checks
//! - [`metrics`] — Project metrics recomputation after task changes
//! - [`server`] — WebSocket server
//! - [`client`] — Reconnecting client
//! - [`mailbox`] — Persistent notification mailbox
//! - [`storage`] — Mailbox stores

pub mod protocol;
pub mod registry;
pub mod broadcast;
pub mod session;
pub mod hub;
pub mod auth;
pub mod metrics;
pub mod server;
pub mod client;
pub mod mailbox;
pub mod storage;

// Re-exports for convenience
pub use protocol::{
    ApprovalStatus, ClientIntent, CursorPosition, Notification, NotificationKind, ProjectId,
    ProjectMetrics, ProtocolError, ServerEvent, TaskId, User, UserId, UserRole,
};
pub use registry::{Notice, RoomRegistry};
pub use broadcast::{
    BroadcastStats, Broadcaster, ChannelId, ChannelReceiver, ClientChannel, DeliveryReport, SendOutcome,
};
pub use session::{Session, SessionState};
pub use hub::{Hub, HubClosed, HubHandle, HubStats};
pub use auth::{AcceptNonEmpty, AuthError, Credential, TokenVerifier};
pub use metrics::{MetricsProvider, NoMetrics, TaskMutation, TaskTally};
pub use server::{RealtimeServer, ServerConfig, ServerError, ServerStats};
pub use client::{
    ClientError, ClientEvent, ConnectionState, Connector, Link, ReconnectConfig, ReconnectController,
    WsConnector,
};
pub use mailbox::{MailboxConfig, NotificationMailbox};
pub use storage::{MailboxStore, MemoryMailboxStore, RocksMailboxStore, StoreConfig, StoreError};
