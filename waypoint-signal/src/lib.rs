//! # waypoint-signal — presence and call signaling for Waypoint
//!
//! Tracks connected clients, broadcasts presence/roster updates, and relays
//! call-setup and WebRTC negotiation frames between exactly two parties.
//! Media never touches the server; once negotiation completes, peers talk
//! directly.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SignalClient │ ◄─────────────────► │ SignalServer │
//! │ (per user)   │    JSON frames      │  (central)   │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                      ┌──────┴────────┐
//!                                      │ MessageRouter │
//!                                      └──────┬────────┘
//!                                ┌────────────┴────────────┐
//!                                ▼                         ▼
//!                      ┌──────────────────┐      ┌───────────────┐
//!                      │ ConnectionRegistry│      │ PresenceStore │
//!                      │ (who is online)   │      │ (roster)      │
//!                      └──────────────────┘      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire frames (`type`- and `action`-discriminated)
//! - [`registry`] — identity → live connection map
//! - [`presence`] — insertion-ordered roster with partial upserts
//! - [`router`] — stateless classify/forward/broadcast dispatcher
//! - [`server`] — WebSocket server and per-connection lifecycle
//! - [`client`] — typed WebSocket client for the protocol
//!
//! The server holds no call-session state: every relay frame carries its
//! own target, and a frame addressed to a departed identity is dropped,
//! not errored. Nothing is persisted; the roster is rebuilt purely from
//! live connections.

pub mod client;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

// Re-exports for convenience
pub use client::{ConnectionState, SignalClient, SignalEvent};
pub use presence::{PresenceStore, PresenceUpdate};
pub use protocol::{
    ClientAction, ClientFrame, ClientId, Coordinates, PresenceEvent, PresenceRecord,
    ProtocolError, RelayFrame, RelayKind, ServerEvent, ServerFrame,
};
pub use registry::{ConnectionHandle, ConnectionRegistry, RegistryError};
pub use router::MessageRouter;
pub use server::{ServerConfig, ServerStats, SignalServer};
