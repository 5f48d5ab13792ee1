//! # coedit-collab: Real-time collaboration layer for coedit
//!
//! Hosts documents in memory and keeps every connected editor's replica in
//! sync over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     JSON envelopes  │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                  ┌──────────────────┐
//! │ClientDocument│                  │ DocumentRegistry │
//! │ (replica)    │                  │  └ DocumentSession (authority)
//! └──────────────┘                  └────────┬─────────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Limits and addresses, overridable from the environment
//! - [`session`]: Per-document engine, roster and language
//! - [`registry`]: Bounded document map with idle sweeping
//! - [`protocol`]: JSON wire messages and handshake parameters
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`server`]: WebSocket sync server
//! - [`client`]: Reconnecting client and local replica

pub mod broadcast;
pub mod client;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame, RoomManager};
pub use client::{
    ClientDocument, ClientEvent, ConnectionEvent, ConnectionMachine, ConnectionState,
    GiveUpReason, ReconnectPolicy, SyncClient, Transition, random_site_id,
};
pub use config::{CollabConfig, ConfigError};
pub use protocol::{
    ClientMessage, ErrorCode, ErrorPayload, HandshakeParams, ProtocolError, ServerMessage,
    CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION,
};
pub use registry::{DocumentRegistry, RegistryError};
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::{CursorPosition, DocumentSession, InitState, SharedSession, User};
