//! # huddle-collab: Real-time coordination for collaborative editing
//!
//! Keeps connected clients' replicas of each open file convergent, tracks
//! who is present in each project, relays cursor awareness, and forwards
//! voice-call negotiation between specific connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (JSON text | bincode binary)   ┌──────────────┐
//! │ CollabClient │ ◄────────────────────────────────────────► │ CollabServer │
//! └──────────────┘                                            └──────┬───────┘
//!                                                                    │ ClientEvent
//!                                                                    ▼
//!                                                             ┌──────────────┐
//!                                                             │  CollabHub   │──► PermissionGate
//!                                                             └──────┬───────┘
//!             ┌──────────────────────┬───────────────────────┬───────┴───────────┐
//!             ▼                      ▼                       ▼                   ▼
//!     PresenceTracker        DocumentRegistry         AwarenessTable      SignalingRelay
//!     (rooms per project)    (Yrs Doc per file)       (per session)       (by connection id)
//!                                    │
//!                                    ▼
//!                               FileStore (memory | RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Event types and the JSON/bincode codec
//! - [`access`]: Roles, permission gate, identity/membership traits
//! - [`directory`]: Static token and membership directory
//! - [`connection`]: Bounded outbound queues, live-connection registry
//! - [`broadcast`]: Member sets with ordered fan-out
//! - [`document`]: Document registry, sessions, idle eviction
//! - [`awareness`]: Cursor/selection state per session
//! - [`presence`]: Project rooms and rosters
//! - [`signaling`]: Point-to-point voice negotiation relay
//! - [`hub`]: Per-event dispatch and disconnect cleanup
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client
//! - [`storage`]: File persistence backends

pub mod access;
pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod directory;
pub mod document;
pub mod error;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod signaling;
pub mod storage;

// Re-exports for convenience
pub use access::{AccessError, Action, Authenticator, PermissionGate, ProjectDirectory, Role, UserIdentity};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{CollabClient, ConnectionState};
pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnectionHandle, ConnectionRegistry};
pub use directory::{DirectoryError, StaticDirectory};
pub use document::{DocumentRegistry, DocumentSession, UpdateOutcome};
pub use error::CollabError;
pub use hub::{CollabHub, Connection, ServerStats};
pub use presence::PresenceTracker;
pub use protocol::{
    AwarenessState, ClientEvent, ConnectionId, CursorPosition, DocumentKey, ErrorCode, Frame,
    Participant, PeerAwareness, ProjectId, ProtocolError, SelectionRange, ServerEvent, SignalKind,
    UserId, WireEncoding,
};
pub use server::CollabServer;
pub use signaling::{SignalEnvelope, SignalingRelay};
pub use storage::{FileStore, MemoryFileStore, RocksFileStore, StoreConfig, StoreError};
