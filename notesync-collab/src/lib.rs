//! # notesync-collab — Real-time collaborative editing core for notes
//!
//! Keeps every connected editor of a note converged on the same content
//! using CRDT synchronization over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (transport) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │ one Session per connection
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────────┐
//! │ Yrs Doc     │                     │ DocumentRegistry │
//! │ (local)     │                     │ name → entry     │
//! └─────────────┘                     └──────┬───────────┘
//!                                            │
//!                              ┌─────────────┼──────────────┐
//!                              ▼             ▼              ▼
//!                     ReplicatedDocument BroadcastGroup AwarenessStates
//! ```
//!
//! ## Modules
//!
//! - [`document`] — CRDT replica of one note
//! - [`registry`] — name → live document, with grace-period eviction
//! - [`broadcast`] — fan-out to the sessions of one document
//! - [`session`] — per-connection handshake and relay state machine
//! - [`server`] — WebSocket transport adapter
//! - [`awareness`] — ephemeral presence (cursors, names, colours)
//! - [`protocol`] — binary wire protocol (bincode-encoded SyncMessage)
//! - [`client`] — WebSocket sync client
//! - [`store`] — optional snapshot persistence interface
//! - [`config`] — TOML server configuration

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use awareness::{
    AwarenessEntry, AwarenessEvent, AwarenessStates, AwarenessUpdate, CursorRange,
    PresenceRecord, PresenceView,
};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig};
pub use document::{Mutation, ReplicatedDocument};
pub use error::{CollabError, Result};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use registry::{DocumentEntry, DocumentRegistry, RegistryConfig};
pub use server::{ServerStats, SyncServer};
pub use session::{Session, SessionState};
pub use store::{DocumentStore, MemoryStore, StoreError};
