//! Error taxonomy for the collaboration core.
//!
//! Every error here is scoped to a single session or a single registry
//! operation. None of them should ever take down the accept loop.

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::store::StoreError;

/// Errors surfaced by the collaboration core.
#[derive(Debug, Error)]
pub enum CollabError {
    /// The upgrade request did not name a document. No session is created.
    #[error("connection path does not name a document")]
    MissingDocumentName,

    /// A sync payload failed to decode or could not be merged.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// A create/evict race was caught. Callers retry against the current entry.
    #[error("registry race detected for document '{0}'")]
    RegistryRaceDetected(String),

    /// The document already holds the configured maximum of sessions.
    #[error("document '{name}' is full ({limit} sessions)")]
    DocumentFull { name: String, limit: usize },

    /// The session has already reached `Closed`.
    #[error("session is closed")]
    SessionClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollabError {
    /// Whether this error should be reported to the peer as a protocol violation.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::InvalidUpdate(_) | Self::Protocol(_))
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
