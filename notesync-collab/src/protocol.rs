//! Binary protocol for document sync and awareness.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬──────────┐
//! │ msg_type │ origin     │ payload  │
//! │ 1 byte   │ 16 bytes   │ variable │
//! └──────────┴────────────┴──────────┘
//! ```
//!
//! `origin` is the session that produced the message. Clients may send any
//! value; the server overwrites it with the sending session's id before
//! relaying, which is what the no-echo filter keys on.
//!
//! Payloads by type:
//! - `SyncStep1` — Yrs v1 state vector
//! - `SyncStep2` / `Update` — Yrs v1 update
//! - `Awareness` — bincode [`AwarenessUpdate`](crate::awareness::AwarenessUpdate)
//! - `Welcome` — bincode [`PeerInfo`]
//! - `Ping` / `Pong` — empty

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector: "send me what I am missing"
    SyncStep1 = 1,
    /// Diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental update produced after the handshake
    Update = 3,
    /// Presence entries
    Awareness = 4,
    /// Server greeting carrying the session's identity
    Welcome = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Session identity as announced to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub session_id: Uuid,
    /// Opaque identifier supplied by the identity layer
    pub user_id: String,
    /// Presence colour, `#RRGGBB`
    pub color: String,
}

impl PeerInfo {
    pub fn new(session_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            color: crate::awareness::presence_color(session_id).to_string(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub origin: Uuid,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, origin: Uuid, payload: Vec<u8>) -> Self {
        Self { msg_type, origin, payload }
    }

    pub fn sync_step1(origin: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, origin, state_vector)
    }

    pub fn sync_step2(origin: Uuid, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, origin, diff)
    }

    pub fn update(origin: Uuid, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, origin, update)
    }

    pub fn awareness(origin: Uuid, update: &AwarenessUpdate) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, origin, encode_payload(update)?))
    }

    pub fn welcome(info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Welcome, info.session_id, encode_payload(info)?))
    }

    pub fn ping(origin: Uuid) -> Self {
        Self::new(MessageType::Ping, origin, Vec::new())
    }

    pub fn pong(origin: Uuid) -> Self {
        Self::new(MessageType::Pong, origin, Vec::new())
    }

    /// Copy of this message re-attributed to `origin`.
    pub fn with_origin(mut self, origin: Uuid) -> Self {
        self.origin = origin;
        self
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse awareness payload.
    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse welcome payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::Welcome {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::Deserialization(format!(
            "{} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{AwarenessEntry, PresenceRecord};

    #[test]
    fn test_sync_message_roundtrip() {
        let origin = Uuid::new_v4();
        let msg = SyncMessage::update(origin, vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_awareness_payload() {
        let origin = Uuid::new_v4();
        let update = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: origin,
                clock: 3,
                state: Some(PresenceRecord::named("Alice")),
            }],
        };
        let msg = SyncMessage::awareness(origin, &update).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_update().unwrap(), update);
    }

    #[test]
    fn test_welcome_payload() {
        let info = PeerInfo::new(Uuid::new_v4(), "user-42");
        let msg = SyncMessage::welcome(&info).unwrap();
        assert_eq!(msg.origin, info.session_id);
        assert_eq!(msg.peer_info().unwrap(), info);
    }

    #[test]
    fn test_payload_accessor_rejects_wrong_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(matches!(msg.awareness_update(), Err(ProtocolError::InvalidMessageType)));
        assert!(matches!(msg.peer_info(), Err(ProtocolError::InvalidMessageType)));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(SyncMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = SyncMessage::ping(Uuid::new_v4()).encode().unwrap();
        bytes.push(0);
        assert!(SyncMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_with_origin_rewrites() {
        let claimed = Uuid::new_v4();
        let actual = Uuid::new_v4();
        let msg = SyncMessage::update(claimed, vec![9]).with_origin(actual);
        assert_eq!(msg.origin, actual);
        assert_eq!(msg.payload, vec![9]);
    }

    #[test]
    fn test_update_header_is_small() {
        let msg = SyncMessage::update(Uuid::new_v4(), vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 100, "Encoded size {} too large", encoded.len());
    }
}
