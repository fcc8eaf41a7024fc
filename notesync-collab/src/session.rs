//! Connection Session: one client's participation in one document.
//!
//! ```text
//!  Connecting ──start()──► Syncing ──step2 sent + step2 received──► Synced
//!       │                     │                                        │
//!       └─────────────────────┴──────────────── close() ───────────────┴──► Closed
//! ```
//!
//! The session is pure protocol logic. It consumes discrete inputs
//! (client frames, relayed messages, lag notifications) and returns the
//! frames to write back to its own client; relaying to peers goes through
//! the document's [`BroadcastGroup`](crate::broadcast::BroadcastGroup).
//! The transport owns the socket and drives these calls.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;
use crate::broadcast::Relayed;
use crate::error::{CollabError, Result};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::registry::DocumentEntry;

/// Origin stamped on messages the server itself produces.
pub const SERVER_ORIGIN: Uuid = Uuid::nil();

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Syncing,
    Synced,
    Closed,
}

pub struct Session {
    info: PeerInfo,
    entry: Arc<DocumentEntry>,
    state: SessionState,
    sent_step2: bool,
    received_step2: bool,
    /// Relays held back until the handshake completes
    pending: VecDeque<Relayed>,
    /// Set when `pending` overflowed or the relay lagged during the handshake
    needs_full_state: bool,
    last_activity: Instant,
    messages_received: u64,
}

impl Session {
    pub fn new(info: PeerInfo, entry: Arc<DocumentEntry>) -> Self {
        Self {
            info,
            entry,
            state: SessionState::Connecting,
            sent_step2: false,
            received_step2: false,
            pending: VecDeque::new(),
            needs_full_state: false,
            last_activity: Instant::now(),
            messages_received: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.info.session_id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn document_name(&self) -> &str {
        self.entry.name()
    }

    pub fn entry(&self) -> &Arc<DocumentEntry> {
        &self.entry
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Record transport-level activity (keep-alive frames) that carries no message.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() >= timeout
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Begin the handshake: greet the client, send our state vector and the
    /// presence of everyone already here.
    pub fn start(&mut self) -> Result<Vec<SyncMessage>> {
        if self.state != SessionState::Connecting {
            return Ok(Vec::new());
        }
        self.state = SessionState::Syncing;
        log::debug!("Session {} syncing '{}'", self.id(), self.document_name());

        let mut out = vec![
            SyncMessage::welcome(&self.info)?,
            SyncMessage::sync_step1(SERVER_ORIGIN, self.entry.document().state_vector()),
        ];
        let snapshot = self.entry.awareness().snapshot();
        if !snapshot.is_empty() {
            out.push(SyncMessage::awareness(SERVER_ORIGIN, &snapshot)?);
        }
        Ok(out)
    }

    /// Handle one frame from this session's client.
    ///
    /// An `Err` means the client violated the protocol; the caller should
    /// close the session. The document is never modified by a rejected frame.
    pub fn handle_incoming(&mut self, msg: SyncMessage) -> Result<Vec<SyncMessage>> {
        if self.state == SessionState::Closed {
            return Err(CollabError::SessionClosed);
        }
        self.last_activity = Instant::now();
        self.messages_received += 1;

        let mut out = Vec::new();
        match msg.msg_type {
            MessageType::SyncStep1 => {
                let diff = self.entry.document().encode_state_as_update(&msg.payload)?;
                out.push(SyncMessage::sync_step2(SERVER_ORIGIN, diff));
                self.sent_step2 = true;
            }
            MessageType::SyncStep2 => {
                self.merge_and_relay(msg)?;
                self.received_step2 = true;
            }
            MessageType::Update => {
                self.merge_and_relay(msg)?;
            }
            MessageType::Awareness => {
                let update = msg.awareness_update()?;
                self.apply_awareness(update)?;
            }
            MessageType::Ping => out.push(SyncMessage::pong(SERVER_ORIGIN)),
            MessageType::Pong => {}
            MessageType::Welcome => {
                return Err(ProtocolError::InvalidMessageType.into());
            }
        }

        if self.state == SessionState::Syncing && self.sent_step2 && self.received_step2 {
            self.state = SessionState::Synced;
            log::debug!("Session {} synced '{}'", self.id(), self.document_name());
            out.extend(self.flush_pending()?);
        }
        Ok(out)
    }

    /// Handle a message relayed from another session on the same document.
    pub fn handle_relay(&mut self, msg: Relayed) -> Result<Vec<SyncMessage>> {
        if msg.origin == self.id() || self.state == SessionState::Closed {
            return Ok(Vec::new());
        }
        if self.state != SessionState::Synced {
            if self.pending.len() >= self.entry.group().capacity() {
                self.pending.clear();
                self.needs_full_state = true;
            } else if !self.needs_full_state {
                self.pending.push_back(msg);
            }
            return Ok(Vec::new());
        }
        Ok(vec![SyncMessage::clone(&msg)])
    }

    /// The relay skipped `skipped` messages for this session. Replace them
    /// with a full-state update and a fresh presence snapshot.
    pub fn resync(&mut self, skipped: u64) -> Result<Vec<SyncMessage>> {
        self.entry.group().record_lag(skipped);
        log::warn!(
            "Session {} lagged by {skipped} messages on '{}'",
            self.id(),
            self.document_name()
        );
        match self.state {
            SessionState::Synced => self.full_state(),
            SessionState::Closed => Ok(Vec::new()),
            SessionState::Connecting | SessionState::Syncing => {
                self.pending.clear();
                self.needs_full_state = true;
                Ok(Vec::new())
            }
        }
    }

    /// Move to `Closed` and withdraw this session's presence from its peers.
    ///
    /// Idempotent. Detaching from the registry is the caller's job.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.pending.clear();

        let tombstone = self.entry.awareness().remove(self.id());
        if let Some(update) = tombstone {
            self.entry
                .group()
                .broadcast(SyncMessage::awareness(self.id(), &update)?);
        }
        log::info!("Session {} closed on '{}'", self.id(), self.document_name());
        Ok(())
    }

    /// Merge a client update and relay it to peers, attributed to this
    /// session whatever origin the client claimed.
    fn merge_and_relay(&self, msg: SyncMessage) -> Result<()> {
        self.entry.document().apply_remote_update(&msg.payload)?;
        let relayed = match msg.msg_type {
            MessageType::Update => msg.with_origin(self.id()),
            _ => SyncMessage::update(self.id(), msg.payload),
        };
        self.entry.group().broadcast(relayed);
        Ok(())
    }

    /// Accept only the entry describing this session. The server assigns
    /// the clock, so clients cannot replay or forge others' presence.
    fn apply_awareness(&self, update: AwarenessUpdate) -> Result<()> {
        let mut own = None;
        for entry in update.entries {
            if entry.client_id == self.id() {
                own = Some(entry.state);
            } else {
                log::warn!(
                    "Session {} sent presence for {}; dropped",
                    self.id(),
                    entry.client_id
                );
            }
        }
        let Some(record) = own else {
            return Ok(());
        };

        let relay = self.entry.awareness().set_local_state(self.id(), record);
        self.entry
            .group()
            .broadcast(SyncMessage::awareness(self.id(), &relay)?);
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<Vec<SyncMessage>> {
        if std::mem::take(&mut self.needs_full_state) {
            self.pending.clear();
            return self.full_state();
        }
        Ok(self
            .pending
            .drain(..)
            .map(|msg| SyncMessage::clone(&msg))
            .collect())
    }

    fn full_state(&self) -> Result<Vec<SyncMessage>> {
        let mut out = vec![SyncMessage::update(
            SERVER_ORIGIN,
            self.entry.document().encode_state(),
        )];
        let snapshot = self.entry.awareness().snapshot();
        if !snapshot.is_empty() {
            out.push(SyncMessage::awareness(SERVER_ORIGIN, &snapshot)?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("document", &self.document_name())
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .finish()
    }
}
