//! Awareness channel: ephemeral presence shared among sessions on a document.
//!
//! Presence never touches the replicated document and is never persisted.
//! Each entry is keyed by the session id and carries a clock so that
//! receivers can drop stale or reordered updates.
//!
//! ```text
//! client ── Awareness{own entry} ──► Session
//!                                      │ AwarenessStates::set_local_state()
//!                                      ▼  (server assigns the clock)
//!                               relay to other sessions
//!                                      │
//!                                      ▼
//!                          PresenceView::apply() on each peer
//! ```
//!
//! A session closing produces a tombstone entry (`state: None`) so peers
//! drop the cursor.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Presence colours handed out to sessions.
pub const PALETTE: [&str; 10] = [
    "#F87171", "#FB923C", "#FBBF24", "#34D399", "#60A5FA",
    "#818CF8", "#A78BFA", "#F472B6", "#94A3B8", "#6EE7B7",
];

/// Stable palette colour for a session id.
pub fn presence_color(id: Uuid) -> &'static str {
    PALETTE[(id.as_u128() % PALETTE.len() as u128) as usize]
}

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

/// Selection inside the document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

/// A session's presence record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_name: Option<String>,
    pub color: Option<String>,
    pub cursor: Option<CursorRange>,
    /// Application-defined extras
    pub fields: BTreeMap<String, String>,
}

impl PresenceRecord {
    pub fn named(user_name: impl Into<String>) -> Self {
        Self {
            user_name: Some(user_name.into()),
            ..Self::default()
        }
    }

    pub fn with_cursor(mut self, anchor: u32, head: u32) -> Self {
        self.cursor = Some(CursorRange { anchor, head });
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// One client's presence at a given clock. `state: None` means removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: Uuid,
    pub clock: u64,
    pub state: Option<PresenceRecord>,
}

/// Payload of an `Awareness` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn single(entry: AwarenessEntry) -> Self {
        Self { entries: vec![entry] }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Server side: authoritative per-document states
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredPresence {
    clock: u64,
    record: Option<PresenceRecord>,
}

/// Presence of every session attached to one document.
///
/// The server owns the clocks: a client only states what its record is, and
/// each change bumps that session's clock.
#[derive(Debug, Default)]
pub struct AwarenessStates {
    states: HashMap<Uuid, StoredPresence>,
}

impl AwarenessStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or clear a session's record; returns the update to relay.
    pub fn set_local_state(
        &mut self,
        session_id: Uuid,
        record: Option<PresenceRecord>,
    ) -> AwarenessUpdate {
        let stored = self
            .states
            .entry(session_id)
            .or_insert(StoredPresence { clock: 0, record: None });
        stored.clock += 1;
        stored.record = record.clone();
        AwarenessUpdate::single(AwarenessEntry {
            client_id: session_id,
            clock: stored.clock,
            state: record,
        })
    }

    /// Drop a session's state, returning the tombstone for its peers.
    pub fn remove(&mut self, session_id: Uuid) -> Option<AwarenessUpdate> {
        self.states.remove(&session_id).map(|stored| {
            AwarenessUpdate::single(AwarenessEntry {
                client_id: session_id,
                clock: stored.clock + 1,
                state: None,
            })
        })
    }

    /// Every live record, for a session that just joined.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let entries = self
            .states
            .iter()
            .filter_map(|(id, stored)| {
                stored.record.as_ref().map(|record| AwarenessEntry {
                    client_id: *id,
                    clock: stored.clock,
                    state: Some(record.clone()),
                })
            })
            .collect();
        AwarenessUpdate { entries }
    }

    pub fn get(&self, session_id: &Uuid) -> Option<&PresenceRecord> {
        self.states.get(session_id).and_then(|s| s.record.as_ref())
    }

    /// Number of sessions with a live record.
    pub fn len(&self) -> usize {
        self.states.values().filter(|s| s.record.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ───────────────────────────────────────────────────────────────────
// Client side: view of remote peers
// ───────────────────────────────────────────────────────────────────

/// Change observed by a [`PresenceView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwarenessEvent {
    PeerState { peer_id: Uuid, record: PresenceRecord },
    PeerRemoved { peer_id: Uuid },
}

#[derive(Debug, Clone)]
struct RemotePeer {
    clock: u64,
    record: PresenceRecord,
    last_update: Instant,
}

/// A session's view of its peers' presence.
pub struct PresenceView {
    local_id: Option<Uuid>,
    peers: HashMap<Uuid, RemotePeer>,
    /// Clock of the last removal per peer, so late updates cannot resurrect it
    removed: HashMap<Uuid, u64>,
    idle_timeout: Duration,
}

impl PresenceView {
    pub fn new() -> Self {
        Self {
            local_id: None,
            peers: HashMap::new(),
            removed: HashMap::new(),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Our own session id; entries about ourselves are ignored.
    pub fn set_local_id(&mut self, id: Uuid) {
        self.local_id = Some(id);
    }

    pub fn local_id(&self) -> Option<Uuid> {
        self.local_id
    }

    /// Apply an update, returning the changes it caused.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> Vec<AwarenessEvent> {
        let mut events = Vec::new();
        for entry in &update.entries {
            if Some(entry.client_id) == self.local_id {
                continue;
            }
            let known = self
                .peers
                .get(&entry.client_id)
                .map(|p| p.clock)
                .or_else(|| self.removed.get(&entry.client_id).copied());
            if known.is_some_and(|clock| entry.clock <= clock) {
                continue;
            }

            match &entry.state {
                Some(record) => {
                    self.removed.remove(&entry.client_id);
                    self.peers.insert(
                        entry.client_id,
                        RemotePeer {
                            clock: entry.clock,
                            record: record.clone(),
                            last_update: Instant::now(),
                        },
                    );
                    events.push(AwarenessEvent::PeerState {
                        peer_id: entry.client_id,
                        record: record.clone(),
                    });
                }
                None => {
                    self.removed.insert(entry.client_id, entry.clock);
                    if self.peers.remove(&entry.client_id).is_some() {
                        events.push(AwarenessEvent::PeerRemoved { peer_id: entry.client_id });
                    }
                }
            }
        }
        events
    }

    pub fn peer(&self, id: &Uuid) -> Option<&PresenceRecord> {
        self.peers.get(id).map(|p| &p.record)
    }

    pub fn peer_ids(&self) -> Vec<Uuid> {
        self.peers.keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Forget peers that have not updated within the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_update.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl Default for PresenceView {
    fn default() -> Self {
        Self::new()
    }
}
