//! Fan-out relay to the sessions attached to one document.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! session gets an independent receiver that buffers up to `capacity`
//! messages; a session that falls further behind observes `Lagged` and is
//! caught up with a full-state update instead.
//!
//! Every session receives every relayed message, including its own. The
//! receiving side drops messages whose `origin` is itself.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{PeerInfo, SyncMessage};

/// Relay channel item.
pub type Relayed = Arc<SyncMessage>;

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_sessions: usize,
}

/// Atomic counters, so the relay hot path takes no lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// Session set and relay channel of one document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Relayed>,
    sessions: Mutex<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new group with the given per-session buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: Mutex::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a session and return its relay receiver.
    ///
    /// The receiver only sees messages sent after this call.
    pub fn add_session(&self, info: PeerInfo) -> broadcast::Receiver<Relayed> {
        let mut sessions = self.sessions.lock();
        sessions.insert(info.session_id, info);
        self.sender.subscribe()
    }

    /// Remove a session. Returns `None` if it was not attached.
    pub fn remove_session(&self, session_id: &Uuid) -> Option<PeerInfo> {
        self.sessions.lock().remove(session_id)
    }

    /// Relay a message to every subscribed session.
    ///
    /// Returns the number of receivers; zero when nobody is listening.
    pub fn broadcast(&self, msg: SyncMessage) -> usize {
        let count = self.sender.send(Arc::new(msg)).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `n` messages.
    pub fn record_lag(&self, n: u64) {
        self.atomic_stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.session_count() == 0
    }

    pub fn sessions(&self) -> Vec<PeerInfo> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn has_session(&self, session_id: &Uuid) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            active_sessions: self.session_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerInfo {
        PeerInfo::new(Uuid::new_v4(), name)
    }

    #[tokio::test]
    async fn test_add_remove_session() {
        let group = BroadcastGroup::new(16);
        let alice = peer("alice");
        let id = alice.session_id;

        let _rx = group.add_session(alice);
        assert_eq!(group.session_count(), 1);
        assert!(group.has_session(&id));

        assert!(group.remove_session(&id).is_some());
        assert!(group.is_empty());
        assert!(group.remove_session(&id).is_none());
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_receivers() {
        let group = BroadcastGroup::new(16);
        let alice = peer("alice");
        let origin = alice.session_id;
        let mut rx1 = group.add_session(alice);
        let mut rx2 = group.add_session(peer("bob"));
        let mut rx3 = group.add_session(peer("carol"));

        // Origin filtering is the receiver's job.
        let count = group.broadcast(SyncMessage::update(origin, vec![1, 2, 3]));
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.origin, origin);
            assert_eq!(msg.payload, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(SyncMessage::ping(Uuid::nil())), 0);
        assert_eq!(group.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver_observes_lag() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_session(peer("slow"));
        for i in 0..5u8 {
            group.broadcast(SyncMessage::update(Uuid::nil(), vec![i]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                group.record_lag(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().messages_lagged, 3);
    }

    #[tokio::test]
    async fn test_stats_and_capacity() {
        let group = BroadcastGroup::new(32);
        let _rx = group.add_session(peer("alice"));
        group.broadcast(SyncMessage::ping(Uuid::nil()));
        group.broadcast(SyncMessage::ping(Uuid::nil()));

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(group.capacity(), 32);
        assert_eq!(group.sessions().len(), 1);
    }
}
