//! Integration tests for real-time presence synchronization.
//!
//! These tests start a real server and connect several clients, verifying
//! presence broadcast, late-joiner snapshots, removal on disconnect and
//! that a client cannot publish presence for another session.

use notesync_collab::awareness::{AwarenessEntry, AwarenessUpdate, CursorRange, PresenceRecord};
use notesync_collab::client::{SyncClient, SyncEvent};
use notesync_collab::config::ServerConfig;
use notesync_collab::protocol::SyncMessage;
use notesync_collab::server::SyncServer;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

/// Start a server on a free port, return it with the base URL.
async fn start_test_server() -> (SyncServer, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::new(ServerConfig {
        broadcast_capacity: 64,
        ..ServerConfig::default()
    });
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, format!("ws://{addr}/notes"))
}

/// Connect and wait for the initial sync, returning the client and its events.
async fn connect_client(url: &str, doc: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::connect(url, doc).await.unwrap();
    let events = client.take_event_rx().unwrap();
    timeout(Duration::from_secs(2), client.wait_synced())
        .await
        .expect("sync timed out")
        .unwrap();
    (client, events)
}

/// Wait for the first event matching `pred`, skipping others.
async fn next_matching(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> Option<SyncEvent> {
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn wait_for_presence(server: &SyncServer, doc: &str, count: usize) {
    for _ in 0..100 {
        if let Some(entry) = server.registry().get(doc).await {
            if entry.awareness().len() == count {
                return;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("presence count on '{doc}' never reached {count}");
}

#[tokio::test]
async fn test_presence_broadcast_to_peer() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = connect_client(&url, "doc").await;
    let (bob, mut bob_events) = connect_client(&url, "doc").await;

    let record = PresenceRecord::named("Alice")
        .with_color(alice.peer_info().color.clone())
        .with_cursor(2, 7);
    alice.set_presence(Some(record.clone())).await.unwrap();

    let event = next_matching(&mut bob_events, |e| matches!(e, SyncEvent::PeerState { .. })).await;
    match event {
        Some(SyncEvent::PeerState { peer_id, record: received }) => {
            assert_eq!(peer_id, alice.id());
            assert_eq!(received, record);
        }
        other => panic!("expected PeerState, got {other:?}"),
    }
    assert_eq!(
        bob.peer(&alice.id()).and_then(|r| r.cursor),
        Some(CursorRange { anchor: 2, head: 7 })
    );
}

#[tokio::test]
async fn test_cursor_updates_replace_previous() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = connect_client(&url, "doc").await;
    let (bob, mut bob_events) = connect_client(&url, "doc").await;

    for head in [1, 2, 3] {
        alice
            .set_presence(Some(PresenceRecord::named("Alice").with_cursor(0, head)))
            .await
            .unwrap();
    }

    let last = next_matching(&mut bob_events, |e| {
        matches!(e, SyncEvent::PeerState { record, .. } if record.cursor.map(|c| c.head) == Some(3))
    })
    .await;
    assert!(last.is_some());
    assert_eq!(bob.peer(&alice.id()).and_then(|r| r.cursor).map(|c| c.head), Some(3));
    assert_eq!(bob.peer_ids(), vec![alice.id()]);
}

#[tokio::test]
async fn test_late_joiner_receives_snapshot() {
    let (server, url) = start_test_server().await;
    let (alice, _alice_events) = connect_client(&url, "doc").await;
    alice
        .set_presence(Some(PresenceRecord::named("Alice").with_field("status", "typing")))
        .await
        .unwrap();
    wait_for_presence(&server, "doc", 1).await;

    let (carol, _carol_events) = connect_client(&url, "doc").await;
    let mut seen = None;
    for _ in 0..100 {
        seen = carol.peer(&alice.id());
        if seen.is_some() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let record = seen.expect("late joiner should see existing presence");
    assert_eq!(record.fields.get("status").map(String::as_str), Some("typing"));
}

#[tokio::test]
async fn test_disconnect_removes_presence() {
    let (server, url) = start_test_server().await;
    let (alice, _alice_events) = connect_client(&url, "doc").await;
    let (bob, mut bob_events) = connect_client(&url, "doc").await;

    alice.set_presence(Some(PresenceRecord::named("Alice"))).await.unwrap();
    assert!(next_matching(&mut bob_events, |e| matches!(e, SyncEvent::PeerState { .. })).await.is_some());

    let alice_id = alice.id();
    alice.disconnect().await.unwrap();

    let removed = next_matching(&mut bob_events, |e| matches!(e, SyncEvent::PeerRemoved { .. })).await;
    assert_eq!(removed, Some(SyncEvent::PeerRemoved { peer_id: alice_id }));
    assert!(bob.peer(&alice_id).is_none());
    wait_for_presence(&server, "doc", 0).await;
}

#[tokio::test]
async fn test_presence_does_not_touch_document() {
    let (server, url) = start_test_server().await;
    let (alice, _alice_events) = connect_client(&url, "doc").await;
    let (bob, mut bob_events) = connect_client(&url, "doc").await;

    alice.set_presence(Some(PresenceRecord::named("Alice"))).await.unwrap();
    assert!(next_matching(&mut bob_events, |e| matches!(e, SyncEvent::PeerState { .. })).await.is_some());

    assert_eq!(bob.content(), "");
    let entry = server.registry().get("doc").await.unwrap();
    assert!(entry.document().is_empty());
}

#[tokio::test]
async fn test_forged_presence_is_dropped() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = connect_client(&url, "doc").await;
    let (bob, mut bob_events) = connect_client(&url, "doc").await;

    let victim = Uuid::new_v4();
    let forged = AwarenessUpdate::single(AwarenessEntry {
        client_id: victim,
        clock: 1,
        state: Some(PresenceRecord::named("Not Alice")),
    });
    alice
        .send_raw(SyncMessage::awareness(alice.id(), &forged).unwrap().encode().unwrap())
        .await
        .unwrap();
    alice.set_presence(Some(PresenceRecord::named("Alice"))).await.unwrap();

    let event = next_matching(&mut bob_events, |e| matches!(e, SyncEvent::PeerState { .. })).await;
    assert!(matches!(event, Some(SyncEvent::PeerState { peer_id, .. }) if peer_id == alice.id()));
    assert!(bob.peer(&victim).is_none());
    assert_eq!(bob.peer_ids(), vec![alice.id()]);
}
