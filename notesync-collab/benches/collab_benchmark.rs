use criterion::{criterion_group, criterion_main, Criterion};
use notesync_collab::awareness::{AwarenessEntry, AwarenessStates, AwarenessUpdate, PresenceRecord, PresenceView};
use notesync_collab::broadcast::BroadcastGroup;
use notesync_collab::document::{Mutation, ReplicatedDocument};
use notesync_collab::protocol::{PeerInfo, SyncMessage};
use std::hint::black_box;
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let origin = Uuid::new_v4();
    let update = vec![0u8; 64]; // Typical small keystroke update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(origin), black_box(update.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(Uuid::new_v4(), vec![0u8; 64]).encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_local_append(c: &mut Criterion) {
    c.bench_function("document_local_append", |b| {
        let doc = ReplicatedDocument::new("bench");
        b.iter(|| {
            black_box(doc.apply_local_change(&Mutation::append(black_box("x"))));
        })
    });
}

fn bench_remote_replay_1000(c: &mut Criterion) {
    let source = ReplicatedDocument::new("bench");
    let updates: Vec<Vec<u8>> = (0..1000)
        .map(|i| source.apply_local_change(&Mutation::append(format!("line {i}\n"))))
        .collect();

    c.bench_function("document_replay_1000_updates", |b| {
        b.iter(|| {
            let replica = ReplicatedDocument::new("bench");
            for update in &updates {
                replica.apply_remote_update(black_box(update)).unwrap();
            }
            black_box(replica.len());
        })
    });
}

fn bench_state_diff(c: &mut Criterion) {
    let server = ReplicatedDocument::new("bench");
    for i in 0..1000 {
        server.apply_local_change(&Mutation::append(format!("line {i}\n")));
    }
    let client = ReplicatedDocument::new("bench");
    client.load_snapshot(&server.encode_state()).unwrap();
    server.apply_local_change(&Mutation::append("one more"));
    let client_sv = client.state_vector();

    c.bench_function("document_diff_since_state_vector", |b| {
        b.iter(|| {
            black_box(server.encode_state_as_update(black_box(&client_sv)).unwrap());
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = PeerInfo::new(Uuid::new_v4(), format!("user-{i}"));
                    receivers.push(group.add_session(peer));
                }

                for i in 0..1000u64 {
                    group.broadcast(SyncMessage::update(Uuid::nil(), vec![i as u8; 64]));
                }
                black_box(receivers.len());
            });
        })
    });
}

fn bench_awareness_set_state(c: &mut Criterion) {
    let mut states = AwarenessStates::new();
    let id = Uuid::new_v4();
    let mut head = 0u32;

    c.bench_function("awareness_set_local_state", |b| {
        b.iter(|| {
            head = head.wrapping_add(1);
            let record = PresenceRecord::named("Alice").with_cursor(0, head);
            black_box(states.set_local_state(black_box(id), Some(record)));
        })
    });
}

fn bench_presence_view_apply_100(c: &mut Criterion) {
    let update = AwarenessUpdate {
        entries: (0..100)
            .map(|i| AwarenessEntry {
                client_id: Uuid::new_v4(),
                clock: 1,
                state: Some(PresenceRecord::named(format!("user-{i}")).with_cursor(i, i)),
            })
            .collect(),
    };

    c.bench_function("presence_view_apply_100_peers", |b| {
        b.iter(|| {
            let mut view = PresenceView::new();
            black_box(view.apply(black_box(&update)));
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_local_append,
    bench_remote_replay_1000,
    bench_state_diff,
    bench_broadcast_1000_messages,
    bench_awareness_set_state,
    bench_presence_view_apply_100,
);
criterion_main!(benches);
