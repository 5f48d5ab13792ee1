use coedit_collab::broadcast::BroadcastGroup;
use coedit_collab::protocol::{ClientMessage, ServerMessage};
use coedit_collab::session::{DocumentSession, User};
use coedit_core::{CrdtEngine, CustomEngine, EngineKind};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use uuid::Uuid;

fn sample_insert() -> ClientMessage {
    let mut engine = CustomEngine::new("bench");
    for i in 0..10 {
        engine.local_insert('x', i).unwrap();
    }
    ClientMessage::insert(engine.local_insert('y', 5).unwrap().op)
}

fn bench_insert_encode(c: &mut Criterion) {
    let msg = sample_insert();
    c.bench_function("crdt_insert_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_insert_decode(c: &mut Criterion) {
    let encoded = sample_insert().encode().unwrap();
    c.bench_function("crdt_insert_decode", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_init_encode(c: &mut Criterion) {
    let mut session = DocumentSession::new("bench", EngineKind::Custom);
    for i in 0..10_000 {
        session.engine_mut().local_insert('x', i).unwrap();
    }
    for i in 0..20 {
        session.add_user(User::new(format!("user{i}"), format!("User {i}")));
    }

    c.bench_function("init_encode_10k_chars", |b| {
        b.iter(|| black_box(ServerMessage::init(session.init_state()).encode().unwrap()))
    });
}

fn bench_broadcast_raw(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let frame: Arc<str> = Arc::from(sample_insert().encode().unwrap());

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_peer(Uuid::new_v4()).await);
                }

                let count = group.broadcast_raw(None, black_box(frame.clone()));
                black_box(count);
            });
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let frame: Arc<str> = Arc::from(sample_insert().encode().unwrap());

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);
                let origin = Uuid::new_v4();

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_peer(Uuid::new_v4()).await);
                }

                for _ in 0..1000 {
                    group.broadcast_raw(Some(origin), black_box(frame.clone()));
                }
            });
        })
    });
}

fn bench_session_apply(c: &mut Criterion) {
    let mut source = CustomEngine::new("typist");
    let ops: Vec<_> = (0..1000).map(|i| source.local_insert('k', i).unwrap().op).collect();

    c.bench_function("session_apply_1000_inserts", |b| {
        b.iter(|| {
            let mut session = DocumentSession::new("bench", EngineKind::Custom);
            for op in &ops {
                session.touch();
                black_box(session.engine_mut().remote_insert(op));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_insert_encode,
    bench_insert_decode,
    bench_init_encode,
    bench_broadcast_raw,
    bench_broadcast_1000_messages,
    bench_session_apply
);
criterion_main!(benches);
