use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;

use chorus_state::dispatch::{self, Dispatcher, Event, Handler};
use chorus_state::error::ErrorSink;
use chorus_state::protocol::{ChangeItem, Frame};
use chorus_state::store::{PresenceStore, StateStore};

fn change_batch(size: usize) -> Vec<ChangeItem> {
    (0..size)
        .map(|i| ChangeItem::set(&format!("key{i}"), json!({"n": i, "tag": "bench"})))
        .collect()
}

fn bench_frame_encode(c: &mut Criterion) {
    let items: Vec<ChangeItem> = (0..10)
        .map(|i| ChangeItem::set(&format!("key{i}"), json!({"n": i})))
        .collect();

    c.bench_function("frame_encode_10_items", |b| {
        b.iter(|| {
            let frame = Frame::change_state(black_box(&items));
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let items: Vec<ChangeItem> = (0..10)
        .map(|i| ChangeItem::set(&format!("key{i}"), json!({"n": i})))
        .collect();
    let encoded = Frame::change_state(&items).encode().unwrap();

    c.bench_function("frame_decode_10_items", |b| {
        b.iter(|| {
            black_box(Frame::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_apply_batch_100(c: &mut Criterion) {
    let batch = change_batch(100);

    c.bench_function("apply_batch_100_fresh", |b| {
        b.iter(|| {
            let mut store = StateStore::new();
            black_box(store.apply_batch(black_box(&batch)));
        })
    });
}

fn bench_noop_batch_100(c: &mut Criterion) {
    let batch = change_batch(100);
    let mut store = StateStore::new();
    store.apply_batch(&batch);

    c.bench_function("apply_batch_100_noop", |b| {
        b.iter(|| {
            black_box(store.apply_batch(black_box(&batch)));
        })
    });
}

fn bench_presence_apply_100(c: &mut Criterion) {
    c.bench_function("presence_apply_100", |b| {
        b.iter(|| {
            let mut presence = PresenceStore::new();
            for i in 0..100 {
                presence.apply_status(&format!("agent{i}"), Some("online"));
            }
            black_box(presence.len());
        })
    });
}

fn bench_dispatcher_fanout_100(c: &mut Criterion) {
    let mut dispatcher = Dispatcher::new();
    for _ in 0..100 {
        let handler: Handler = Arc::new(|event| {
            black_box(event);
        });
        dispatcher.subscribe(chorus_state::Channel::ChangeSet, &handler, false);
    }
    let sink: ErrorSink = Arc::new(|_e| {});

    c.bench_function("dispatcher_fanout_100_handlers", |b| {
        b.iter(|| {
            let deliveries = dispatcher.live(black_box(&Event::ChangeSet));
            dispatch::run(deliveries, &sink);
        })
    });
}

fn bench_replay_events_1000(c: &mut Criterion) {
    let mut store = StateStore::new();
    store.apply_batch(&change_batch(1000));

    c.bench_function("replay_events_1000_keys", |b| {
        b.iter(|| {
            black_box(store.replay_events());
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_apply_batch_100,
    bench_noop_batch_100,
    bench_presence_apply_100,
    bench_dispatcher_fanout_100,
    bench_replay_events_1000,
);
criterion_main!(benches);
