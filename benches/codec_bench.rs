//! Hot-path benchmarks: event codec encode/decode and dedup tracking.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

use merklekv::dedup::DedupTracker;
use merklekv::event::{EventCodec, ReplicationEvent};
use merklekv::metrics::Metrics;

fn bench_codec(c: &mut Criterion) {
    let codec = EventCodec::new(307_200);
    let small = ReplicationEvent::value("user:12345", "node-a", 42, 1_700_000_000_000, "alice");
    let large = ReplicationEvent::value(
        "blob:1",
        "node-a",
        43,
        1_700_000_000_000,
        "x".repeat(64 * 1024),
    );
    let small_bytes = codec.encode(&small).unwrap();
    let large_bytes = codec.encode(&large).unwrap();

    c.bench_function("encode_small_event", |b| {
        b.iter(|| codec.encode(black_box(&small)).unwrap())
    });
    c.bench_function("encode_64k_event", |b| {
        b.iter(|| codec.encode(black_box(&large)).unwrap())
    });
    c.bench_function("decode_small_event", |b| {
        b.iter(|| codec.decode(black_box(&small_bytes)).unwrap())
    });
    c.bench_function("decode_64k_event", |b| {
        b.iter(|| codec.decode(black_box(&large_bytes)).unwrap())
    });
    c.bench_function("transport_roundtrip_small", |b| {
        b.iter(|| {
            let payload = codec.encode_transport(black_box(&small)).unwrap();
            codec.decode_transport(&payload).unwrap()
        })
    });
}

fn bench_dedup(c: &mut Criterion) {
    c.bench_function("dedup_mark_and_check_sequential", |b| {
        let tracker = DedupTracker::new(
            4096,
            1000,
            Duration::from_secs(3600),
            Arc::new(Metrics::new()),
        );
        let mut seq = 0u64;
        b.iter(|| {
            seq += 1;
            tracker.mark_seen("peer", seq);
            black_box(tracker.is_duplicate("peer", seq))
        })
    });

    c.bench_function("dedup_check_across_many_peers", |b| {
        let tracker = DedupTracker::new(
            4096,
            1000,
            Duration::from_secs(3600),
            Arc::new(Metrics::new()),
        );
        for peer in 0..500 {
            tracker.mark_seen(&format!("peer-{}", peer), 100);
        }
        let mut peer = 0usize;
        b.iter(|| {
            peer = (peer + 1) % 500;
            black_box(tracker.is_duplicate(&format!("peer-{}", peer), 100))
        })
    });
}

criterion_group!(benches, bench_codec, bench_dedup);
criterion_main!(benches);
