//! Performance benchmarks for the hot paths of the stream SDK

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use stream_ws_sdk::{
    data::*,
    dedup::DedupBuffer,
    events::EventDispatcher,
    protocol::{FrameCodec, JsonFrameCodec, OutboundFrame},
    subscription::{diff, SubscriptionLedger},
};

// Benchmark frame decoding
fn bench_decode_update(c: &mut Criterion) {
    let codec = JsonFrameCodec::new();
    let frame = r#"{
        "type": "PRICE_UPDATE",
        "topic": "AAPL",
        "id": "evt-1029384",
        "sequence": 1029384,
        "payload": {"price": 189.52, "volume": 120, "change": -0.34}
    }"#;

    c.bench_function("decode_update", |b| {
        b.iter(|| {
            let _ = codec.decode(black_box(frame));
        })
    });
}

fn bench_decode_stock_ticker(c: &mut Criterion) {
    let codec = JsonFrameCodec::stock_ticker();
    let frame = r#"{
        "type": "STOCK_UPDATE",
        "id": 77,
        "data": {"stockData": {"stockCode": "005930", "currentPrice": 71000, "changeRate": 1.2}}
    }"#;

    c.bench_function("decode_stock_ticker", |b| {
        b.iter(|| {
            let _ = codec.decode(black_box(frame));
        })
    });
}

fn bench_encode_subscribe(c: &mut Criterion) {
    let codec = JsonFrameCodec::new();
    let mut group = c.benchmark_group("encode_subscribe");

    for size in [1, 10, 100].iter() {
        let topics: Vec<Topic> = (0..*size).map(|i| Topic::new(format!("T{}", i)).unwrap()).collect();
        let frame = OutboundFrame::Subscribe(topics);
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| codec.encode(black_box(frame)))
        });
    }
    group.finish();
}

// Benchmark duplicate suppression
fn bench_dedup_admit(c: &mut Criterion) {
    let events: Vec<InboundEvent> = (0..2000)
        .map(|i| InboundEvent {
            id: Some(format!("evt-{}", i % 1500)),
            topic: Topic::new("AAPL").unwrap(),
            kind: "PRICE_UPDATE".to_string(),
            sequence: Some(i),
            payload: json!({"price": i}),
            received_at: Utc::now(),
        })
        .collect();

    c.bench_function("dedup_admit_2000", |b| {
        b.iter(|| {
            let mut buffer = DedupBuffer::new(1000);
            for event in &events {
                black_box(buffer.admit(event));
            }
        })
    });
}

// Benchmark subscription bookkeeping
fn bench_ledger_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_replay");

    for size in [10, 100, 1000].iter() {
        let topics: Vec<Topic> = (0..*size).map(|i| Topic::new(format!("T{}", i)).unwrap()).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &topics, |b, topics| {
            b.iter(|| {
                let mut ledger = SubscriptionLedger::new();
                ledger.desire(topics);
                black_box(ledger.begin_replay())
            })
        });
    }
    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let desired: BTreeSet<Topic> = (0..500).map(|i| Topic::new(format!("T{}", i)).unwrap()).collect();
    let confirmed: BTreeSet<Topic> = (250..750).map(|i| Topic::new(format!("T{}", i)).unwrap()).collect();

    c.bench_function("diff_500", |b| {
        b.iter(|| diff(black_box(&desired), black_box(&confirmed)))
    });
}

// Benchmark event dispatch
fn bench_dispatch(c: &mut Criterion) {
    let dispatcher = EventDispatcher::new();
    for _ in 0..10 {
        dispatcher.register_topic(
            Topic::new("AAPL").unwrap(),
            Arc::new(|event: &InboundEvent| {
                black_box(event);
            }),
        );
    }
    let event = InboundEvent {
        id: None,
        topic: Topic::new("AAPL").unwrap(),
        kind: "PRICE_UPDATE".to_string(),
        sequence: None,
        payload: json!({"price": 189.52}),
        received_at: Utc::now(),
    };
    let generation = dispatcher.gate().current();

    c.bench_function("dispatch_10_observers", |b| {
        b.iter(|| dispatcher.dispatch_event(generation, black_box(&event)))
    });
}

criterion_group!(
    benches,
    bench_decode_update,
    bench_decode_stock_ticker,
    bench_encode_subscribe,
    bench_dedup_admit,
    bench_ledger_replay,
    bench_diff,
    bench_dispatch
);
criterion_main!(benches);
