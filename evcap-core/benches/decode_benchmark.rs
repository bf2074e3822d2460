//! Benchmarks for the decode and commit path of both protocols.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use evcap_core::{
    DataExchange, FrameDecoder, Notifications, PackedDecoder, Producer, ProtocolDecoder,
    SessionConfig,
};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const CHUNK_SIZE: usize = 8192;

fn run_pipeline<D: ProtocolDecoder>(decoder: D, data: &[u8]) -> usize {
    let config = SessionConfig::new("bench");
    let exchange = Arc::new(DataExchange::new(Arc::clone(&config.exchange)));
    exchange.init(Notifications::new());

    let mut producer = Producer::new(
        decoder,
        Arc::clone(&config.packets),
        Arc::clone(&exchange),
        Arc::new(AtomicBool::new(true)),
        Arc::clone(&config.log),
    );

    let mut events = 0;
    for chunk in data.chunks(CHUNK_SIZE) {
        producer.process(chunk);
        while let Some(container) = exchange.try_get() {
            events += container.len();
        }
    }
    producer.flush();
    while let Some(container) = exchange.try_get() {
        events += container.len();
    }
    events
}

fn packed_data() -> Vec<u8> {
    let mut words: Vec<u16> = Vec::new();

    for i in 0..100_000u32 {
        // Timestamp
        words.push(0x8000 | (i & 0x7FFF) as u16);
        if i & 0x7FFF == 0x7FFF {
            // Wrap by one step
            words.push(0x7001);
        }
        // Row, column group and a dense ON group
        words.push(0x1000 | (i % 480) as u16);
        words.push(0x4000 | (i % 80) as u16);
        words.push(0x30FF);
    }

    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn frame_data() -> Vec<u8> {
    (0..200_000u32)
        .flat_map(|i| {
            let [hi, lo] = ((i * 7) as u16).to_be_bytes();
            [0x80 | (i % 128) as u8, ((i & 1) << 7) as u8 | (i % 127) as u8, hi, lo]
        })
        .collect()
}

fn packed_benchmark(c: &mut Criterion) {
    let data = packed_data();

    let mut group = c.benchmark_group("packed");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("synthetic_800k_pixels", |b| {
        b.iter(|| black_box(run_pipeline(PackedDecoder::default(), black_box(&data))))
    });
    group.finish();
}

fn frame_benchmark(c: &mut Criterion) {
    let data = frame_data();

    let mut group = c.benchmark_group("frame");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("synthetic_200k_frames", |b| {
        b.iter(|| black_box(run_pipeline(FrameDecoder::default(), black_box(&data))))
    });
    group.finish();
}

criterion_group!(benches, packed_benchmark, frame_benchmark);
criterion_main!(benches);
