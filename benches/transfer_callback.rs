//! Criterion benchmarks for the transfer callback hot path.
//!
//! The callback runs once per completed chunk on the driver's thread and has
//! to finish well inside one chunk period. These benchmarks measure:
//! - Append into the ring for common chunk sizes
//! - Accumulate for the same sizes
//! - Append with a drain thread competing for the ring
//!
//! Run with: cargo bench --bench transfer_callback

use std::hint::black_box;
use std::io;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daq_transfer::{
    OwnedBufferPair, Pipeline, PipelineConfig, RampSource, Sample, SampleSource, SlotId,
    StorageSink, TransferMode,
};

const CHUNK_SIZES: [(&str, usize); 4] = [
    ("1k", 1024),
    ("4k", 4096),
    ("16k", 16 * 1024),
    ("64k", 64 * 1024),
];

/// Sink that accepts and discards everything.
struct NullSink;

impl StorageSink for NullSink {
    fn append(&mut self, samples: &[Sample]) -> io::Result<usize> {
        Ok(samples.len())
    }

    fn describe(&self) -> String {
        "null".to_string()
    }
}

fn filled_buffers(len: usize) -> OwnedBufferPair {
    let mut buffers = OwnedBufferPair::new(len);
    let mut source = RampSource::default();
    for slot in [SlotId::First, SlotId::Second] {
        source.fill(buffers.slot_mut(slot));
    }
    buffers
}

fn config(len: usize, mode: TransferMode, poll_ms: u64) -> PipelineConfig {
    PipelineConfig::builder()
        .buffer_size(len)
        .ring_chunks(16)
        .mode(mode)
        .poll_interval_ms(poll_ms)
        .build()
        .unwrap()
}

/// Append mode with an idle drain: pure copy cost.
fn transfer_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_append");

    for (name, len) in CHUNK_SIZES {
        let (mut pipeline, mut engine) = Pipeline::builder(config(len, TransferMode::Append, 3_600_000))
            .sink(NullSink)
            .start(filled_buffers(len))
            .unwrap();

        group.throughput(Throughput::Bytes((len * 2) as u64));
        group.bench_with_input(BenchmarkId::new("append", name), &len, |b, _| {
            b.iter(|| black_box(engine.on_chunk_complete().unwrap()));
        });

        pipeline.stop().unwrap();
    }

    group.finish();
}

/// Accumulate mode: one widening add per sample.
fn transfer_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_accumulate");

    for (name, len) in CHUNK_SIZES {
        let (mut pipeline, mut engine) = Pipeline::builder(config(len, TransferMode::Accumulate, 10))
            .start(filled_buffers(len))
            .unwrap();

        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("accumulate", name), &len, |b, _| {
            b.iter(|| black_box(engine.on_chunk_complete().unwrap()));
        });

        pipeline.stop().unwrap();
    }

    group.finish();
}

/// Append mode while the drain thread copies out of the ring every
/// millisecond.
fn transfer_with_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_with_drain");
    group.measurement_time(Duration::from_secs(5));

    let len = 16 * 1024;
    let (mut pipeline, mut engine) = Pipeline::builder(config(len, TransferMode::Append, 1))
        .sink(NullSink)
        .start(filled_buffers(len))
        .unwrap();

    group.throughput(Throughput::Bytes((len * 2) as u64));
    group.bench_function("append_16k", |b| {
        b.iter(|| black_box(engine.on_chunk_complete().unwrap()));
    });

    pipeline.stop().unwrap();
    group.finish();
}

criterion_group!(
    benches,
    transfer_append,
    transfer_accumulate,
    transfer_with_drain
);
criterion_main!(benches);
