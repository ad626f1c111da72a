//! Payload codec benchmarks for mergeline
//!
//! Run with: cargo bench
//!
//! Measures the hot read-path decisions: recognizing the one-byte tombstone
//! sentinel without touching the decompressor, and gzip round-trips at
//! realistic payload sizes.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mergeline::codec::{is_tombstone, tombstone_payload, GzipPayloadCodec, PayloadCodec};

fn sample_payload(size: usize) -> String {
    let entry = r#"{"field":"value","count":12345},"#;
    let mut text = String::with_capacity(size + entry.len());
    while text.len() < size {
        text.push_str(entry);
    }
    text.truncate(size);
    text
}

/// Benchmark sentinel detection on both payload shapes
fn bench_sentinel_detection(c: &mut Criterion) {
    let sentinel = tombstone_payload();
    let real = Bytes::from(sample_payload(1_000).into_bytes());

    c.bench_function("is_tombstone_sentinel", |b| {
        b.iter(|| is_tombstone(black_box(&sentinel)))
    });
    c.bench_function("is_tombstone_real_payload", |b| {
        b.iter(|| is_tombstone(black_box(&real)))
    });
}

/// Benchmark compression at different payload sizes
fn bench_compress(c: &mut Criterion) {
    let codec = GzipPayloadCodec;
    let mut group = c.benchmark_group("compress_by_size");

    for size in [256, 1_024, 16_384, 262_144].iter() {
        let text = sample_payload(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| codec.compress(black_box(&text)).unwrap())
        });
    }

    group.finish();
}

/// Benchmark decompression at different payload sizes
fn bench_decompress(c: &mut Criterion) {
    let codec = GzipPayloadCodec;
    let mut group = c.benchmark_group("decompress_by_size");

    for size in [256, 1_024, 16_384, 262_144].iter() {
        let compressed = codec.compress(&sample_payload(*size)).unwrap();
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| codec.decompress(black_box(&compressed)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sentinel_detection,
    bench_compress,
    bench_decompress
);
criterion_main!(benches);
