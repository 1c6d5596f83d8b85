//! Chunk Encoding Benchmarks
//!
//! Measures records/second for the transposed and row-wise encoders across
//! compression codecs, on a stream of similarly-shaped proto records (the
//! workload transposition is built for).
//!
//! ## Running Benchmarks
//!
//! ```bash
//! cargo bench -p pivotlog-chunk
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pivotlog_chunk::{
    ChunkEncoder, CompressorOptions, SimpleEncoder, TransposeEncoder,
};

/// A message with a varint, a fixed64, and a short string field, varied a
/// little per record so compression has real work to do.
fn sample_records(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let mut record = Vec::new();
            // field 1, varint
            record.push(0x08);
            record.push(0x04 + (i % 100) as u8);
            // field 2, fixed64
            record.push(0x11);
            record.extend_from_slice(&(i as u64).to_le_bytes());
            // field 3, string
            let payload = format!("user-{}", i % 1000);
            record.push(0x1a);
            record.push(payload.len() as u8);
            record.extend_from_slice(payload.as_bytes());
            record
        })
        .collect()
}

fn bench_transpose_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("transpose_encode");
    for count in [100usize, 1_000, 10_000] {
        let records = sample_records(count);
        group.throughput(Throughput::Elements(count as u64));
        for (name, options) in [
            ("uncompressed", CompressorOptions::uncompressed()),
            ("zstd", CompressorOptions::zstd(3)),
            ("lz4", CompressorOptions::lz4()),
        ] {
            group.bench_with_input(
                BenchmarkId::new(name, count),
                &records,
                |b, records| {
                    b.iter(|| {
                        let mut encoder = TransposeEncoder::new(options, 64 * 1024);
                        for record in records {
                            encoder.add_record(record).unwrap();
                        }
                        let mut chunk: Vec<u8> = Vec::new();
                        encoder.encode_and_close(&mut chunk).unwrap();
                        chunk
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_simple_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("simple_encode");
    for count in [1_000usize, 10_000] {
        let records = sample_records(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("zstd", count),
            &records,
            |b, records| {
                b.iter(|| {
                    let mut encoder = SimpleEncoder::new(CompressorOptions::zstd(3));
                    for record in records {
                        encoder.add_record(record).unwrap();
                    }
                    let mut chunk: Vec<u8> = Vec::new();
                    encoder.encode_and_close(&mut chunk).unwrap();
                    chunk
                });
            },
        );
    }
    group.finish();
}

fn bench_compression_ratio(c: &mut Criterion) {
    // Not a timing benchmark as such; reports how long encoding takes at
    // the sizes where the transposed layout starts paying off.
    let mut group = c.benchmark_group("transpose_vs_simple_size");
    let records = sample_records(10_000);
    group.bench_function("transpose_zstd_10k", |b| {
        b.iter(|| {
            let mut encoder = TransposeEncoder::new(CompressorOptions::zstd(3), 64 * 1024);
            for record in &records {
                encoder.add_record(record).unwrap();
            }
            let mut chunk: Vec<u8> = Vec::new();
            encoder.encode_and_close(&mut chunk).unwrap();
            chunk.len()
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_transpose_encode,
    bench_simple_encode,
    bench_compression_ratio
);
criterion_main!(benches);
