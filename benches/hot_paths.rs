//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! Covers the per-record ingestion path (buffer append) and the per-flush
//! paths: segment encode/decode and manifest serialization.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use streamvault::streaming::manifest::{LevelManifest, ManifestEdit, ManifestWriter, SegmentDescriptor};
use streamvault::streaming::{
    InMemoryObjectStore, ManifestStore, ManualClock, Record, SegmentReader, SegmentWriter,
    WriteBufferConfig, WriteBufferManager,
};

fn records(count: usize, value_len: usize) -> Vec<Record> {
    (0..count)
        .map(|i| Record {
            epoch: 1,
            sequence: i as u64,
            key: format!("key:{:08}", i).into_bytes(),
            value: vec![b'x'; value_len],
        })
        .collect()
}

fn encode(records: &[Record]) -> Vec<u8> {
    let mut writer = SegmentWriter::new();
    for record in records {
        writer.write_record(record).unwrap();
    }
    writer.finish().unwrap()
}

fn bench_segment_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_encode");
    for value_len in [64, 1024] {
        let batch = records(1_000, value_len);
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_function(format!("1000_records_value_{}", value_len), |b| {
            b.iter(|| encode(black_box(&batch)))
        });
    }
    group.finish();
}

fn bench_segment_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_decode");
    let data = encode(&records(1_000, 64));
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("1000_records", |b| {
        b.iter(|| {
            SegmentReader::open(black_box(&data))
                .unwrap()
                .records()
                .unwrap()
        })
    });
    group.finish();
}

fn bench_buffer_append(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let config = WriteBufferConfig {
        cluster_name: "bench".to_string(),
        node_id: 0,
        max_size_bytes: usize::MAX,
        max_age: Duration::from_secs(3600),
        min_flush_interval: Duration::from_secs(3600),
        max_publish_attempts: 4,
    };

    let mut group = c.benchmark_group("buffer_append");
    group.throughput(Throughput::Elements(1));
    group.bench_function("value_64", |b| {
        b.iter_batched(
            || {
                let manager = WriteBufferManager::new(
                    config.clone(),
                    ManifestStore::new(Arc::new(InMemoryObjectStore::new()), "bench"),
                    Arc::new(ManualClock::new(0)),
                );
                runtime.block_on(manager.acquire(0, 1)).unwrap();
                manager
            },
            |manager| {
                for i in 0..100u32 {
                    manager
                        .append(0, i.to_be_bytes().to_vec(), vec![b'x'; 64])
                        .unwrap();
                }
                manager
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_manifest_apply(c: &mut Criterion) {
    let writer = ManifestWriter { node_id: 0, epoch: 1 };
    let mut base = LevelManifest::empty(0);
    for i in 0..256u64 {
        base = base.apply(&ManifestEdit::add(vec![descriptor(i)]), writer);
    }

    let mut group = c.benchmark_group("manifest");
    group.bench_function("apply_256_segments", |b| {
        let edit = ManifestEdit::add(vec![descriptor(10_000)]);
        b.iter(|| black_box(&base).apply(black_box(&edit), writer))
    });
    group.bench_function("serialize_256_segments", |b| {
        b.iter(|| serde_json::to_vec_pretty(black_box(&base)).unwrap())
    });
    group.finish();
}

fn descriptor(i: u64) -> SegmentDescriptor {
    SegmentDescriptor {
        segment_id: 0,
        key: format!("bench/segments/shard-00000/{:020}.seg", i),
        epoch: 1,
        min_key: b"a".to_vec(),
        max_key: b"z".to_vec(),
        record_count: 100,
        size_bytes: 4096,
        created_at_ms: 0,
        min_sequence: i * 100,
        max_sequence: i * 100 + 99,
    }
}

criterion_group!(
    benches,
    bench_segment_encode,
    bench_segment_decode,
    bench_buffer_append,
    bench_manifest_apply,
);
criterion_main!(benches);
