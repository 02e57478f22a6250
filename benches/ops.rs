//! Operation benchmarks for hybridkv
//!
//! - Single-threaded upsert, read, mixed and RMW workloads over an in-memory store
//! - Multi-threaded upserts on disjoint keys
//! - Variable-size values through the object log
//! - Checkpoint latency on a file-backed store

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::*;
use rand::rngs::StdRng;

use hybridkv::checkpoint::CheckpointType;
use hybridkv::codec::RawBytes;
use hybridkv::device::{FileSystemDisk, NullDisk};
use hybridkv::store::{FasterKv, FasterKvConfig, UpdateFn};

const NUM_KEYS: u64 = 100_000;

/// Create a store over NullDisk with everything resident
fn create_store() -> Arc<FasterKv<u64, u64, NullDisk>> {
    let config = FasterKvConfig::new(1 << 18, 1 << 28).with_page_size_bits(22);
    Arc::new(FasterKv::new(config, NullDisk::new()).unwrap())
}

fn populated_store() -> Arc<FasterKv<u64, u64, NullDisk>> {
    let store = create_store();
    let mut session = store.start_session().unwrap();
    for i in 0..NUM_KEYS {
        session.upsert(&i, &(i * 10));
    }
    store
}

fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert");
    group.throughput(Throughput::Elements(1));

    let store = create_store();
    let mut session = store.start_session().unwrap();
    let mut key = 0u64;

    group.bench_function("sequential", |b| {
        b.iter(|| {
            let status = session.upsert(black_box(&(key % NUM_KEYS)), black_box(&key));
            key += 1;
            status
        })
    });

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    group.throughput(Throughput::Elements(1));

    let store = populated_store();
    let mut session = store.start_session().unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    group.bench_function("random", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..NUM_KEYS);
            session.read(black_box(&key))
        })
    });

    group.finish();
}

/// 50% reads, 50% upserts
fn bench_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_50_50");
    group.throughput(Throughput::Elements(1));

    let store = populated_store();
    let mut session = store.start_session().unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    group.bench_function("random_ops", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..NUM_KEYS);
            if rng.gen_bool(0.5) {
                let _ = session.read(black_box(&key));
            } else {
                let _ = session.upsert(black_box(&key), black_box(&(key * 100)));
            }
        })
    });

    group.finish();
}

fn bench_rmw(c: &mut Criterion) {
    let mut group = c.benchmark_group("rmw");
    group.throughput(Throughput::Elements(1));

    let store = populated_store();
    let mut session = store.start_session().unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let mut add = UpdateFn::new(1u64, |v: &mut u64| *v = v.wrapping_add(1));

    group.bench_function("increment", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..NUM_KEYS);
            session.rmw(black_box(&key), &mut add)
        })
    });

    group.finish();
}

fn bench_concurrent_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_upsert");

    for threads in [1u64, 2, 4] {
        group.throughput(Throughput::Elements(threads));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let store = create_store();
            b.iter_custom(|iters| {
                let start = Instant::now();
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let store = Arc::clone(&store);
                        thread::spawn(move || {
                            let mut session = store.start_session().unwrap();
                            for i in 0..iters {
                                let key = t << 32 | (i % NUM_KEYS);
                                black_box(session.upsert(&key, &i));
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    let _ = handle.join();
                }
                start.elapsed()
            })
        });
    }

    group.finish();
}

fn bench_large_values(c: &mut Criterion) {
    let mut group = c.benchmark_group("large_value");

    for size in [1024usize, 16 * 1024] {
        let config = FasterKvConfig::new(1 << 14, 1 << 26).with_page_size_bits(20);
        let store = Arc::new(
            FasterKv::<u64, RawBytes, _>::with_object_log(config, NullDisk::new(), Arc::new(NullDisk::new()))
                .unwrap(),
        );
        let mut session = store.start_session().unwrap();
        let mut rng = StdRng::seed_from_u64(size as u64);
        let mut bytes = vec![0u8; size];
        rng.fill_bytes(&mut bytes);
        let value = RawBytes::from(bytes);
        let mut key = 0u64;

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("upsert", size), &size, |b, _| {
            b.iter(|| {
                let status = session.upsert(black_box(&(key % 1_000)), black_box(&value));
                key += 1;
                status
            })
        });
        group.bench_with_input(BenchmarkId::new("read", size), &size, |b, _| {
            b.iter(|| session.read(black_box(&rng.gen_range(0..key.min(1_000)))))
        });
    }

    group.finish();
}

fn bench_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint");
    let dir = tempfile::tempdir().unwrap();

    for kind in [CheckpointType::Snapshot, CheckpointType::FoldOver] {
        let path = dir.path().join(kind.as_str());
        let config = FasterKvConfig::new(1 << 16, 1 << 26)
            .with_page_size_bits(20)
            .with_checkpoint_dir(path.join("checkpoints"));
        std::fs::create_dir_all(&path).unwrap();
        let device = FileSystemDisk::single_file(path.join("hlog.dat")).unwrap();
        let store = Arc::new(FasterKv::<u64, u64, _>::new(config, device).unwrap());
        let mut session = store.start_session().unwrap();
        for i in 0..NUM_KEYS {
            session.upsert(&i, &i);
        }

        group.bench_function(kind.as_str(), |b| {
            b.iter(|| {
                session.upsert(&0, &1);
                store.take_full_checkpoint(kind).unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(
    name = basic_benches;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = bench_upsert, bench_read, bench_mixed, bench_rmw
);

criterion_group!(
    name = concurrent_benches;
    config = Criterion::default().sample_size(20);
    targets = bench_concurrent_upsert
);

criterion_group!(
    name = storage_benches;
    config = Criterion::default().sample_size(10);
    targets = bench_large_values, bench_checkpoint
);

criterion_main!(basic_benches, concurrent_benches, storage_benches);
