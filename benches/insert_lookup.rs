//! Throughput check over the insert/lookup hot path, in the shape of the
//! teacher pack's own `kv_store_bench.rs`: a `benchmark_group` per concern,
//! `BenchmarkId` varying over dataset/key size. Not a TPC-B-style driver —
//! out of scope per spec.md — just enough to see regressions on the path
//! `Keymap::insert`/`Keymap::lookup` actually take.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use shardmap::{Keymap, ShardmapOptions};
use tempfile::NamedTempFile;

const RECLEN: usize = 32;

fn bench_options() -> ShardmapOptions {
    ShardmapOptions::new().with_reclen(RECLEN).with_tablebits(10).with_maxtablebits(16)
}

fn populated_store(size: usize) -> (NamedTempFile, Keymap) {
    let file = NamedTempFile::new().unwrap();
    let mut km = Keymap::create(file.path(), bench_options()).unwrap();
    for i in 0..size {
        let key = format!("key_{i:010}");
        km.insert(key.as_bytes(), &[(i % 256) as u8; RECLEN], false).unwrap();
    }
    (file, km)
}

fn bench_lookup_performance(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_performance");
    for size in [100usize, 1_000, 10_000].iter() {
        let (_file, mut km) = populated_store(*size);
        let test_key = format!("key_{:010}", size / 2);

        group.bench_with_input(BenchmarkId::new("single_key", size), size, |b, _| {
            b.iter(|| black_box(km.lookup(black_box(test_key.as_bytes())).unwrap()))
        });

        group.bench_with_input(BenchmarkId::new("random_keys", size), size, |b, &size| {
            let mut idx = 0usize;
            b.iter(|| {
                let key = format!("key_{:010}", idx % size);
                idx = idx.wrapping_add(1);
                black_box(km.lookup(black_box(key.as_bytes())).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_construction_performance(c: &mut Criterion) {
    let mut group = c.benchmark_group("construction_performance");
    for size in [100usize, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("construction", size), size, |b, &size| {
            b.iter(|| black_box(populated_store(size)))
        });
    }
    group.finish();
}

fn bench_key_length_impact(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_length_impact");
    for key_len in [8usize, 32, 64, 128, 255].iter() {
        let key_len = *key_len;
        let file = NamedTempFile::new().unwrap();
        let mut km = Keymap::create(file.path(), bench_options()).unwrap();
        let base = "a".repeat(key_len.saturating_sub(8));
        for i in 0..1000u32 {
            let key = format!("{base}{i:08}");
            km.insert(key.as_bytes(), &[0u8; RECLEN], false).unwrap();
        }
        let test_key = format!("{base}{:08}", 0u32);

        group.bench_with_input(BenchmarkId::new("lookup_by_key_length", &key_len), &key_len, |b, _| {
            b.iter(|| black_box(km.lookup(black_box(test_key.as_bytes())).unwrap()))
        });
    }
    group.finish();
}

fn bench_insert_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_throughput");
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            || {
                let file = NamedTempFile::new().unwrap();
                let km = Keymap::create(file.path(), bench_options()).unwrap();
                (file, km)
            },
            |(file, mut km)| {
                for i in 0..200u32 {
                    let key = format!("seq_{i:08}");
                    km.insert(black_box(key.as_bytes()), black_box(&[0u8; RECLEN]), false).unwrap();
                }
                file
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_lookup_performance, bench_construction_performance, bench_key_length_impact, bench_insert_throughput);
criterion_main!(benches);
