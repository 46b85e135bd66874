//! Benchmarks for the storage core.
//!
//! Run with: cargo bench --package lutra-holt
//!
//! ## Benchmark Categories
//!
//! - **Append**: sustained single-series write throughput
//! - **Scan**: full-range forward reads through the merged iterator
//! - **Aggregate**: rollup-based aggregation over a multi-level tree

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use holt::{AggregateFn, BlockStore, ExtentsList, MemoryBlockStore, ReadStatus};
use std::sync::Arc;

const POINTS: u64 = 100_000;

fn walk_value(state: &mut u64) -> f64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    f64::from_bits(0x3FF0000000000000 | (*state >> 12))
}

fn build_series(points: u64) -> ExtentsList {
    let bstore: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
    let mut list = ExtentsList::new(1, Vec::new(), bstore);
    let mut state = 0xDEADBEEFu64;
    for ts in 0..points {
        list.append(ts, walk_value(&mut state)).expect("append");
    }
    list
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(POINTS));
    group.sample_size(10);
    group.bench_function("append_100k", |b| {
        b.iter(|| build_series(black_box(POINTS)))
    });
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let list = build_series(POINTS);
    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Elements(POINTS));
    group.bench_function("scan_forward_100k", |b| {
        b.iter(|| {
            let mut scanner = list.search(0, POINTS).expect("search");
            let mut ts = [0u64; 1024];
            let mut xs = [0f64; 1024];
            let mut total = 0usize;
            loop {
                let (status, n) = scanner.read(&mut ts, &mut xs).expect("read");
                total += n;
                if status == ReadStatus::NoData {
                    break;
                }
            }
            black_box(total)
        })
    });
    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let list = build_series(POINTS);
    let mut group = c.benchmark_group("aggregate");
    group.bench_function("sum_100k", |b| {
        b.iter(|| {
            let mut scanner = list
                .aggregate(0, POINTS, AggregateFn::Sum)
                .expect("aggregate");
            let mut ts = [0u64];
            let mut xs = [0f64];
            scanner.read(&mut ts, &mut xs).expect("read");
            black_box(xs[0])
        })
    });
    group.finish();
}

criterion_group!(benches, bench_append, bench_scan, bench_aggregate);
criterion_main!(benches);
