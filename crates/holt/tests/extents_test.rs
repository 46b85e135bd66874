//! End-to-end scan and aggregation tests for the extents collection.

use holt::{
    AggregateFn, BlockStore, ExtentsList, MemoryBlockStore, PointScanner, ReadStatus, Rollup,
    RollupScanner, Timestamp, FANOUT,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn memstore() -> Arc<dyn BlockStore> {
    Arc::new(MemoryBlockStore::new())
}

/// Deterministic xorshift walk; full-entropy mantissas defeat the XOR
/// codec, so leaves fill after a few hundred samples.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_value(&mut self) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        // A value in [1, 2) with random mantissa bits.
        f64::from_bits(0x3FF0000000000000 | (self.0 >> 12))
    }
}

fn drain(scanner: &mut dyn PointScanner, chunk: usize) -> Vec<(Timestamp, f64)> {
    let mut out = Vec::new();
    let mut ts = vec![0u64; chunk];
    let mut xs = vec![0f64; chunk];
    loop {
        let (status, n) = scanner.read(&mut ts, &mut xs).unwrap();
        out.extend(ts[..n].iter().copied().zip(xs[..n].iter().copied()));
        if status == ReadStatus::NoData {
            return out;
        }
    }
}

fn drain_rollups(scanner: &mut dyn RollupScanner, chunk: usize) -> Vec<Rollup> {
    let mut out = Vec::new();
    let mut ts = vec![0u64; chunk];
    let mut rows = vec![Rollup::new(); chunk];
    loop {
        let (status, n) = scanner.read(&mut ts, &mut rows).unwrap();
        out.extend_from_slice(&rows[..n]);
        if status == ReadStatus::NoData {
            return out;
        }
    }
}

fn identity_series(n: u64) -> ExtentsList {
    let mut list = ExtentsList::new(42, Vec::new(), memstore());
    for i in 0..n {
        list.append(i, i as f64).unwrap();
    }
    list
}

#[test]
fn test_forward_scan_full_range() {
    let list = identity_series(2000);
    let rows = drain(&mut *list.search(0, 2000).unwrap(), 256);
    assert_eq!(rows.len(), 2000);
    for (i, &(ts, x)) in rows.iter().enumerate() {
        assert_eq!(ts, i as u64);
        assert_eq!(x, i as f64);
    }
}

#[test]
fn test_backward_scan_full_range() {
    let list = identity_series(2000);
    // Backward scans take (end, begin]: ts 1999 down to 1.
    let rows = drain(&mut *list.search(1999, 0).unwrap(), 256);
    assert_eq!(rows.len(), 1999);
    assert_eq!(rows[0], (1999, 1999.0));
    assert_eq!(rows[1998], (1, 1.0));
    for pair in rows.windows(2) {
        assert!(pair[0].0 > pair[1].0);
    }
}

#[test]
fn test_chunked_read_small_buffers() {
    let list = identity_series(100);
    let mut scanner = list.search(0, 100).unwrap();
    let mut ts = [0u64; 17];
    let mut xs = [0f64; 17];
    let mut total = 0u64;
    let status = loop {
        let (status, n) = scanner.read(&mut ts, &mut xs).unwrap();
        for &t in &ts[..n] {
            assert_eq!(t, total);
            total += 1;
        }
        if status == ReadStatus::NoData {
            break status;
        }
    };
    assert_eq!(total, 100);
    assert_eq!(status, ReadStatus::NoData);
}

#[test]
fn test_split_scans_concatenate() {
    let list = identity_series(2000);
    let whole = drain(&mut *list.search(0, 2000).unwrap(), 100);
    for split in [1u64, 500, 1234, 1999] {
        let mut head = drain(&mut *list.search(0, split).unwrap(), 100);
        let tail = drain(&mut *list.search(split, 2000).unwrap(), 100);
        head.extend(tail);
        assert_eq!(head, whole, "split at {split}");
    }
}

#[test]
fn test_three_level_tree_aggregation() {
    let commits = Arc::new(AtomicU64::new(0));
    let counter = commits.clone();
    let bstore: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::with_commit_callback(Arc::new(
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )));
    let mut list = ExtentsList::new(42, Vec::new(), bstore);
    let mut walk = XorShift::new(0x9E3779B97F4A7C15);
    let mut values = Vec::new();
    while commits.load(Ordering::SeqCst) < (FANOUT * FANOUT) as u64 {
        let value = walk.next_value();
        list.append(values.len() as u64, value).unwrap();
        values.push(value);
    }
    assert!(values.len() > 100_000, "tree should span three levels");

    // Sum over everything equals the plain sum.
    let expected: f64 = values.iter().sum();
    let mut scanner = list.aggregate(0, 1_000_000, AggregateFn::Sum).unwrap();
    let mut ts = [0u64];
    let mut xs = [0f64];
    let (_, n) = scanner.read(&mut ts, &mut xs).unwrap();
    assert_eq!(n, 1);
    let diff = (xs[0] - expected).abs() / expected.abs();
    assert!(diff < 1e-9, "sum off by {diff}");
    assert_eq!(scanner.read(&mut ts, &mut xs).unwrap(), (ReadStatus::NoData, 0));

    // Max and count over a subrange are exact.
    let hi = values.len().min(600_000);
    let expected_max = values[2000..hi].iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut scanner = list.aggregate(2000, 600_000, AggregateFn::Max).unwrap();
    let (_, n) = scanner.read(&mut ts, &mut xs).unwrap();
    assert_eq!(n, 1);
    assert_eq!(xs[0], expected_max);

    let mut scanner = list.aggregate(2000, 600_000, AggregateFn::Cnt).unwrap();
    let (_, n) = scanner.read(&mut ts, &mut xs).unwrap();
    assert_eq!(n, 1);
    assert_eq!(xs[0], (hi - 2000) as f64);

    // First/last respect timestamp order in both scan directions.
    let mut scanner = list.aggregate(0, 1_000_000, AggregateFn::First).unwrap();
    scanner.read(&mut ts, &mut xs).unwrap();
    assert_eq!(xs[0], values[0]);
    let mut scanner = list.aggregate(999_999, 0, AggregateFn::Last).unwrap();
    scanner.read(&mut ts, &mut xs).unwrap();
    assert_eq!(xs[0], *values.last().unwrap());
}

#[test]
fn test_aggregate_matches_recomputation_on_partial_leaves() {
    let mut list = ExtentsList::new(42, Vec::new(), memstore());
    let mut walk = XorShift::new(7);
    let mut values = Vec::new();
    for i in 0..5000u64 {
        let value = walk.next_value();
        list.append(i, value).unwrap();
        values.push(value);
    }
    // A range that slices into leaves on both sides.
    let (lo, hi) = (137u64, 4879u64);
    let expected: f64 = values[lo as usize..hi as usize].iter().sum();
    let mut scanner = list.aggregate(lo, hi, AggregateFn::Sum).unwrap();
    let mut ts = [0u64];
    let mut xs = [0f64];
    let (_, n) = scanner.read(&mut ts, &mut xs).unwrap();
    assert_eq!(n, 1);
    assert!((xs[0] - expected).abs() / expected.abs() < 1e-9);

    let expected_min = values[lo as usize..hi as usize]
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    let mut scanner = list.aggregate(lo, hi, AggregateFn::Min).unwrap();
    let (_, n) = scanner.read(&mut ts, &mut xs).unwrap();
    assert_eq!(n, 1);
    assert_eq!(xs[0], expected_min);
}

#[test]
fn test_group_aggregate_fixed_bins() {
    let mut list = ExtentsList::new(42, Vec::new(), memstore());
    let mut walk = XorShift::new(11);
    let mut values = Vec::new();
    for i in 0..10_000u64 {
        let value = walk.next_value();
        list.append(i, value).unwrap();
        values.push(value);
    }

    let rows = drain_rollups(&mut *list.group_aggregate(0, 10_000, 1000).unwrap(), 4);
    assert_eq!(rows.len(), 10);
    for (ix, row) in rows.iter().enumerate() {
        assert_eq!(row.count, 1000);
        assert_eq!(row.first_time, ix as u64 * 1000);
        assert_eq!(row.last_time, ix as u64 * 1000 + 999);
        let expected: f64 = values[ix * 1000..(ix + 1) * 1000].iter().sum();
        assert!((row.sum - expected).abs() / expected.abs() < 1e-9, "bin {ix}");
    }

    // Offset range: bins are measured from `begin`.
    let rows = drain_rollups(&mut *list.group_aggregate(500, 9500, 1000).unwrap(), 4);
    assert_eq!(rows.len(), 9);
    assert_eq!(rows[0].first_time, 500);
    assert_eq!(rows[0].last_time, 1499);
    assert_eq!(rows[8].last_time, 9499);
    assert_eq!(rows.iter().map(|r| r.count).sum::<u64>(), 9000);
}

#[test]
fn test_group_aggregate_backward() {
    let mut list = ExtentsList::new(42, Vec::new(), memstore());
    for i in 0..10_000u64 {
        list.append(i, i as f64).unwrap();
    }
    let rows = drain_rollups(&mut *list.group_aggregate(9999, 0, 1000).unwrap(), 4);
    // Backward takes (0, 9999]; bins count down from 9999.
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0].last_time, 9999);
    assert_eq!(rows[0].count, 1000);
    assert_eq!(rows[9].count, 999);
    assert_eq!(rows.iter().map(|r| r.count).sum::<u64>(), 9999);
    for pair in rows.windows(2) {
        assert!(pair[0].first_time > pair[1].last_time);
    }
}

#[test]
fn test_scan_subranges_across_sealed_leaves() {
    let mut list = ExtentsList::new(42, Vec::new(), memstore());
    let mut walk = XorShift::new(23);
    let mut values = Vec::new();
    for i in 0..20_000u64 {
        let value = walk.next_value();
        list.append(i, value).unwrap();
        values.push(value);
    }
    for (lo, hi) in [(0u64, 1u64), (999, 1001), (5000, 15_000), (19_999, 20_000)] {
        let rows = drain(&mut *list.search(lo, hi).unwrap(), 97);
        assert_eq!(rows.len(), (hi - lo) as usize, "range {lo}..{hi}");
        for (off, &(ts, x)) in rows.iter().enumerate() {
            assert_eq!(ts, lo + off as u64);
            assert_eq!(x, values[(lo + off as u64) as usize]);
        }
    }
}
