//! Pull-based iterators over tree nodes.
//!
//! Every iterator exposes the same chunked contract: the caller supplies
//! output buffers and `read` returns `(status, n)`. [`ReadStatus::Ok`]
//! means the buffers may be offered again; [`ReadStatus::NoData`] is the
//! terminal end-of-stream, possibly with `n > 0` on the final call.
//! Failures are `Err` and also terminate the iterator. Iterators are never
//! restartable; construct a new one instead.
//!
//! Compositors ([`ChainScanner`], [`SuperblockScanner`], the aggregator
//! combinators) are themselves pull-iterators keeping a small per-child
//! cursor, so no coroutine machinery is needed anywhere in the read path.

use crate::error::{HoltError, Result};
use crate::store::{BlockStore, LogicAddr};
use crate::tree::leaf::LeafNode;
use crate::tree::superblock::SuperblockNode;
use crate::tree::{NodeSummary, ParamId, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;

/// Scan direction derived from the query range: forward if `begin < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// Ascending timestamps.
    Forward,
    /// Descending timestamps.
    Backward,
}

/// Direction implied by a `(begin, end)` pair.
pub fn direction_of(begin: Timestamp, end: Timestamp) -> ScanDirection {
    if begin < end {
        ScanDirection::Forward
    } else {
        ScanDirection::Backward
    }
}

/// Status of a chunked read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// More data may be available.
    Ok,
    /// End of stream. Terminal.
    NoData,
}

/// Iterator yielding `(timestamp, value)` pairs.
pub trait PointScanner {
    /// Copies up to `min(ts_out.len(), val_out.len())` pairs into the
    /// output buffers and returns the status plus the number written.
    fn read(&mut self, ts_out: &mut [Timestamp], val_out: &mut [f64])
        -> Result<(ReadStatus, usize)>;

    /// Scan direction of this iterator.
    fn direction(&self) -> ScanDirection;
}

/// Iterator yielding aggregated [`Rollup`] rows.
pub trait RollupScanner {
    /// Copies up to `min(ts_out.len(), out.len())` rows into the output
    /// buffers and returns the status plus the number written.
    fn read(&mut self, ts_out: &mut [Timestamp], out: &mut [Rollup])
        -> Result<(ReadStatus, usize)>;

    /// Scan direction of this iterator.
    fn direction(&self) -> ScanDirection;
}

/// Aggregate functions computable from a [`Rollup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    /// Number of samples.
    Cnt,
    /// Sum of values.
    Sum,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Value with the smallest timestamp.
    First,
    /// Value with the largest timestamp.
    Last,
}

impl AggregateFn {
    /// Projects the scalar this function selects out of a rollup.
    pub fn select(&self, rollup: &Rollup) -> f64 {
        match self {
            AggregateFn::Cnt => rollup.count as f64,
            AggregateFn::Sum => rollup.sum,
            AggregateFn::Min => rollup.min,
            AggregateFn::Max => rollup.max,
            AggregateFn::First => rollup.first,
            AggregateFn::Last => rollup.last,
        }
    }
}

/// Aggregation accumulator over a set of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rollup {
    /// Number of samples.
    pub count: u64,
    /// Sum of values.
    pub sum: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Timestamp of the smallest value.
    pub min_time: Timestamp,
    /// Timestamp of the largest value.
    pub max_time: Timestamp,
    /// Value with the smallest timestamp.
    pub first: f64,
    /// Value with the largest timestamp.
    pub last: f64,
    /// Smallest timestamp.
    pub first_time: Timestamp,
    /// Largest timestamp.
    pub last_time: Timestamp,
}

impl Rollup {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            min_time: Timestamp::MAX,
            max_time: 0,
            first: 0.0,
            last: 0.0,
            first_time: Timestamp::MAX,
            last_time: 0,
        }
    }

    /// Folds in a single sample. Works in either scan direction because
    /// `first`/`last` are tracked by timestamp, not arrival order.
    pub fn add(&mut self, ts: Timestamp, value: f64) {
        if self.count == 0 {
            self.first = value;
            self.first_time = ts;
            self.last = value;
            self.last_time = ts;
        } else {
            if ts < self.first_time {
                self.first = value;
                self.first_time = ts;
            }
            if ts > self.last_time {
                self.last = value;
                self.last_time = ts;
            }
        }
        self.count += 1;
        self.sum += value;
        if value < self.min {
            self.min = value;
            self.min_time = ts;
        }
        if value > self.max {
            self.max = value;
            self.max_time = ts;
        }
    }

    /// Merges another accumulator into this one.
    pub fn combine(&mut self, other: &Rollup) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        if other.first_time < self.first_time {
            self.first = other.first;
            self.first_time = other.first_time;
        }
        if other.last_time > self.last_time {
            self.last = other.last;
            self.last_time = other.last_time;
        }
        self.count += other.count;
        self.sum += other.sum;
        if other.min < self.min {
            self.min = other.min;
            self.min_time = other.min_time;
        }
        if other.max > self.max {
            self.max = other.max;
            self.max_time = other.max_time;
        }
    }

    /// Builds an accumulator from a sealed node's stored rollup.
    pub fn from_summary(summary: &NodeSummary) -> Self {
        Self {
            count: summary.count,
            sum: summary.sum,
            min: summary.min,
            max: summary.max,
            min_time: summary.min_time,
            max_time: summary.max_time,
            first: summary.first,
            last: summary.last,
            first_time: summary.tmin,
            last_time: summary.tmax,
        }
    }

    /// Representative timestamp of the row in the given scan direction.
    pub fn repr_time(&self, dir: ScanDirection) -> Timestamp {
        match dir {
            ScanDirection::Forward => self.first_time,
            ScanDirection::Backward => self.last_time,
        }
    }
}

impl Default for Rollup {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over an empty range; `begin == end` yields no rows by
/// definition, in either direction.
pub struct EmptyScanner {
    dir: ScanDirection,
}

impl EmptyScanner {
    /// Creates an iterator that immediately reports end-of-stream.
    pub fn new(dir: ScanDirection) -> Self {
        Self { dir }
    }
}

impl PointScanner for EmptyScanner {
    fn read(&mut self, _: &mut [Timestamp], _: &mut [f64]) -> Result<(ReadStatus, usize)> {
        Ok((ReadStatus::NoData, 0))
    }

    fn direction(&self) -> ScanDirection {
        self.dir
    }
}

/// Iterator over one leaf's samples.
///
/// Forward scans yield `min(begin, end) <= ts < max(begin, end)`; backward
/// scans invert the closed side: `min < ts <= max`, descending.
pub struct LeafScanner {
    ts: Vec<Timestamp>,
    xs: Vec<f64>,
    from: usize,
    to: usize,
    dir: ScanDirection,
}

impl LeafScanner {
    /// Decodes the leaf and positions the cursor on the requested range.
    pub fn new(node: &LeafNode, begin: Timestamp, end: Timestamp) -> Result<Self> {
        let dir = direction_of(begin, end);
        let min = begin.min(end);
        let max = begin.max(end);
        let (tmin, tmax) = node.timestamps();
        if node.count() == 0 || max < tmin || tmax < min {
            return Ok(Self {
                ts: Vec::new(),
                xs: Vec::new(),
                from: 0,
                to: 0,
                dir,
            });
        }
        let (mut ts, mut xs) = node.read_all()?;
        let (from, to) = match dir {
            ScanDirection::Forward => (
                ts.partition_point(|&t| t < begin),
                ts.partition_point(|&t| t < end),
            ),
            ScanDirection::Backward => {
                let from = ts.len() - ts.partition_point(|&t| t <= begin);
                let to = ts.len() - ts.partition_point(|&t| t <= end);
                ts.reverse();
                xs.reverse();
                (from, to)
            }
        };
        Ok(Self { ts, xs, from, to, dir })
    }

    /// Number of samples left to read.
    pub fn remaining(&self) -> usize {
        self.to - self.from
    }
}

impl PointScanner for LeafScanner {
    fn read(&mut self, ts_out: &mut [Timestamp], val_out: &mut [f64])
        -> Result<(ReadStatus, usize)>
    {
        let cap = ts_out.len().min(val_out.len());
        let n = self.remaining().min(cap);
        if n == 0 {
            return Ok((ReadStatus::NoData, 0));
        }
        ts_out[..n].copy_from_slice(&self.ts[self.from..self.from + n]);
        val_out[..n].copy_from_slice(&self.xs[self.from..self.from + n]);
        self.from += n;
        Ok((ReadStatus::Ok, n))
    }

    fn direction(&self) -> ScanDirection {
        self.dir
    }
}

/// Concatenation of iterators that already sit in scan order.
pub struct ChainScanner {
    scanners: VecDeque<Box<dyn PointScanner>>,
    dir: ScanDirection,
}

impl ChainScanner {
    /// Chains `scanners` in the order given.
    pub fn new(scanners: Vec<Box<dyn PointScanner>>, begin: Timestamp, end: Timestamp) -> Self {
        Self {
            scanners: scanners.into(),
            dir: direction_of(begin, end),
        }
    }
}

impl PointScanner for ChainScanner {
    fn read(&mut self, ts_out: &mut [Timestamp], val_out: &mut [f64])
        -> Result<(ReadStatus, usize)>
    {
        let cap = ts_out.len().min(val_out.len());
        let mut out = 0;
        while out < cap {
            let Some(cur) = self.scanners.front_mut() else {
                return Ok((ReadStatus::NoData, out));
            };
            let (status, n) = cur.read(&mut ts_out[out..cap], &mut val_out[out..cap])?;
            out += n;
            if status == ReadStatus::NoData {
                self.scanners.pop_front();
            }
        }
        Ok((ReadStatus::Ok, out))
    }

    fn direction(&self) -> ScanDirection {
        self.dir
    }
}

/// Cursor over a superblock's child list, shared by the scanner and the
/// aggregators. Children are visited in scan order; children whose time
/// bounds miss the query range are pruned without touching the store.
struct ChildCursor {
    begin: Timestamp,
    end: Timestamp,
    param_id: ParamId,
    bstore: Arc<dyn BlockStore>,
    refs: Vec<NodeSummary>,
    pos: isize,
    pending_addr: Option<LogicAddr>,
}

impl ChildCursor {
    fn over_children(
        refs: Vec<NodeSummary>,
        param_id: ParamId,
        begin: Timestamp,
        end: Timestamp,
        bstore: Arc<dyn BlockStore>,
    ) -> Self {
        let mut cursor = Self {
            begin,
            end,
            param_id,
            bstore,
            refs,
            pos: 0,
            pending_addr: None,
        };
        cursor.rewind();
        cursor
    }

    fn from_addr(
        addr: LogicAddr,
        param_id: ParamId,
        begin: Timestamp,
        end: Timestamp,
        bstore: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            begin,
            end,
            param_id,
            bstore,
            refs: Vec::new(),
            pos: 0,
            pending_addr: Some(addr),
        }
    }

    fn dir(&self) -> ScanDirection {
        direction_of(self.begin, self.end)
    }

    fn rewind(&mut self) {
        self.pos = match self.dir() {
            ScanDirection::Forward => 0,
            ScanDirection::Backward => self.refs.len() as isize - 1,
        };
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if let Some(addr) = self.pending_addr.take() {
            let node = SuperblockNode::load(&*self.bstore, addr, self.param_id)?;
            self.refs = node.children().to_vec();
            self.rewind();
        }
        Ok(())
    }

    /// Next child whose subtree intersects the query range.
    fn next_overlapping(&mut self) -> Result<Option<NodeSummary>> {
        self.ensure_loaded()?;
        let min = self.begin.min(self.end);
        let max = self.begin.max(self.end);
        loop {
            let entry = match self.dir() {
                ScanDirection::Forward => {
                    if self.pos as usize >= self.refs.len() {
                        return Ok(None);
                    }
                    let entry = self.refs[self.pos as usize];
                    self.pos += 1;
                    entry
                }
                ScanDirection::Backward => {
                    if self.pos < 0 {
                        return Ok(None);
                    }
                    let entry = self.refs[self.pos as usize];
                    self.pos -= 1;
                    entry
                }
            };
            if entry.overlaps(min, max) {
                return Ok(Some(entry));
            }
        }
    }
}

/// Iterator descending a superblock: overlapping children are visited in
/// scan order, leaves decode their samples, lower superblocks recurse.
pub struct SuperblockScanner {
    cursor: ChildCursor,
    cur: Option<Box<dyn PointScanner>>,
}

impl SuperblockScanner {
    /// Scanner over an in-memory child list (the open node of an extent).
    pub fn over_children(
        refs: Vec<NodeSummary>,
        param_id: ParamId,
        begin: Timestamp,
        end: Timestamp,
        bstore: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            cursor: ChildCursor::over_children(refs, param_id, begin, end, bstore),
            cur: None,
        }
    }

    /// Scanner over a sealed superblock; the block is read lazily on the
    /// first `read` call.
    pub fn from_addr(
        addr: LogicAddr,
        param_id: ParamId,
        begin: Timestamp,
        end: Timestamp,
        bstore: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            cursor: ChildCursor::from_addr(addr, param_id, begin, end, bstore),
            cur: None,
        }
    }

    fn next_child(&mut self) -> Result<Option<Box<dyn PointScanner>>> {
        let Some(entry) = self.cursor.next_overlapping()? else {
            return Ok(None);
        };
        let (begin, end) = (self.cursor.begin, self.cursor.end);
        if entry.level == 0 {
            let leaf = LeafNode::load(&*self.cursor.bstore, entry.addr, self.cursor.param_id)?;
            Ok(Some(Box::new(LeafScanner::new(&leaf, begin, end)?)))
        } else {
            Ok(Some(Box::new(SuperblockScanner::from_addr(
                entry.addr,
                self.cursor.param_id,
                begin,
                end,
                self.cursor.bstore.clone(),
            ))))
        }
    }
}

impl PointScanner for SuperblockScanner {
    fn read(&mut self, ts_out: &mut [Timestamp], val_out: &mut [f64])
        -> Result<(ReadStatus, usize)>
    {
        let cap = ts_out.len().min(val_out.len());
        let mut out = 0;
        while out < cap {
            if self.cur.is_none() {
                match self.next_child()? {
                    Some(scanner) => self.cur = Some(scanner),
                    None => return Ok((ReadStatus::NoData, out)),
                }
            }
            let scanner = self.cur.as_mut().expect("scanner installed above");
            let (status, n) = scanner.read(&mut ts_out[out..cap], &mut val_out[out..cap])?;
            out += n;
            if status == ReadStatus::NoData {
                self.cur = None;
            }
        }
        Ok((ReadStatus::Ok, out))
    }

    fn direction(&self) -> ScanDirection {
        self.cursor.dir()
    }
}

/// Single-row aggregator with a precomputed value; used when a subtree's
/// stored rollup can stand in for the descent.
pub struct ValueRollup {
    rollup: Rollup,
    dir: ScanDirection,
    used: bool,
}

impl ValueRollup {
    /// Wraps a precomputed rollup.
    pub fn new(rollup: Rollup, dir: ScanDirection) -> Self {
        Self {
            rollup,
            dir,
            used: false,
        }
    }
}

impl RollupScanner for ValueRollup {
    fn read(&mut self, ts_out: &mut [Timestamp], out: &mut [Rollup])
        -> Result<(ReadStatus, usize)>
    {
        if ts_out.is_empty() || out.is_empty() {
            return Err(HoltError::BadArg);
        }
        if self.used {
            return Ok((ReadStatus::NoData, 0));
        }
        self.used = true;
        ts_out[0] = self.rollup.repr_time(self.dir);
        out[0] = self.rollup;
        Ok((ReadStatus::Ok, 1))
    }

    fn direction(&self) -> ScanDirection {
        self.dir
    }
}

/// Single-row aggregate over one leaf.
///
/// When the leaf's whole time span falls inside the query range the stored
/// rollup is used without decoding the payload.
pub struct LeafAggregator {
    row: Option<Rollup>,
    dir: ScanDirection,
}

impl LeafAggregator {
    /// Computes the aggregate at construction time.
    pub fn new(node: &LeafNode, begin: Timestamp, end: Timestamp) -> Result<Self> {
        let dir = direction_of(begin, end);
        let min = begin.min(end);
        let max = begin.max(end);
        let (tmin, tmax) = node.timestamps();
        if node.count() == 0 || max < tmin || tmax < min {
            return Ok(Self { row: None, dir });
        }
        if min <= tmin && tmax < max {
            // Fast path: the whole leaf is inside the search range.
            return Ok(Self {
                row: Some(Rollup::from_summary(node.summary())),
                dir,
            });
        }
        let (ts, xs) = node.read_all()?;
        let mut rollup = Rollup::new();
        for (&t, &x) in ts.iter().zip(xs.iter()) {
            let matches = match dir {
                ScanDirection::Forward => t >= begin && t < end,
                ScanDirection::Backward => t <= begin && t > end,
            };
            if matches {
                rollup.add(t, x);
            }
        }
        Ok(Self {
            row: (rollup.count > 0).then_some(rollup),
            dir,
        })
    }
}

impl RollupScanner for LeafAggregator {
    fn read(&mut self, ts_out: &mut [Timestamp], out: &mut [Rollup])
        -> Result<(ReadStatus, usize)>
    {
        if ts_out.is_empty() || out.is_empty() {
            return Err(HoltError::BadArg);
        }
        match self.row.take() {
            Some(rollup) => {
                ts_out[0] = rollup.repr_time(self.dir);
                out[0] = rollup;
                Ok((ReadStatus::Ok, 1))
            }
            None => Ok((ReadStatus::NoData, 0)),
        }
    }

    fn direction(&self) -> ScanDirection {
        self.dir
    }
}

/// Single-row aggregate over a superblock subtree.
///
/// Children entirely inside the query range contribute their stored rollup
/// in O(1); partially overlapping children are descended into.
pub struct SuperblockAggregator {
    cursor: ChildCursor,
    done: bool,
}

impl SuperblockAggregator {
    /// Aggregator over an in-memory child list.
    pub fn over_children(
        refs: Vec<NodeSummary>,
        param_id: ParamId,
        begin: Timestamp,
        end: Timestamp,
        bstore: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            cursor: ChildCursor::over_children(refs, param_id, begin, end, bstore),
            done: false,
        }
    }

    /// Aggregator over a sealed superblock.
    pub fn from_addr(
        addr: LogicAddr,
        param_id: ParamId,
        begin: Timestamp,
        end: Timestamp,
        bstore: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            cursor: ChildCursor::from_addr(addr, param_id, begin, end, bstore),
            done: false,
        }
    }

    fn child_aggregator(&self, entry: &NodeSummary) -> Result<Box<dyn RollupScanner>> {
        let (begin, end) = (self.cursor.begin, self.cursor.end);
        let min = begin.min(end);
        let max = begin.max(end);
        if min <= entry.tmin && entry.tmax < max {
            // No need to go deeper, the stored rollup covers the child.
            return Ok(Box::new(ValueRollup::new(
                Rollup::from_summary(entry),
                self.cursor.dir(),
            )));
        }
        if entry.level == 0 {
            let leaf = LeafNode::load(&*self.cursor.bstore, entry.addr, self.cursor.param_id)?;
            Ok(Box::new(LeafAggregator::new(&leaf, begin, end)?))
        } else {
            Ok(Box::new(SuperblockAggregator::from_addr(
                entry.addr,
                self.cursor.param_id,
                begin,
                end,
                self.cursor.bstore.clone(),
            )))
        }
    }
}

impl RollupScanner for SuperblockAggregator {
    fn read(&mut self, ts_out: &mut [Timestamp], out: &mut [Rollup])
        -> Result<(ReadStatus, usize)>
    {
        if ts_out.is_empty() || out.is_empty() {
            return Err(HoltError::BadArg);
        }
        if self.done {
            return Ok((ReadStatus::NoData, 0));
        }
        self.done = true;
        let mut combined = Rollup::new();
        while let Some(entry) = self.cursor.next_overlapping()? {
            let mut child = self.child_aggregator(&entry)?;
            let mut t = [0u64];
            let mut r = [Rollup::new()];
            loop {
                let (status, n) = child.read(&mut t, &mut r)?;
                if n == 1 {
                    combined.combine(&r[0]);
                }
                if status == ReadStatus::NoData {
                    break;
                }
            }
        }
        if combined.count == 0 {
            return Ok((ReadStatus::NoData, 0));
        }
        ts_out[0] = combined.repr_time(self.direction());
        out[0] = combined;
        Ok((ReadStatus::Ok, 1))
    }

    fn direction(&self) -> ScanDirection {
        self.cursor.dir()
    }
}

/// Combines the single-row aggregates of several iterators (one per
/// extent) into one row.
pub struct CombineAggregator {
    children: VecDeque<Box<dyn RollupScanner>>,
    dir: ScanDirection,
    done: bool,
}

impl CombineAggregator {
    /// Combines `children` into a single-row aggregate.
    pub fn new(children: Vec<Box<dyn RollupScanner>>, begin: Timestamp, end: Timestamp) -> Self {
        Self {
            children: children.into(),
            dir: direction_of(begin, end),
            done: false,
        }
    }
}

impl RollupScanner for CombineAggregator {
    fn read(&mut self, ts_out: &mut [Timestamp], out: &mut [Rollup])
        -> Result<(ReadStatus, usize)>
    {
        if ts_out.is_empty() || out.is_empty() {
            return Err(HoltError::BadArg);
        }
        if self.done {
            return Ok((ReadStatus::NoData, 0));
        }
        self.done = true;
        let mut combined = Rollup::new();
        while let Some(child) = self.children.front_mut() {
            let mut t = [0u64];
            let mut r = [Rollup::new()];
            let (status, n) = child.read(&mut t, &mut r)?;
            if n == 1 {
                combined.combine(&r[0]);
            }
            if status == ReadStatus::NoData {
                self.children.pop_front();
            }
        }
        if combined.count == 0 {
            return Ok((ReadStatus::NoData, 0));
        }
        ts_out[0] = combined.repr_time(self.dir);
        out[0] = combined;
        Ok((ReadStatus::Ok, 1))
    }

    fn direction(&self) -> ScanDirection {
        self.dir
    }
}

/// Adapter turning a rollup iterator into the public single-row scalar
/// iterator of `aggregate(begin, end, fn)`.
pub struct AggregateSelector {
    inner: Box<dyn RollupScanner>,
    func: AggregateFn,
}

impl AggregateSelector {
    /// Selects `func` out of every row `inner` yields.
    pub fn new(inner: Box<dyn RollupScanner>, func: AggregateFn) -> Self {
        Self { inner, func }
    }
}

impl PointScanner for AggregateSelector {
    fn read(&mut self, ts_out: &mut [Timestamp], val_out: &mut [f64])
        -> Result<(ReadStatus, usize)>
    {
        if ts_out.is_empty() || val_out.is_empty() {
            return Err(HoltError::BadArg);
        }
        let mut t = [0u64];
        let mut r = [Rollup::new()];
        let (status, n) = self.inner.read(&mut t, &mut r)?;
        if n == 1 {
            ts_out[0] = t[0];
            val_out[0] = self.func.select(&r[0]);
        }
        Ok((status, n))
    }

    fn direction(&self) -> ScanDirection {
        self.inner.direction()
    }
}

fn bin_of(ts: Timestamp, begin: Timestamp, step: u64, dir: ScanDirection) -> u64 {
    match dir {
        ScanDirection::Forward => (ts - begin) / step,
        ScanDirection::Backward => (begin - ts) / step,
    }
}

/// Merges a stream of bin-rows: consecutive rows that land in the same
/// step interval are folded together; a row is released only once a row
/// from a later interval arrives (or the stream ends), because the next
/// child may still contribute to it.
struct GroupMerger {
    begin: Timestamp,
    step: u64,
    dir: ScanDirection,
    pending: Option<Rollup>,
    ready: VecDeque<Rollup>,
}

impl GroupMerger {
    fn new(begin: Timestamp, step: u64, dir: ScanDirection) -> Self {
        Self {
            begin,
            step,
            dir,
            pending: None,
            ready: VecDeque::new(),
        }
    }

    fn bin(&self, rollup: &Rollup) -> u64 {
        bin_of(rollup.repr_time(self.dir), self.begin, self.step, self.dir)
    }

    fn offer(&mut self, row: Rollup) {
        let row_bin = self.bin(&row);
        match self.pending.take() {
            Some(mut pending) if self.bin(&pending) == row_bin => {
                pending.combine(&row);
                self.pending = Some(pending);
            }
            Some(pending) => {
                self.ready.push_back(pending);
                self.pending = Some(row);
            }
            None => self.pending = Some(row),
        }
    }

    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.ready.push_back(pending);
        }
    }
}

/// Stepped aggregate over one leaf: one rollup row per non-empty `step`
/// interval measured from `begin`.
pub struct LeafGroupAggregator {
    rows: VecDeque<Rollup>,
    dir: ScanDirection,
}

impl LeafGroupAggregator {
    /// Computes the bin rows at construction time.
    pub fn new(node: &LeafNode, begin: Timestamp, end: Timestamp, step: u64) -> Result<Self> {
        let dir = direction_of(begin, end);
        let min = begin.min(end);
        let max = begin.max(end);
        let (tmin, tmax) = node.timestamps();
        if step == 0 {
            return Err(HoltError::BadArg);
        }
        if node.count() == 0 || max < tmin || tmax < min {
            return Ok(Self {
                rows: VecDeque::new(),
                dir,
            });
        }
        if min <= tmin
            && tmax < max
            && bin_of(tmin, begin, step, dir) == bin_of(tmax, begin, step, dir)
        {
            // The whole leaf lies in one step interval.
            let mut rows = VecDeque::new();
            rows.push_back(Rollup::from_summary(node.summary()));
            return Ok(Self { rows, dir });
        }
        let (ts, xs) = node.read_all()?;
        let mut merger = GroupMerger::new(begin, step, dir);
        let in_range = |t: Timestamp| match dir {
            ScanDirection::Forward => t >= begin && t < end,
            ScanDirection::Backward => t <= begin && t > end,
        };
        let fold = |merger: &mut GroupMerger, t: Timestamp, x: f64| {
            let mut row = Rollup::new();
            row.add(t, x);
            merger.offer(row);
        };
        match dir {
            ScanDirection::Forward => {
                for (&t, &x) in ts.iter().zip(xs.iter()).filter(|(t, _)| in_range(**t)) {
                    fold(&mut merger, t, x);
                }
            }
            ScanDirection::Backward => {
                for (&t, &x) in ts.iter().zip(xs.iter()).rev().filter(|(t, _)| in_range(**t)) {
                    fold(&mut merger, t, x);
                }
            }
        }
        merger.finish();
        Ok(Self {
            rows: merger.ready,
            dir,
        })
    }
}

impl RollupScanner for LeafGroupAggregator {
    fn read(&mut self, ts_out: &mut [Timestamp], out: &mut [Rollup])
        -> Result<(ReadStatus, usize)>
    {
        let cap = ts_out.len().min(out.len());
        if cap == 0 {
            return Err(HoltError::BadArg);
        }
        let mut n = 0;
        while n < cap {
            let Some(row) = self.rows.pop_front() else {
                return Ok((ReadStatus::NoData, n));
            };
            ts_out[n] = row.repr_time(self.dir);
            out[n] = row;
            n += 1;
        }
        Ok((ReadStatus::Ok, n))
    }

    fn direction(&self) -> ScanDirection {
        self.dir
    }
}

/// Stepped aggregate over a superblock subtree. Children that fit inside a
/// single step interval and inside the query range contribute their stored
/// rollup without descent; boundary intervals spanning two children are
/// merged by the internal `GroupMerger`.
pub struct SuperblockGroupAggregator {
    cursor: ChildCursor,
    step: u64,
    cur: Option<Box<dyn RollupScanner>>,
    merger: GroupMerger,
    exhausted: bool,
}

impl SuperblockGroupAggregator {
    /// Aggregator over an in-memory child list.
    pub fn over_children(
        refs: Vec<NodeSummary>,
        param_id: ParamId,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
        bstore: Arc<dyn BlockStore>,
    ) -> Self {
        let dir = direction_of(begin, end);
        Self {
            cursor: ChildCursor::over_children(refs, param_id, begin, end, bstore),
            step,
            cur: None,
            merger: GroupMerger::new(begin, step, dir),
            exhausted: false,
        }
    }

    /// Aggregator over a sealed superblock.
    pub fn from_addr(
        addr: LogicAddr,
        param_id: ParamId,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
        bstore: Arc<dyn BlockStore>,
    ) -> Self {
        let dir = direction_of(begin, end);
        Self {
            cursor: ChildCursor::from_addr(addr, param_id, begin, end, bstore),
            step,
            cur: None,
            merger: GroupMerger::new(begin, step, dir),
            exhausted: false,
        }
    }

    fn child_aggregator(&self, entry: &NodeSummary) -> Result<Box<dyn RollupScanner>> {
        let (begin, end) = (self.cursor.begin, self.cursor.end);
        let dir = self.cursor.dir();
        let min = begin.min(end);
        let max = begin.max(end);
        if min <= entry.tmin
            && entry.tmax < max
            && bin_of(entry.tmin, begin, self.step, dir) == bin_of(entry.tmax, begin, self.step, dir)
        {
            // The whole subtree fits in one step interval.
            return Ok(Box::new(ValueRollup::new(Rollup::from_summary(entry), dir)));
        }
        if entry.level == 0 {
            let leaf = LeafNode::load(&*self.cursor.bstore, entry.addr, self.cursor.param_id)?;
            Ok(Box::new(LeafGroupAggregator::new(&leaf, begin, end, self.step)?))
        } else {
            Ok(Box::new(SuperblockGroupAggregator::from_addr(
                entry.addr,
                self.cursor.param_id,
                begin,
                end,
                self.step,
                self.cursor.bstore.clone(),
            )))
        }
    }

    /// Pulls rows into the merger until at least `want` rows are ready or
    /// every child is drained.
    fn refill(&mut self, want: usize) -> Result<()> {
        while !self.exhausted && self.merger.ready.len() < want {
            if self.cur.is_none() {
                match self.cursor.next_overlapping()? {
                    Some(entry) => self.cur = Some(self.child_aggregator(&entry)?),
                    None => {
                        self.exhausted = true;
                        self.merger.finish();
                        return Ok(());
                    }
                }
            }
            let child = self.cur.as_mut().expect("child installed above");
            let mut t = [0u64];
            let mut r = [Rollup::new()];
            let (status, n) = child.read(&mut t, &mut r)?;
            if n == 1 {
                self.merger.offer(r[0]);
            }
            if status == ReadStatus::NoData {
                self.cur = None;
            }
        }
        Ok(())
    }
}

impl RollupScanner for SuperblockGroupAggregator {
    fn read(&mut self, ts_out: &mut [Timestamp], out: &mut [Rollup])
        -> Result<(ReadStatus, usize)>
    {
        let cap = ts_out.len().min(out.len());
        if cap == 0 {
            return Err(HoltError::BadArg);
        }
        self.refill(cap)?;
        let mut n = 0;
        while n < cap {
            let Some(row) = self.merger.ready.pop_front() else {
                break;
            };
            ts_out[n] = row.repr_time(self.direction());
            out[n] = row;
            n += 1;
        }
        if n < cap && self.exhausted {
            return Ok((ReadStatus::NoData, n));
        }
        Ok((ReadStatus::Ok, n))
    }

    fn direction(&self) -> ScanDirection {
        self.cursor.dir()
    }
}

/// Stepped aggregate across several iterators (one per extent), merging
/// the interval at each seam.
pub struct CombineGroupAggregator {
    children: VecDeque<Box<dyn RollupScanner>>,
    merger: GroupMerger,
    exhausted: bool,
    dir: ScanDirection,
}

impl CombineGroupAggregator {
    /// Combines `children` in the order given.
    pub fn new(
        children: Vec<Box<dyn RollupScanner>>,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Self {
        let dir = direction_of(begin, end);
        Self {
            children: children.into(),
            merger: GroupMerger::new(begin, step, dir),
            exhausted: false,
            dir,
        }
    }

    fn refill(&mut self, want: usize) -> Result<()> {
        while !self.exhausted && self.merger.ready.len() < want {
            let Some(child) = self.children.front_mut() else {
                self.exhausted = true;
                self.merger.finish();
                return Ok(());
            };
            let mut t = [0u64];
            let mut r = [Rollup::new()];
            let (status, n) = child.read(&mut t, &mut r)?;
            if n == 1 {
                self.merger.offer(r[0]);
            }
            if status == ReadStatus::NoData {
                self.children.pop_front();
            }
        }
        Ok(())
    }
}

impl RollupScanner for CombineGroupAggregator {
    fn read(&mut self, ts_out: &mut [Timestamp], out: &mut [Rollup])
        -> Result<(ReadStatus, usize)>
    {
        let cap = ts_out.len().min(out.len());
        if cap == 0 {
            return Err(HoltError::BadArg);
        }
        self.refill(cap)?;
        let mut n = 0;
        while n < cap {
            let Some(row) = self.merger.ready.pop_front() else {
                break;
            };
            ts_out[n] = row.repr_time(self.dir);
            out[n] = row;
            n += 1;
        }
        if n < cap && self.exhausted {
            return Ok((ReadStatus::NoData, n));
        }
        Ok((ReadStatus::Ok, n))
    }

    fn direction(&self) -> ScanDirection {
        self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EMPTY_ADDR;

    fn filled_leaf(n: u64) -> LeafNode {
        let mut leaf = LeafNode::new(42, EMPTY_ADDR, 0);
        for i in 0..n {
            leaf.append(100 + i, (100 + i) as f64).unwrap();
        }
        leaf
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

    #[test]
    fn test_leaf_scanner_forward_bounds() {
        let leaf = filled_leaf(100);
        let mut scanner = leaf.range(120, 150).unwrap();
        let rows = drain(&mut scanner, 7);
        assert_eq!(rows.len(), 30);
        assert_eq!(rows[0].0, 120);
        assert_eq!(rows[29].0, 149);
    }

    #[test]
    fn test_leaf_scanner_backward_bounds() {
        let leaf = filled_leaf(100);
        let mut scanner = leaf.range(150, 120).unwrap();
        let rows = drain(&mut scanner, 7);
        // Backward: ts <= 150 and ts > 120.
        assert_eq!(rows.len(), 30);
        assert_eq!(rows[0].0, 150);
        assert_eq!(rows[29].0, 121);
    }

    #[test]
    fn test_leaf_scanner_no_overlap() {
        let leaf = filled_leaf(10);
        let mut scanner = leaf.range(1000, 2000).unwrap();
        assert_eq!(scanner.read(&mut [0; 4], &mut [0.0; 4]).unwrap(), (ReadStatus::NoData, 0));
    }

    #[test]
    fn test_leaf_aggregator_fast_and_slow_paths() {
        let leaf = filled_leaf(100);

        // Whole leaf inside the range: fast path off the summary.
        let mut agg = leaf.aggregate(0, 1000).unwrap();
        let mut t = [0u64];
        let mut r = [Rollup::new()];
        let (status, n) = agg.read(&mut t, &mut r).unwrap();
        assert_eq!((status, n), (ReadStatus::Ok, 1));
        assert_eq!(r[0].count, 100);
        assert_eq!(r[0].sum, (100..200).sum::<u64>() as f64);
        assert_eq!(agg.read(&mut t, &mut r).unwrap(), (ReadStatus::NoData, 0));

        // Partial range: recomputed from the samples.
        let mut agg = leaf.aggregate(150, 160).unwrap();
        let (_, n) = agg.read(&mut t, &mut r).unwrap();
        assert_eq!(n, 1);
        assert_eq!(r[0].count, 10);
        assert_eq!(r[0].first, 150.0);
        assert_eq!(r[0].last, 159.0);
    }

    #[test]
    fn test_aggregator_rejects_empty_buffer() {
        let leaf = filled_leaf(10);
        let mut agg = leaf.aggregate(0, 1000).unwrap();
        assert!(matches!(
            agg.read(&mut [], &mut []),
            Err(HoltError::BadArg)
        ));
    }

    #[test]
    fn test_rollup_combine_is_time_based() {
        let mut a = Rollup::new();
        a.add(10, 1.0);
        a.add(20, 5.0);
        let mut b = Rollup::new();
        b.add(30, -2.0);
        b.add(40, 3.0);

        // Combine in reverse arrival order; first/last still follow time.
        let mut combined = Rollup::new();
        combined.combine(&b);
        combined.combine(&a);
        assert_eq!(combined.count, 4);
        assert_eq!(combined.first, 1.0);
        assert_eq!(combined.last, 3.0);
        assert_eq!(combined.min, -2.0);
        assert_eq!(combined.max, 5.0);
    }

    #[test]
    fn test_leaf_group_aggregator_bins() {
        let leaf = filled_leaf(100); // ts 100..200
        let mut agg = leaf.group_aggregate(100, 200, 30).unwrap();
        let mut ts = [0u64; 8];
        let mut rows = [Rollup::new(); 8];
        let (status, n) = agg.read(&mut ts, &mut rows).unwrap();
        assert_eq!(status, ReadStatus::NoData);
        assert_eq!(n, 4); // bins of 30, 30, 30, 10 samples
        assert_eq!(rows[0].count, 30);
        assert_eq!(rows[3].count, 10);
        assert_eq!(ts[0], 100);
        assert_eq!(ts[3], 190);
    }

    #[test]
    fn test_group_merger_folds_same_bin() {
        let mut merger = GroupMerger::new(0, 100, ScanDirection::Forward);
        let mut a = Rollup::new();
        a.add(10, 1.0);
        let mut b = Rollup::new();
        b.add(50, 2.0);
        let mut c = Rollup::new();
        c.add(150, 3.0);
        merger.offer(a);
        merger.offer(b);
        assert!(merger.ready.is_empty());
        merger.offer(c);
        assert_eq!(merger.ready.len(), 1);
        assert_eq!(merger.ready[0].count, 2);
        merger.finish();
        assert_eq!(merger.ready.len(), 2);
    }

    #[test]
    fn test_empty_scanner() {
        let mut scanner = EmptyScanner::new(ScanDirection::Forward);
        assert_eq!(
            scanner.read(&mut [0; 4], &mut [0.0; 4]).unwrap(),
            (ReadStatus::NoData, 0)
        );
    }
}
