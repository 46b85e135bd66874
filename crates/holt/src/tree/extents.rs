//! Per-series extents collection: the write path, the recovery path and
//! the entry points for range and aggregation queries.
//!
//! An [`ExtentsList`] owns one [`Extent`] per tree level. Extent 0 builds
//! leaves; extent k (k >= 1) builds level-k superblocks. Appending a
//! sample that does not fit the open leaf seals the leaf and publishes its
//! `(address, rollup)` entry into level 1, which may seal in turn; the
//! cascade creates a new top level the first time the current top seals.
//!
//! The `roots` vector (one address per level, lowest level first) is the
//! minimal information needed to reopen the series: each entry is the most
//! recently sealed node at that level, or [`EMPTY_ADDR`] if the current
//! open node was never preceded by a sealed one. After a clean
//! [`close`](ExtentsList::close) the vector collapses to
//! `[EMPTY, .., EMPTY, root]` and the last entry is also the last address
//! ever written to the store, which is what
//! [`repair_status`](ExtentsList::repair_status) inspects.

use crate::error::{HoltError, Result};
use crate::store::{BlockStore, LogicAddr, EMPTY_ADDR};
use crate::tree::leaf::LeafNode;
use crate::tree::scan::{
    direction_of, AggregateFn, AggregateSelector, ChainScanner, CombineAggregator,
    CombineGroupAggregator, EmptyScanner, LeafAggregator, LeafGroupAggregator, LeafScanner,
    PointScanner, RollupScanner, ScanDirection,
};
use crate::tree::superblock::SuperblockNode;
use crate::tree::{read_and_check, NodeKind, NodeSummary, ParamId, Timestamp, FANOUT};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a successful [`ExtentsList::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    /// Sample accepted, nothing was written to the store.
    Ok,
    /// Sample accepted and at least one node was sealed; callers should
    /// snapshot [`ExtentsList::get_roots`] for recovery.
    OkFlushNeeded,
}

/// Verdict of [`ExtentsList::repair_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStatus {
    /// The roots describe a cleanly closed tree.
    Ok,
    /// The tree was not closed; reopening will run crash recovery.
    Repair,
}

/// Reads the sealed node at `last` and derives the position of the next
/// node at the same level: `fanout_index + 1`, wrapping to a fresh chain
/// at [`FANOUT`]. A dangling address starts a fresh chain.
fn sibling_position(
    bstore: &dyn BlockStore,
    param_id: ParamId,
    last: LogicAddr,
) -> Result<(u16, LogicAddr)> {
    if last == EMPTY_ADDR {
        return Ok((0, EMPTY_ADDR));
    }
    match read_and_check(bstore, last, param_id) {
        Ok((_, summary)) => {
            let next = summary.fanout_index + 1;
            if next as usize == FANOUT {
                Ok((0, EMPTY_ADDR))
            } else {
                Ok((next, last))
            }
        }
        Err(e) if e.is_not_found() => {
            warn!(param_id, last, "sealed predecessor is gone, starting a fresh chain");
            Ok((0, EMPTY_ADDR))
        }
        Err(e) => Err(e),
    }
}

/// Level-0 builder: owns the open leaf.
pub struct LeafExtent {
    param_id: ParamId,
    node: LeafNode,
}

impl LeafExtent {
    fn new(bstore: &dyn BlockStore, param_id: ParamId, last: LogicAddr) -> Result<Self> {
        let (fanout_index, prev) = sibling_position(bstore, param_id, last)?;
        Ok(Self {
            param_id,
            node: LeafNode::new(param_id, prev, fanout_index),
        })
    }

    /// The open leaf.
    pub fn node(&self) -> &LeafNode {
        &self.node
    }

    fn seal(&mut self, bstore: &dyn BlockStore) -> Result<(LogicAddr, NodeSummary)> {
        let addr = self.node.seal(bstore)?;
        let entry = self.node.summary().child_entry(addr);
        let next = self.node.fanout_index() + 1;
        let (fanout_index, prev) = if next as usize == FANOUT {
            (0, EMPTY_ADDR)
        } else {
            (next, addr)
        };
        self.node = LeafNode::new(self.param_id, prev, fanout_index);
        Ok((addr, entry))
    }
}

/// Level-k (k >= 1) builder: owns the open superblock.
pub struct SuperblockExtent {
    param_id: ParamId,
    level: u16,
    node: SuperblockNode,
}

impl SuperblockExtent {
    fn new(bstore: &dyn BlockStore, param_id: ParamId, level: u16, last: LogicAddr) -> Result<Self> {
        let (fanout_index, prev) = sibling_position(bstore, param_id, last)?;
        Ok(Self {
            param_id,
            level,
            node: SuperblockNode::new(param_id, level, prev, fanout_index),
        })
    }

    /// Reopens the sealed node at `addr` as this extent's open node, so a
    /// cleanly closed root keeps absorbing children instead of the tree
    /// growing a level on every reopen.
    fn reopen(bstore: &dyn BlockStore, param_id: ParamId, level: u16, addr: LogicAddr) -> Result<Self> {
        let node = SuperblockNode::reopen(bstore, addr, param_id)?;
        if node.level() != level {
            return Err(HoltError::LevelMismatch {
                expected: level,
                actual: node.level(),
            });
        }
        Ok(Self {
            param_id,
            level,
            node,
        })
    }

    /// The open superblock.
    pub fn node(&self) -> &SuperblockNode {
        &self.node
    }

    fn seal(&mut self, bstore: &dyn BlockStore) -> Result<(LogicAddr, NodeSummary)> {
        let addr = self.node.seal(bstore)?;
        let entry = self.node.summary().child_entry(addr);
        let next = self.node.fanout_index() + 1;
        let (fanout_index, prev) = if next as usize == FANOUT {
            (0, EMPTY_ADDR)
        } else {
            (next, addr)
        };
        self.node = SuperblockNode::new(self.param_id, self.level, prev, fanout_index);
        Ok((addr, entry))
    }
}

/// One level of the tree: a leaf builder or a superblock builder.
pub enum Extent {
    /// Level 0.
    Leaf(LeafExtent),
    /// Level >= 1.
    Super(SuperblockExtent),
}

impl Extent {
    /// Tree level of this extent.
    pub fn level(&self) -> u16 {
        match self {
            Extent::Leaf(_) => 0,
            Extent::Super(e) => e.level,
        }
    }

    /// True if the open node holds any data.
    pub fn is_dirty(&self) -> bool {
        match self {
            Extent::Leaf(e) => e.node.count() > 0,
            Extent::Super(e) => e.node.nelements() > 0,
        }
    }

    fn is_full(&self) -> bool {
        match self {
            // Leaves overflow by payload size, not entry count.
            Extent::Leaf(_) => false,
            Extent::Super(e) => e.node.is_full(),
        }
    }

    fn seal(&mut self, bstore: &dyn BlockStore) -> Result<(LogicAddr, NodeSummary)> {
        match self {
            Extent::Leaf(e) => e.seal(bstore),
            Extent::Super(e) => e.seal(bstore),
        }
    }

    fn append_child(&mut self, child: NodeSummary) -> Result<()> {
        match self {
            Extent::Leaf(_) => unreachable!("level 0 extent never receives child entries"),
            Extent::Super(e) => e.node.append_child(child),
        }
    }

    /// Range iterator over this extent's open node (descending into its
    /// sealed children for superblocks).
    pub fn search(
        &self,
        begin: Timestamp,
        end: Timestamp,
        bstore: &Arc<dyn BlockStore>,
    ) -> Result<Box<dyn PointScanner>> {
        match self {
            Extent::Leaf(e) => Ok(Box::new(LeafScanner::new(&e.node, begin, end)?)),
            Extent::Super(e) => Ok(Box::new(e.node.range(begin, end, bstore.clone()))),
        }
    }

    /// Single-row aggregate over this extent.
    pub fn aggregate(
        &self,
        begin: Timestamp,
        end: Timestamp,
        bstore: &Arc<dyn BlockStore>,
    ) -> Result<Box<dyn RollupScanner>> {
        match self {
            Extent::Leaf(e) => Ok(Box::new(LeafAggregator::new(&e.node, begin, end)?)),
            Extent::Super(e) => Ok(Box::new(e.node.aggregate(begin, end, bstore.clone()))),
        }
    }

    /// Stepped aggregate over this extent.
    pub fn group_aggregate(
        &self,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
        bstore: &Arc<dyn BlockStore>,
    ) -> Result<Box<dyn RollupScanner>> {
        match self {
            Extent::Leaf(e) => Ok(Box::new(LeafGroupAggregator::new(&e.node, begin, end, step)?)),
            Extent::Super(e) => Ok(Box::new(e.node.group_aggregate(begin, end, step, bstore.clone()))),
        }
    }
}

/// The per-series tree: an ordered list of extents, lowest level first,
/// plus the rescue addresses needed to reopen it.
pub struct ExtentsList {
    bstore: Arc<dyn BlockStore>,
    param_id: ParamId,
    last_ts: Option<Timestamp>,
    rescue_points: Vec<LogicAddr>,
    extents: Vec<Extent>,
    /// Child entries whose publication failed on an I/O error; retried on
    /// the next append or on close.
    pending_publish: VecDeque<(usize, NodeSummary)>,
    last_sealed: LogicAddr,
    initialized: bool,
    write_count: u64,
}

impl ExtentsList {
    /// Creates the list without touching the store. A tree opened with
    /// non-empty `roots` must be initialized with
    /// [`force_init`](Self::force_init) (or by the first `append`, which
    /// initializes on demand) before it can be queried.
    pub fn new(param_id: ParamId, roots: Vec<LogicAddr>, bstore: Arc<dyn BlockStore>) -> Self {
        let initialized = roots.is_empty();
        Self {
            bstore,
            param_id,
            last_ts: None,
            rescue_points: roots,
            extents: Vec::new(),
            pending_publish: VecDeque::new(),
            last_sealed: EMPTY_ADDR,
            initialized,
            write_count: 0,
        }
    }

    /// Series this tree belongs to.
    pub fn param_id(&self) -> ParamId {
        self.param_id
    }

    /// True once the extents have been rebuilt from the rescue points.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current rescue addresses, one per level, lowest level first.
    pub fn get_roots(&self) -> Vec<LogicAddr> {
        self.rescue_points.clone()
    }

    /// The extents, lowest level first. For consistency checking.
    pub fn get_extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Classifies a roots vector: `Ok` exactly when it is the result of a
    /// clean close, i.e. the only non-empty entry is the last one (the
    /// recovery anchor, which a clean close makes the last address ever
    /// written for this series).
    pub fn repair_status(roots: &[LogicAddr]) -> RepairStatus {
        let non_empty = roots.iter().filter(|&&a| a != EMPTY_ADDR).count();
        if non_empty == 1 && roots.last().is_some_and(|&a| a != EMPTY_ADDR) {
            RepairStatus::Ok
        } else {
            RepairStatus::Repair
        }
    }

    /// Idempotently rebuilds the open node of every level from the rescue
    /// points, running crash recovery when the tree was not cleanly
    /// closed.
    pub fn force_init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.init()
    }

    fn init(&mut self) -> Result<()> {
        if self.rescue_points.is_empty() {
            self.initialized = true;
            return Ok(());
        }
        match Self::repair_status(&self.rescue_points) {
            RepairStatus::Ok => self.open_clean()?,
            RepairStatus::Repair => self.repair()?,
        }
        self.initialized = true;
        self.restore_last_timestamp()?;
        Ok(())
    }

    fn open_clean(&mut self) -> Result<()> {
        self.extents.clear();
        let roots = self.rescue_points.clone();
        debug!(
            param_id = self.param_id,
            root = roots.last().copied().unwrap_or(EMPTY_ADDR),
            "opening cleanly closed tree"
        );
        if roots.len() < 2 {
            // The whole tree is a single sealed leaf; lift it under a
            // fresh level-1 root so the cascade has somewhere to publish.
            let addr = roots[0];
            let (_, leaf_summary) = read_and_check(&*self.bstore, addr, self.param_id)?;
            if leaf_summary.level != 0 {
                return Err(HoltError::LevelMismatch {
                    expected: 0,
                    actual: leaf_summary.level,
                });
            }
            let mut root = SuperblockExtent::new(&*self.bstore, self.param_id, 1, EMPTY_ADDR)?;
            root.node.append_child(leaf_summary.child_entry(addr))?;
            let leaf = LeafExtent::new(&*self.bstore, self.param_id, addr)?;
            self.extents.push(Extent::Leaf(leaf));
            self.extents.push(Extent::Super(root));
            self.rescue_points.push(EMPTY_ADDR);
            return Ok(());
        }
        let top = roots.len() - 1;
        self.extents.push(Extent::Leaf(LeafExtent::new(
            &*self.bstore,
            self.param_id,
            roots[0],
        )?));
        for (lvl, &root) in roots.iter().enumerate().take(top).skip(1) {
            self.extents.push(Extent::Super(SuperblockExtent::new(
                &*self.bstore,
                self.param_id,
                lvl as u16,
                root,
            )?));
        }
        // The root continues in place (copy-on-write): resealing it later
        // writes a superseding block at a new address.
        self.extents.push(Extent::Super(SuperblockExtent::reopen(
            &*self.bstore,
            self.param_id,
            top as u16,
            roots[top],
        )?));
        Ok(())
    }

    /// Crash recovery: rebuild each level's open node after its sealed
    /// predecessor, then replay sealed nodes that never reached a sealed
    /// parent by walking the per-level `prev` chains. Data that was still
    /// in the open leaf at crash time is gone; everything sealed survives.
    fn repair(&mut self) -> Result<()> {
        self.extents.clear();
        let roots = self.rescue_points.clone();
        warn!(
            param_id = self.param_id,
            levels = roots.len(),
            "tree was not closed cleanly, repairing"
        );
        if roots.len() < 2 {
            // No leaf was ever sealed; there is nothing to recover.
            self.extents.push(Extent::Leaf(LeafExtent::new(
                &*self.bstore,
                self.param_id,
                EMPTY_ADDR,
            )?));
            return Ok(());
        }
        let top = roots.len() - 1;
        self.extents.push(Extent::Leaf(LeafExtent::new(
            &*self.bstore,
            self.param_id,
            roots[0],
        )?));
        for (lvl, &root) in roots.iter().enumerate().take(top).skip(1) {
            self.extents.push(Extent::Super(SuperblockExtent::new(
                &*self.bstore,
                self.param_id,
                lvl as u16,
                root,
            )?));
        }
        // A sealed tip at the top level is a close anchor that was being
        // continued in place when the crash hit; continue it again.
        if roots[top] != EMPTY_ADDR {
            self.extents.push(Extent::Super(SuperblockExtent::reopen(
                &*self.bstore,
                self.param_id,
                top as u16,
                roots[top],
            )?));
        } else {
            self.extents.push(Extent::Super(SuperblockExtent::new(
                &*self.bstore,
                self.param_id,
                top as u16,
                EMPTY_ADDR,
            )?));
        }

        // Every other sealed tip anchors a chain of nodes that never
        // reached a sealed parent (sealing a parent clears the rescue
        // points below it). Walk each chain backward and publish the
        // entries into the level above, oldest first, highest level first.
        for lvl in (0..top).rev() {
            if roots[lvl] == EMPTY_ADDR {
                continue;
            }
            let mut chain = Vec::new();
            let mut addr = roots[lvl];
            while addr != EMPTY_ADDR {
                match read_and_check(&*self.bstore, addr, self.param_id) {
                    Ok((_, summary)) => {
                        if summary.level as usize != lvl {
                            return Err(HoltError::LevelMismatch {
                                expected: lvl as u16,
                                actual: summary.level,
                            });
                        }
                        let prev = summary.addr;
                        chain.push(summary.child_entry(addr));
                        addr = prev;
                    }
                    Err(e) if e.is_not_found() => break,
                    Err(e) => return Err(e),
                }
            }
            for entry in chain.into_iter().rev() {
                self.pending_publish.push_back((lvl + 1, entry));
                self.drain_pending(true)?;
            }
        }
        Ok(())
    }

    fn restore_last_timestamp(&mut self) -> Result<()> {
        let mut scanner = self.search(Timestamp::MAX, 0)?;
        let mut ts = [0u64];
        let mut xs = [0f64];
        let (_, n) = scanner.read(&mut ts, &mut xs)?;
        self.last_ts = (n == 1).then_some(ts[0]);
        Ok(())
    }

    fn seal_level(&mut self, lvl: usize) -> Result<(LogicAddr, NodeSummary)> {
        let (addr, entry) = self.extents[lvl].seal(&*self.bstore)?;
        self.rescue_points[lvl] = addr;
        // Everything the lower rescue points anchored is now reachable
        // through the sealed node; leaving them set would make recovery
        // read the same chains twice.
        for slot in self.rescue_points.iter_mut().take(lvl) {
            *slot = EMPTY_ADDR;
        }
        self.last_sealed = addr;
        Ok((addr, entry))
    }

    /// Publishes queued child entries upward, sealing nodes that reach
    /// [`FANOUT`] children. With `create_levels` unset (during `close`) a
    /// summary that would need a brand-new top level is dropped; its node
    /// is the recovery anchor and already recorded in the rescue points.
    fn drain_pending(&mut self, create_levels: bool) -> Result<()> {
        while let Some(&(lvl, entry)) = self.pending_publish.front() {
            if lvl >= self.extents.len() {
                if !create_levels {
                    self.pending_publish.pop_front();
                    continue;
                }
                let ext =
                    SuperblockExtent::new(&*self.bstore, self.param_id, lvl as u16, EMPTY_ADDR)?;
                self.extents.push(Extent::Super(ext));
                self.rescue_points.push(EMPTY_ADDR);
            }
            if self.extents[lvl].is_full() {
                // A seal failed earlier and left the node at capacity;
                // retry it before inserting.
                let (_, sealed) = self.seal_level(lvl)?;
                self.pending_publish.push_back((lvl + 1, sealed));
            }
            self.extents[lvl].append_child(entry)?;
            self.pending_publish.pop_front();
            if self.extents[lvl].is_full() {
                let (_, sealed) = self.seal_level(lvl)?;
                self.pending_publish.push_back((lvl + 1, sealed));
            }
        }
        Ok(())
    }

    /// Appends a sample.
    ///
    /// Returns [`AppendStatus::OkFlushNeeded`] when the append sealed at
    /// least one node. Rejects timestamps that are not strictly greater
    /// than the last accepted one. An I/O failure during sealing leaves
    /// the sample unconsumed and the open nodes intact; the failed seal is
    /// retried on the next append or on close.
    pub fn append(&mut self, ts: Timestamp, value: f64) -> Result<AppendStatus> {
        if !self.initialized {
            self.init()?;
        }
        if let Some(last) = self.last_ts {
            if ts <= last {
                return Err(HoltError::LateWrite { ts, last });
            }
        }
        if self.extents.is_empty() {
            self.extents.push(Extent::Leaf(LeafExtent::new(
                &*self.bstore,
                self.param_id,
                EMPTY_ADDR,
            )?));
            self.rescue_points.push(EMPTY_ADDR);
        }
        // Retry publications stranded by an earlier I/O failure.
        let mut sealed_something = !self.pending_publish.is_empty();
        self.drain_pending(true)?;

        let leaf = match &mut self.extents[0] {
            Extent::Leaf(e) => &mut e.node,
            Extent::Super(_) => unreachable!("level 0 extent is always a leaf"),
        };
        match leaf.append(ts, value) {
            Ok(()) => {}
            Err(HoltError::Overflow) => {
                let (_, entry) = self.seal_level(0)?;
                self.pending_publish.push_back((1, entry));
                self.drain_pending(true)?;
                sealed_something = true;
                let leaf = match &mut self.extents[0] {
                    Extent::Leaf(e) => &mut e.node,
                    Extent::Super(_) => unreachable!("level 0 extent is always a leaf"),
                };
                leaf.append(ts, value)?;
            }
            Err(e) => return Err(e),
        }
        self.last_ts = Some(ts);
        self.write_count += 1;
        Ok(if sealed_something {
            AppendStatus::OkFlushNeeded
        } else {
            AppendStatus::Ok
        })
    }

    /// Seals every dirty level bottom-up and returns the final roots. The
    /// last entry is the address of the last block written, which is the
    /// recovery anchor for reopening. The list deinitializes; it can be
    /// reopened in place with [`force_init`](Self::force_init).
    pub fn close(&mut self) -> Result<Vec<LogicAddr>> {
        if !self.initialized {
            return Ok(self.rescue_points.clone());
        }
        if self.write_count == 0 {
            // Opened but never written: hand back the roots we were given,
            // minus the placeholder the open path added.
            if self.rescue_points.len() >= 2 && self.rescue_points.last() == Some(&EMPTY_ADDR) {
                self.rescue_points.pop();
            }
        } else {
            self.drain_pending(true)?;
            for lvl in 0..self.extents.len() {
                if !self.extents[lvl].is_dirty() {
                    continue;
                }
                let (_, entry) = self.seal_level(lvl)?;
                if lvl + 1 < self.extents.len() {
                    self.pending_publish.push_back((lvl + 1, entry));
                    self.drain_pending(false)?;
                }
            }
            let mut roots = vec![EMPTY_ADDR; self.extents.len()];
            if let Some(anchor) = roots.last_mut() {
                *anchor = self.last_sealed;
            }
            self.rescue_points = roots;
        }
        self.extents.clear();
        self.initialized = false;
        self.write_count = 0;
        self.last_ts = None;
        Ok(self.rescue_points.clone())
    }

    /// Merged range iterator over all extents, forward if `begin < end`,
    /// backward otherwise; `begin == end` yields nothing. Extents cover
    /// disjoint, ordered time spans (higher level = older data), so the
    /// merge is a concatenation in scan order.
    pub fn search(&self, begin: Timestamp, end: Timestamp) -> Result<Box<dyn PointScanner>> {
        if !self.initialized {
            return Err(HoltError::Uninitialized);
        }
        let dir = direction_of(begin, end);
        if begin == end {
            return Ok(Box::new(EmptyScanner::new(dir)));
        }
        let mut scanners: Vec<Box<dyn PointScanner>> = Vec::with_capacity(self.extents.len());
        match dir {
            ScanDirection::Forward => {
                for ext in self.extents.iter().rev() {
                    scanners.push(ext.search(begin, end, &self.bstore)?);
                }
            }
            ScanDirection::Backward => {
                for ext in self.extents.iter() {
                    scanners.push(ext.search(begin, end, &self.bstore)?);
                }
            }
        }
        if scanners.len() == 1 {
            return Ok(scanners.pop().expect("length checked"));
        }
        Ok(Box::new(ChainScanner::new(scanners, begin, end)))
    }

    /// Single-row aggregate over `[min(begin, end), max(begin, end))`,
    /// projected through `func`. Sealed subtrees that lie entirely inside
    /// the range contribute their stored rollups without being read.
    pub fn aggregate(
        &self,
        begin: Timestamp,
        end: Timestamp,
        func: AggregateFn,
    ) -> Result<Box<dyn PointScanner>> {
        if !self.initialized {
            return Err(HoltError::Uninitialized);
        }
        let dir = direction_of(begin, end);
        if begin == end {
            return Ok(Box::new(EmptyScanner::new(dir)));
        }
        let combined = CombineAggregator::new(self.rollup_scanners(begin, end, None)?, begin, end);
        Ok(Box::new(AggregateSelector::new(Box::new(combined), func)))
    }

    /// Stepped aggregate: one rollup row per non-empty `step` interval
    /// measured from `begin`.
    pub fn group_aggregate(
        &self,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Result<Box<dyn RollupScanner>> {
        if !self.initialized {
            return Err(HoltError::Uninitialized);
        }
        if step == 0 {
            return Err(HoltError::BadArg);
        }
        let children = if begin == end {
            Vec::new()
        } else {
            self.rollup_scanners(begin, end, Some(step))?
        };
        Ok(Box::new(CombineGroupAggregator::new(children, begin, end, step)))
    }

    fn rollup_scanners(
        &self,
        begin: Timestamp,
        end: Timestamp,
        step: Option<u64>,
    ) -> Result<Vec<Box<dyn RollupScanner>>> {
        let make = |ext: &Extent| match step {
            Some(step) => ext.group_aggregate(begin, end, step, &self.bstore),
            None => ext.aggregate(begin, end, &self.bstore),
        };
        let mut scanners: Vec<Box<dyn RollupScanner>> = Vec::with_capacity(self.extents.len());
        match direction_of(begin, end) {
            ScanDirection::Forward => {
                for ext in self.extents.iter().rev() {
                    scanners.push(make(ext)?);
                }
            }
            ScanDirection::Backward => {
                for ext in self.extents.iter() {
                    scanners.push(make(ext)?);
                }
            }
        }
        Ok(scanners)
    }

    /// Validates every sealed subtree hanging off the open superblocks:
    /// child positions, levels, and stored rollups against a recomputation
    /// from one level below.
    pub fn check_consistency(&self) -> Result<()> {
        for ext in &self.extents {
            if let Extent::Super(sb) = ext {
                check_children(
                    &*self.bstore,
                    self.param_id,
                    sb.node.children(),
                    sb.level - 1,
                )?;
            }
        }
        Ok(())
    }
}

fn same_value(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

fn check_children(
    bstore: &dyn BlockStore,
    param_id: ParamId,
    refs: &[NodeSummary],
    required_level: u16,
) -> Result<()> {
    for (ix, entry) in refs.iter().enumerate() {
        if entry.fanout_index as usize != ix {
            return Err(HoltError::InconsistentNode {
                addr: entry.addr,
                field: "fanout_index",
            });
        }
        if entry.level != required_level {
            return Err(HoltError::InconsistentNode {
                addr: entry.addr,
                field: "level",
            });
        }
        let recomputed = if required_level == 0 {
            *LeafNode::load(bstore, entry.addr, param_id)?.summary()
        } else {
            let node = SuperblockNode::load(bstore, entry.addr, param_id)?;
            let mut summary = NodeSummary::empty(
                NodeKind::Superblock,
                param_id,
                required_level,
                EMPTY_ADDR,
                entry.fanout_index,
            );
            for child in node.children() {
                summary.absorb_child(child);
            }
            check_children(bstore, param_id, node.children(), required_level - 1)?;
            summary
        };
        let field = if entry.tmin != recomputed.tmin {
            Some("tmin")
        } else if entry.tmax != recomputed.tmax {
            Some("tmax")
        } else if entry.count != recomputed.count {
            Some("count")
        } else if !same_value(entry.min, recomputed.min) {
            Some("min")
        } else if !same_value(entry.max, recomputed.max) {
            Some("max")
        } else if !same_value(entry.sum, recomputed.sum) {
            Some("sum")
        } else if !same_value(entry.first, recomputed.first) {
            Some("first")
        } else if !same_value(entry.last, recomputed.last) {
            Some("last")
        } else {
            None
        };
        if let Some(field) = field {
            return Err(HoltError::InconsistentNode {
                addr: entry.addr,
                field,
            });
        }
    }
    Ok(())
}
