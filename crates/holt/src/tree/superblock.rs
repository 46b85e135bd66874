//! Inner node: fixed-fanout index over sealed children.

use crate::error::{HoltError, Result};
use crate::store::{checksum, Block, BlockStore, LogicAddr, BLOCK_SIZE};
use crate::tree::scan::{SuperblockAggregator, SuperblockGroupAggregator, SuperblockScanner};
use crate::tree::{
    read_and_check, NodeKind, NodeSummary, ParamId, Timestamp, FANOUT, SUMMARY_SIZE,
};
use std::sync::Arc;

/// A level-k (k >= 1) node indexing up to [`FANOUT`] children at level
/// k - 1, each carried as a full [`NodeSummary`] with the child's address
/// and rollup.
///
/// The node's own header keeps the roll-up over everything reachable
/// through it, so a query that covers the whole subtree never has to
/// descend below this block.
pub struct SuperblockNode {
    summary: NodeSummary,
    children: Vec<NodeSummary>,
    immutable: bool,
}

impl SuperblockNode {
    /// Creates an empty open superblock.
    pub fn new(param_id: ParamId, level: u16, prev: LogicAddr, fanout_index: u16) -> Self {
        debug_assert!(level >= 1);
        Self {
            summary: NodeSummary::empty(NodeKind::Superblock, param_id, level, prev, fanout_index),
            children: Vec::with_capacity(FANOUT),
            immutable: false,
        }
    }

    /// Wraps a sealed superblock block that has already been verified.
    /// The node is read-only.
    pub fn from_block(block: Block) -> Result<Self> {
        let (summary, children) = parse(&block)?;
        Ok(Self {
            summary,
            children,
            immutable: true,
        })
    }

    /// Loads and verifies a sealed superblock from the block store.
    pub fn load(bstore: &dyn BlockStore, addr: LogicAddr, param_id: ParamId) -> Result<Self> {
        let (block, summary) = read_and_check(bstore, addr, param_id)?;
        if summary.level == 0 {
            return Err(HoltError::LevelMismatch {
                expected: 1,
                actual: 0,
            });
        }
        let (_, children) = parse(&block)?;
        Ok(Self {
            summary,
            children,
            immutable: true,
        })
    }

    /// Loads a sealed superblock and reopens it for appending.
    ///
    /// The reopened node keeps its fanout position and previous-sibling
    /// link; sealing it again writes a new block that supersedes the old
    /// one. Used when a cleanly closed tree is reopened, so the root keeps
    /// absorbing children instead of growing the tree by one level per
    /// reopen.
    pub fn reopen(bstore: &dyn BlockStore, addr: LogicAddr, param_id: ParamId) -> Result<Self> {
        let mut node = Self::load(bstore, addr, param_id)?;
        node.immutable = false;
        Ok(node)
    }

    /// Node metadata with the rollup over all children.
    pub fn summary(&self) -> &NodeSummary {
        &self.summary
    }

    /// Number of children.
    pub fn nelements(&self) -> usize {
        self.children.len()
    }

    /// True when the node holds [`FANOUT`] children and must be sealed.
    pub fn is_full(&self) -> bool {
        self.children.len() >= FANOUT
    }

    /// Tree level of this node.
    pub fn level(&self) -> u16 {
        self.summary.level
    }

    /// Position among the parent's children.
    pub fn fanout_index(&self) -> u16 {
        self.summary.fanout_index
    }

    /// Address of the previous sealed sibling, or
    /// [`EMPTY_ADDR`](crate::store::EMPTY_ADDR).
    pub fn prev_addr(&self) -> LogicAddr {
        self.summary.addr
    }

    /// First and last timestamps covered by the node.
    pub fn timestamps(&self) -> (Timestamp, Timestamp) {
        (self.summary.tmin, self.summary.tmax)
    }

    /// Child entries in insertion order.
    pub fn children(&self) -> &[NodeSummary] {
        &self.children
    }

    /// Appends a sealed child's entry.
    ///
    /// Fails with `Overflow` at [`FANOUT`] children, with `LateWrite` if
    /// the child does not extend the node's time range, and with
    /// `Immutable` on a node loaded read-only.
    pub fn append_child(&mut self, child: NodeSummary) -> Result<()> {
        if self.immutable {
            return Err(HoltError::Immutable);
        }
        if self.is_full() {
            return Err(HoltError::Overflow);
        }
        if !self.children.is_empty() && child.tmin <= self.summary.tmax {
            return Err(HoltError::LateWrite {
                ts: child.tmin,
                last: self.summary.tmax,
            });
        }
        if child.level + 1 != self.summary.level {
            return Err(HoltError::LevelMismatch {
                expected: self.summary.level - 1,
                actual: child.level,
            });
        }
        self.summary.absorb_child(&child);
        self.children.push(child);
        Ok(())
    }

    /// Writes the node to the block store and returns its address.
    pub fn seal(&self, bstore: &dyn BlockStore) -> Result<LogicAddr> {
        if self.children.is_empty() {
            return Err(HoltError::BadArg);
        }
        let mut buf = [0u8; BLOCK_SIZE];
        let payload_size = self.children.len() * SUMMARY_SIZE;
        for (ix, child) in self.children.iter().enumerate() {
            let at = SUMMARY_SIZE + ix * SUMMARY_SIZE;
            child.write_to(&mut buf[at..at + SUMMARY_SIZE]);
        }
        let mut header = self.summary;
        header.payload_size = payload_size as u16;
        header.checksum = checksum(&buf[SUMMARY_SIZE..SUMMARY_SIZE + payload_size]);
        header.write_to(&mut buf[..SUMMARY_SIZE]);
        bstore.append_block(&buf)
    }

    /// Range iterator descending into overlapping children.
    pub fn range(
        &self,
        begin: Timestamp,
        end: Timestamp,
        bstore: Arc<dyn BlockStore>,
    ) -> SuperblockScanner {
        SuperblockScanner::over_children(
            self.children.clone(),
            self.summary.param_id,
            begin,
            end,
            bstore,
        )
    }

    /// Single-row aggregate; children fully inside the range contribute
    /// their stored rollup without descent.
    pub fn aggregate(
        &self,
        begin: Timestamp,
        end: Timestamp,
        bstore: Arc<dyn BlockStore>,
    ) -> SuperblockAggregator {
        SuperblockAggregator::over_children(
            self.children.clone(),
            self.summary.param_id,
            begin,
            end,
            bstore,
        )
    }

    /// Stepped aggregate over the filtered range.
    pub fn group_aggregate(
        &self,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
        bstore: Arc<dyn BlockStore>,
    ) -> SuperblockGroupAggregator {
        SuperblockGroupAggregator::over_children(
            self.children.clone(),
            self.summary.param_id,
            begin,
            end,
            step,
            bstore,
        )
    }
}

fn parse(block: &Block) -> Result<(NodeSummary, Vec<NodeSummary>)> {
    let summary = NodeSummary::read_from(&block.bytes()[..SUMMARY_SIZE])?;
    let payload_size = summary.payload_size as usize;
    if payload_size % SUMMARY_SIZE != 0 || SUMMARY_SIZE + payload_size > BLOCK_SIZE {
        return Err(HoltError::PayloadDecode(format!(
            "superblock payload size {} is not a whole number of child entries",
            payload_size
        )));
    }
    let nchildren = payload_size / SUMMARY_SIZE;
    let mut children = Vec::with_capacity(nchildren);
    for ix in 0..nchildren {
        let at = SUMMARY_SIZE + ix * SUMMARY_SIZE;
        children.push(NodeSummary::read_from(&block.bytes()[at..at + SUMMARY_SIZE])?);
    }
    Ok((summary, children))
}
