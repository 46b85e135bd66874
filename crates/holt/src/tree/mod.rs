//! Numeric B+tree storage core.
//!
//! A single time series is stored as a stack of [extents]: per-level
//! builders over fixed-size blocks. Level 0 accumulates compressed
//! `(timestamp, value)` pairs in a [`LeafNode`]; when a leaf fills up it is
//! sealed into the block store and its address plus rollup is published
//! into a level-1 [`SuperblockNode`], which in turn seals after
//! [`FANOUT`] children, and so on. The tree grows a level exactly when the
//! top level seals for the first time.
//!
//! ```text
//! append(ts, val) -> leaf -> seal -> superblock L1 -> seal -> L2 -> ...
//! ```
//!
//! Reads descend from each extent's open node, pruning children by their
//! `[tmin, tmax]` bounds and using stored rollups for subtrees that fall
//! entirely inside the query range.
//!
//! [extents]: crate::tree::extents::ExtentsList
//! [`LeafNode`]: crate::tree::leaf::LeafNode
//! [`SuperblockNode`]: crate::tree::superblock::SuperblockNode

pub mod codec;
pub mod extents;
pub mod leaf;
pub mod scan;
pub mod superblock;

use crate::error::{HoltError, Result};
use crate::store::{checksum, Block, BlockStore, LogicAddr, BLOCK_SIZE};
use tracing::warn;

/// Timestamp in fixed ticks since the epoch. Strictly monotonic per series.
pub type Timestamp = u64;

/// Opaque stable series identifier.
pub type ParamId = u64;

/// Maximum number of children per superblock; sealing boundary.
pub const FANOUT: usize = 32;

/// Magic bytes at the start of every block header.
pub const BLOCK_MAGIC: [u8; 4] = *b"HOLT";

/// Current block format version.
pub const FORMAT_VERSION: u16 = 1;

/// Serialized size of a [`NodeSummary`] in bytes. The block header is one
/// summary; a superblock payload is up to [`FANOUT`] more.
pub const SUMMARY_SIZE: usize = 112;

/// Node kind stored in the block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// Level-0 node holding compressed samples.
    Leaf = 0,
    /// Inner node indexing up to [`FANOUT`] children.
    Superblock = 1,
}

impl NodeKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Leaf),
            1 => Some(Self::Superblock),
            _ => None,
        }
    }
}

/// Per-node metadata: block header, superblock child entry and rollup
/// carrier, all in one fixed-size record.
///
/// The `addr` field is context dependent: in a block header it links to the
/// previous sibling at the same level (or
/// [`EMPTY_ADDR`](crate::store::EMPTY_ADDR)); in a child entry
/// inside a superblock payload it is the child's own address.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeSummary {
    /// Block format version.
    pub version: u16,
    /// Leaf or superblock.
    pub kind: NodeKind,
    /// Tree level, 0 for leaves.
    pub level: u16,
    /// Position among the parent's children at seal time.
    pub fanout_index: u16,
    /// Payload bytes following the header. Zero in child entries.
    pub payload_size: u16,
    /// Owning series.
    pub param_id: ParamId,
    /// Previous sibling (header) or child address (child entry).
    pub addr: LogicAddr,
    /// Timestamp of the first sample in the subtree.
    pub tmin: Timestamp,
    /// Timestamp of the last sample in the subtree.
    pub tmax: Timestamp,
    /// Number of samples in the subtree.
    pub count: u64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Sum of all values.
    pub sum: f64,
    /// Timestamp at which the smallest value was recorded.
    pub min_time: Timestamp,
    /// Timestamp at which the largest value was recorded.
    pub max_time: Timestamp,
    /// First value in the subtree.
    pub first: f64,
    /// Last value in the subtree.
    pub last: f64,
    /// CRC32 of the payload. Zero in child entries.
    pub checksum: u32,
}

impl NodeSummary {
    /// Creates the header of an empty node.
    pub fn empty(kind: NodeKind, param_id: ParamId, level: u16, prev: LogicAddr, fanout_index: u16) -> Self {
        Self {
            version: FORMAT_VERSION,
            kind,
            level,
            fanout_index,
            payload_size: 0,
            param_id,
            addr: prev,
            tmin: Timestamp::MAX,
            tmax: 0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            min_time: Timestamp::MAX,
            max_time: 0,
            first: 0.0,
            last: 0.0,
            checksum: 0,
        }
    }

    /// Folds a single sample into the rollup. Used by leaves on append.
    pub fn observe(&mut self, ts: Timestamp, value: f64) {
        if self.count == 0 {
            self.tmin = ts;
            self.first = value;
        }
        self.tmax = ts;
        self.last = value;
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

    /// Folds a child's rollup into this node's rollup. Children arrive in
    /// timestamp order, so `tmin`/`first` are taken from the first child
    /// and `tmax`/`last` follow the latest one.
    pub fn absorb_child(&mut self, child: &NodeSummary) {
        if self.count == 0 {
            self.tmin = child.tmin;
            self.first = child.first;
        }
        self.tmax = child.tmax;
        self.last = child.last;
        self.count += child.count;
        self.sum += child.sum;
        if child.min < self.min {
            self.min = child.min;
            self.min_time = child.min_time;
        }
        if child.max > self.max {
            self.max = child.max;
            self.max_time = child.max_time;
        }
    }

    /// True if the subtree's time range intersects `[min, max)`.
    ///
    /// `min` must not be greater than `max`.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        !(self.tmax < min || max < self.tmin)
    }

    /// Serializes the summary into a `SUMMARY_SIZE` byte buffer.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&BLOCK_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.kind as u8;
        buf[7] = self.level as u8;
        buf[8..10].copy_from_slice(&self.fanout_index.to_le_bytes());
        buf[10..12].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[12..20].copy_from_slice(&self.param_id.to_le_bytes());
        buf[20..28].copy_from_slice(&self.addr.to_le_bytes());
        buf[28..36].copy_from_slice(&self.tmin.to_le_bytes());
        buf[36..44].copy_from_slice(&self.tmax.to_le_bytes());
        buf[44..52].copy_from_slice(&self.count.to_le_bytes());
        buf[52..60].copy_from_slice(&self.min.to_le_bytes());
        buf[60..68].copy_from_slice(&self.max.to_le_bytes());
        buf[68..76].copy_from_slice(&self.sum.to_le_bytes());
        buf[76..84].copy_from_slice(&self.min_time.to_le_bytes());
        buf[84..92].copy_from_slice(&self.max_time.to_le_bytes());
        buf[92..100].copy_from_slice(&self.first.to_le_bytes());
        buf[100..108].copy_from_slice(&self.last.to_le_bytes());
        buf[108..112].copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Deserializes a summary, validating magic and version.
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        let magic: [u8; 4] = buf[0..4].try_into().expect("slice length checked");
        if magic != BLOCK_MAGIC {
            return Err(HoltError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().expect("slice length checked"));
        if version != FORMAT_VERSION {
            return Err(HoltError::UnsupportedVersion(version));
        }
        let kind = NodeKind::from_u8(buf[6])
            .ok_or_else(|| HoltError::PayloadDecode(format!("unknown node kind {}", buf[6])))?;
        let le_u16 = |r: std::ops::Range<usize>| {
            u16::from_le_bytes(buf[r].try_into().expect("slice length checked"))
        };
        let le_u64 = |r: std::ops::Range<usize>| {
            u64::from_le_bytes(buf[r].try_into().expect("slice length checked"))
        };
        let le_f64 = |r: std::ops::Range<usize>| {
            f64::from_le_bytes(buf[r].try_into().expect("slice length checked"))
        };
        Ok(Self {
            version,
            kind,
            level: buf[7] as u16,
            fanout_index: le_u16(8..10),
            payload_size: le_u16(10..12),
            param_id: le_u64(12..20),
            addr: le_u64(20..28),
            tmin: le_u64(28..36),
            tmax: le_u64(36..44),
            count: le_u64(44..52),
            min: le_f64(52..60),
            max: le_f64(60..68),
            sum: le_f64(68..76),
            min_time: le_u64(76..84),
            max_time: le_u64(84..92),
            first: le_f64(92..100),
            last: le_f64(100..108),
            checksum: u32::from_le_bytes(buf[108..112].try_into().expect("slice length checked")),
        })
    }

    /// Strips block-local fields, producing the child entry published to
    /// the parent after the node was sealed at `addr`.
    pub fn child_entry(&self, addr: LogicAddr) -> NodeSummary {
        let mut entry = *self;
        entry.addr = addr;
        entry.payload_size = 0;
        entry.checksum = 0;
        entry
    }
}

/// Reads a block and verifies magic, version, payload checksum and series
/// ownership. All tree-level reads go through this.
pub fn read_and_check(
    bstore: &dyn BlockStore,
    addr: LogicAddr,
    param_id: ParamId,
) -> Result<(Block, NodeSummary)> {
    let block = bstore.read_block(addr)?;
    let summary = NodeSummary::read_from(&block.bytes()[..SUMMARY_SIZE])?;
    let payload_size = summary.payload_size as usize;
    if SUMMARY_SIZE + payload_size > BLOCK_SIZE {
        return Err(HoltError::PayloadDecode(format!(
            "payload size {} exceeds block capacity",
            payload_size
        )));
    }
    let payload = &block.bytes()[SUMMARY_SIZE..SUMMARY_SIZE + payload_size];
    let actual = checksum(payload);
    if actual != summary.checksum {
        warn!(addr, level = summary.level, "invalid block checksum");
        return Err(HoltError::ChecksumMismatch {
            expected: summary.checksum,
            actual,
        });
    }
    if summary.param_id != param_id {
        return Err(HoltError::SeriesMismatch {
            expected: param_id,
            actual: summary.param_id,
        });
    }
    Ok((block, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EMPTY_ADDR;

    fn sample_summary() -> NodeSummary {
        let mut s = NodeSummary::empty(NodeKind::Leaf, 42, 0, EMPTY_ADDR, 3);
        s.observe(100, 1.5);
        s.observe(110, -2.5);
        s.observe(120, 0.25);
        s
    }

    #[test]
    fn test_summary_roundtrip() {
        let summary = sample_summary();
        let mut buf = [0u8; SUMMARY_SIZE];
        summary.write_to(&mut buf);
        let decoded = NodeSummary::read_from(&buf).unwrap();
        assert_eq!(summary, decoded);
    }

    #[test]
    fn test_summary_rejects_bad_magic() {
        let mut buf = [0u8; SUMMARY_SIZE];
        sample_summary().write_to(&mut buf);
        buf[0] = b'X';
        assert!(matches!(
            NodeSummary::read_from(&buf),
            Err(HoltError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_summary_rejects_bad_version() {
        let mut buf = [0u8; SUMMARY_SIZE];
        sample_summary().write_to(&mut buf);
        buf[4] = 0xFF;
        assert!(matches!(
            NodeSummary::read_from(&buf),
            Err(HoltError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_observe_tracks_extremes() {
        let s = sample_summary();
        assert_eq!(s.count, 3);
        assert_eq!((s.tmin, s.tmax), (100, 120));
        assert_eq!((s.min, s.min_time), (-2.5, 110));
        assert_eq!((s.max, s.max_time), (1.5, 100));
        assert_eq!((s.first, s.last), (1.5, 0.25));
        assert!((s.sum - (-0.75)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_absorb_child_rolls_up() {
        let mut parent = NodeSummary::empty(NodeKind::Superblock, 42, 1, EMPTY_ADDR, 0);
        let mut a = NodeSummary::empty(NodeKind::Leaf, 42, 0, EMPTY_ADDR, 0);
        a.observe(10, 5.0);
        a.observe(20, 7.0);
        let mut b = NodeSummary::empty(NodeKind::Leaf, 42, 0, EMPTY_ADDR, 1);
        b.observe(30, -1.0);
        b.observe(40, 2.0);

        parent.absorb_child(&a);
        parent.absorb_child(&b);

        assert_eq!(parent.count, 4);
        assert_eq!((parent.tmin, parent.tmax), (10, 40));
        assert_eq!((parent.first, parent.last), (5.0, 2.0));
        assert_eq!((parent.min, parent.min_time), (-1.0, 30));
        assert_eq!((parent.max, parent.max_time), (7.0, 20));
        assert!((parent.sum - 13.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_overlaps() {
        let s = sample_summary();
        assert!(s.overlaps(0, 1000));
        assert!(s.overlaps(120, 121));
        assert!(s.overlaps(0, 100));
        assert!(!s.overlaps(0, 99));
        assert!(!s.overlaps(121, 1000));
    }
}
