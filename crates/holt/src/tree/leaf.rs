//! Level-0 node: compressed samples packed into one block.

use crate::error::{HoltError, Result};
use crate::store::{checksum, Block, BlockStore, LogicAddr, BLOCK_SIZE, EMPTY_ADDR};
use crate::tree::codec::{
    BitBuf, TimestampDecoder, TimestampEncoder, ValueDecoder, ValueEncoder,
};
use crate::tree::scan::{
    ChainScanner, LeafAggregator, LeafGroupAggregator, LeafScanner, PointScanner,
};
use crate::tree::{read_and_check, NodeKind, NodeSummary, ParamId, Timestamp, SUMMARY_SIZE};
use bitvec::prelude::*;

/// Payload bytes available in a leaf block.
pub const LEAF_CAPACITY: usize = BLOCK_SIZE - SUMMARY_SIZE;

/// Fixed prefix of a leaf payload: sample count and the bit lengths of the
/// two streams.
const PAYLOAD_PREFIX: usize = 12;

/// A level-0 node accumulating `(timestamp, value)` pairs in compressed
/// form, or a sealed leaf loaded back from the block store.
///
/// An open leaf signals [`HoltError::Overflow`] when the next pair would
/// not fit into the block; the rejected pair is not consumed and belongs in
/// the next leaf.
pub struct LeafNode {
    summary: NodeSummary,
    ts_bits: BitBuf,
    val_bits: BitBuf,
    ts_enc: TimestampEncoder,
    val_enc: ValueEncoder,
    /// Present when the leaf was loaded from a sealed block.
    block: Option<Block>,
}

impl LeafNode {
    /// Creates an empty open leaf.
    ///
    /// `prev` is the previous sealed leaf at this level ([`EMPTY_ADDR`] for
    /// the first one) and `fanout_index` the position this leaf will take
    /// among its parent's children.
    pub fn new(param_id: ParamId, prev: LogicAddr, fanout_index: u16) -> Self {
        debug_assert!((prev == EMPTY_ADDR) == (fanout_index == 0));
        Self {
            summary: NodeSummary::empty(NodeKind::Leaf, param_id, 0, prev, fanout_index),
            ts_bits: BitBuf::new(),
            val_bits: BitBuf::new(),
            ts_enc: TimestampEncoder::new(),
            val_enc: ValueEncoder::new(),
            block: None,
        }
    }

    /// Wraps a sealed leaf block that has already been verified.
    pub fn from_block(block: Block) -> Result<Self> {
        let summary = NodeSummary::read_from(&block.bytes()[..SUMMARY_SIZE])?;
        Ok(Self {
            summary,
            ts_bits: BitBuf::new(),
            val_bits: BitBuf::new(),
            ts_enc: TimestampEncoder::new(),
            val_enc: ValueEncoder::new(),
            block: Some(block),
        })
    }

    /// Loads and verifies a sealed leaf from the block store.
    pub fn load(bstore: &dyn BlockStore, addr: LogicAddr, param_id: ParamId) -> Result<Self> {
        let (block, summary) = read_and_check(bstore, addr, param_id)?;
        if summary.level != 0 {
            return Err(HoltError::LevelMismatch {
                expected: 0,
                actual: summary.level,
            });
        }
        Self::from_block(block)
    }

    /// Node metadata with the running rollup.
    pub fn summary(&self) -> &NodeSummary {
        &self.summary
    }

    /// Number of samples in the leaf.
    pub fn count(&self) -> u64 {
        self.summary.count
    }

    /// Address of the previous sealed leaf, or [`EMPTY_ADDR`].
    pub fn prev_addr(&self) -> LogicAddr {
        self.summary.addr
    }

    /// Position among the parent's children.
    pub fn fanout_index(&self) -> u16 {
        self.summary.fanout_index
    }

    /// First and last timestamps in the leaf.
    pub fn timestamps(&self) -> (Timestamp, Timestamp) {
        (self.summary.tmin, self.summary.tmax)
    }

    fn payload_len(&self) -> usize {
        PAYLOAD_PREFIX + self.ts_bits.len().div_ceil(8) + self.val_bits.len().div_ceil(8)
    }

    /// Appends a sample.
    ///
    /// Fails with `LateWrite` if `ts` is not strictly greater than the last
    /// appended timestamp, with `Overflow` when the compressed pair would
    /// not fit (the pair is not consumed), and with `Immutable` on a leaf
    /// loaded from a sealed block.
    pub fn append(&mut self, ts: Timestamp, value: f64) -> Result<()> {
        if self.block.is_some() {
            return Err(HoltError::Immutable);
        }
        if self.summary.count > 0 && ts <= self.summary.tmax {
            return Err(HoltError::LateWrite {
                ts,
                last: self.summary.tmax,
            });
        }

        let ts_mark = self.ts_bits.len();
        let val_mark = self.val_bits.len();
        let ts_enc_mark = self.ts_enc.clone();
        let val_enc_mark = self.val_enc.clone();

        self.ts_enc.encode(ts, &mut self.ts_bits);
        self.val_enc.encode(value, &mut self.val_bits);

        if self.payload_len() > LEAF_CAPACITY {
            self.ts_bits.truncate(ts_mark);
            self.val_bits.truncate(val_mark);
            self.ts_enc = ts_enc_mark;
            self.val_enc = val_enc_mark;
            return Err(HoltError::Overflow);
        }

        self.summary.observe(ts, value);
        Ok(())
    }

    /// Decodes every sample in the leaf, in timestamp order.
    pub fn read_all(&self) -> Result<(Vec<Timestamp>, Vec<f64>)> {
        match &self.block {
            Some(block) => {
                let payload_size = self.summary.payload_size as usize;
                let payload = &block.bytes()[SUMMARY_SIZE..SUMMARY_SIZE + payload_size];
                if payload.len() < PAYLOAD_PREFIX {
                    return Err(HoltError::PayloadDecode("leaf payload too short".into()));
                }
                let count =
                    u32::from_le_bytes(payload[0..4].try_into().expect("slice length checked"));
                let ts_bit_len =
                    u32::from_le_bytes(payload[4..8].try_into().expect("slice length checked"))
                        as usize;
                let val_bit_len =
                    u32::from_le_bytes(payload[8..12].try_into().expect("slice length checked"))
                        as usize;
                let ts_bytes = ts_bit_len.div_ceil(8);
                let val_bytes = val_bit_len.div_ceil(8);
                if PAYLOAD_PREFIX + ts_bytes + val_bytes > payload.len() {
                    return Err(HoltError::PayloadDecode(
                        "leaf bit streams exceed payload".into(),
                    ));
                }
                let ts_stream =
                    &payload[PAYLOAD_PREFIX..PAYLOAD_PREFIX + ts_bytes].view_bits::<Msb0>()
                        [..ts_bit_len];
                let val_stream = &payload
                    [PAYLOAD_PREFIX + ts_bytes..PAYLOAD_PREFIX + ts_bytes + val_bytes]
                    .view_bits::<Msb0>()[..val_bit_len];
                decode_streams(count as u64, ts_stream, val_stream)
            }
            None => decode_streams(self.summary.count, &self.ts_bits, &self.val_bits),
        }
    }

    /// Writes the leaf to the block store and returns its address.
    ///
    /// The in-memory leaf is not consumed; the caller (the extent) resets
    /// it after a successful seal.
    pub fn seal(&self, bstore: &dyn BlockStore) -> Result<LogicAddr> {
        if self.block.is_some() {
            return Err(HoltError::Immutable);
        }
        if self.summary.count == 0 {
            return Err(HoltError::BadArg);
        }
        let mut buf = [0u8; BLOCK_SIZE];
        let payload_size = self.payload_len();
        {
            let payload = &mut buf[SUMMARY_SIZE..SUMMARY_SIZE + payload_size];
            payload[0..4].copy_from_slice(&(self.summary.count as u32).to_le_bytes());
            payload[4..8].copy_from_slice(&(self.ts_bits.len() as u32).to_le_bytes());
            payload[8..12].copy_from_slice(&(self.val_bits.len() as u32).to_le_bytes());
            let ts_bytes = self.ts_bits.len().div_ceil(8);
            payload[PAYLOAD_PREFIX..PAYLOAD_PREFIX + ts_bytes]
                .copy_from_slice(self.ts_bits.as_raw_slice());
            payload[PAYLOAD_PREFIX + ts_bytes..]
                .copy_from_slice(self.val_bits.as_raw_slice());
        }
        let mut header = self.summary;
        header.payload_size = payload_size as u16;
        header.checksum = checksum(&buf[SUMMARY_SIZE..SUMMARY_SIZE + payload_size]);
        header.write_to(&mut buf[..SUMMARY_SIZE]);
        bstore.append_block(&buf)
    }

    /// Range iterator over this leaf only.
    ///
    /// Forward if `begin < end`, backward otherwise; see [`LeafScanner`]
    /// for the exact bound semantics.
    pub fn range(&self, begin: Timestamp, end: Timestamp) -> Result<LeafScanner> {
        LeafScanner::new(self, begin, end)
    }

    /// Single-row aggregate over the filtered range.
    pub fn aggregate(&self, begin: Timestamp, end: Timestamp) -> Result<LeafAggregator> {
        LeafAggregator::new(self, begin, end)
    }

    /// Stepped aggregate over the filtered range.
    pub fn group_aggregate(
        &self,
        begin: Timestamp,
        end: Timestamp,
        step: u64,
    ) -> Result<LeafGroupAggregator> {
        LeafGroupAggregator::new(self, begin, end, step)
    }

    /// Scans this leaf together with its sealed siblings, walking `prev`
    /// links backward from this node. Used when a series has no superblock
    /// levels yet.
    pub fn search_chain(
        &self,
        begin: Timestamp,
        end: Timestamp,
        bstore: &dyn BlockStore,
    ) -> Result<Box<dyn PointScanner>> {
        let min = begin.min(end);
        let max = begin.max(end);
        let mut scanners: Vec<Box<dyn PointScanner>> = Vec::new();
        if end <= begin && self.summary.count > 0 && self.summary.overlaps(min, max) {
            scanners.push(Box::new(self.range(begin, end)?));
        }
        let mut addr = self.prev_addr();
        while bstore.exists(addr) {
            let leaf = LeafNode::load(bstore, addr, self.summary.param_id)?;
            let (tmin, tmax) = leaf.timestamps();
            if max < tmin {
                break;
            }
            if min <= tmax {
                scanners.push(Box::new(leaf.range(begin, end)?));
            }
            addr = leaf.prev_addr();
        }
        if begin < end {
            scanners.reverse();
            if self.summary.count > 0 && self.summary.overlaps(min, max) {
                scanners.push(Box::new(self.range(begin, end)?));
            }
        }
        if scanners.len() == 1 {
            return Ok(scanners.pop().expect("length checked"));
        }
        Ok(Box::new(ChainScanner::new(scanners, begin, end)))
    }
}

fn decode_streams(
    count: u64,
    ts_bits: &BitSlice<u8, Msb0>,
    val_bits: &BitSlice<u8, Msb0>,
) -> Result<(Vec<Timestamp>, Vec<f64>)> {
    let mut timestamps = Vec::with_capacity(count as usize);
    let mut values = Vec::with_capacity(count as usize);
    let mut ts_dec = TimestampDecoder::new(ts_bits);
    let mut val_dec = ValueDecoder::new(val_bits);
    for ix in 0..count {
        let ts = ts_dec
            .decode_next()
            .ok_or_else(|| HoltError::PayloadDecode(format!("timestamp stream ended at {ix}")))?;
        let value = val_dec
            .decode_next()
            .ok_or_else(|| HoltError::PayloadDecode(format!("value stream ended at {ix}")))?;
        timestamps.push(ts);
        values.push(value);
    }
    Ok((timestamps, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlockStore;
    use crate::tree::scan::ReadStatus;

    #[test]
    fn test_append_and_read_all() {
        let mut leaf = LeafNode::new(42, EMPTY_ADDR, 0);
        for i in 0..100u64 {
            leaf.append(1000 + i * 10, i as f64 * 0.5).unwrap();
        }
        let (ts, xs) = leaf.read_all().unwrap();
        assert_eq!(ts.len(), 100);
        assert_eq!(ts[0], 1000);
        assert_eq!(ts[99], 1990);
        assert_eq!(xs[99], 49.5);
    }

    #[test]
    fn test_rejects_late_write() {
        let mut leaf = LeafNode::new(42, EMPTY_ADDR, 0);
        leaf.append(100, 1.0).unwrap();
        assert!(matches!(
            leaf.append(100, 2.0),
            Err(HoltError::LateWrite { .. })
        ));
        assert!(matches!(
            leaf.append(99, 2.0),
            Err(HoltError::LateWrite { .. })
        ));
        leaf.append(101, 2.0).unwrap();
    }

    #[test]
    fn test_overflow_keeps_leaf_usable() {
        let mut leaf = LeafNode::new(42, EMPTY_ADDR, 0);
        let mut rng = 0x2545F4914F6CDD1Du64;
        let mut i = 0u64;
        loop {
            // Full-entropy values defeat the XOR codec so the leaf fills
            // after a few hundred samples.
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            let value = f64::from_bits(0x3FF0000000000000 | (rng >> 12));
            match leaf.append(i, value) {
                Ok(()) => i += 1,
                Err(HoltError::Overflow) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(leaf.count(), i);
        let (ts, _) = leaf.read_all().unwrap();
        assert_eq!(ts.len() as u64, i);

        // The rejected sample was not consumed and the leaf still seals.
        let bstore = MemoryBlockStore::new();
        let addr = leaf.seal(&bstore).unwrap();
        assert_eq!(addr, 0);
    }

    #[test]
    fn test_seal_and_reload() {
        let bstore = MemoryBlockStore::new();
        let mut leaf = LeafNode::new(42, EMPTY_ADDR, 0);
        for i in 0..500u64 {
            leaf.append(i, (i % 17) as f64).unwrap();
        }
        let addr = leaf.seal(&bstore).unwrap();

        let loaded = LeafNode::load(&bstore, addr, 42).unwrap();
        assert_eq!(loaded.count(), 500);
        assert_eq!(loaded.timestamps(), (0, 499));
        let (ts, xs) = loaded.read_all().unwrap();
        assert_eq!(ts, (0..500).collect::<Vec<_>>());
        assert_eq!(xs[16], 16.0);

        assert!(matches!(
            LeafNode::load(&bstore, addr, 43),
            Err(HoltError::SeriesMismatch { .. })
        ));
    }

    #[test]
    fn test_sealed_leaf_is_immutable() {
        let bstore = MemoryBlockStore::new();
        let mut leaf = LeafNode::new(42, EMPTY_ADDR, 0);
        leaf.append(1, 1.0).unwrap();
        let addr = leaf.seal(&bstore).unwrap();
        let mut loaded = LeafNode::load(&bstore, addr, 42).unwrap();
        assert!(matches!(loaded.append(2, 2.0), Err(HoltError::Immutable)));
    }

    #[test]
    fn test_empty_leaf_does_not_seal() {
        let bstore = MemoryBlockStore::new();
        let leaf = LeafNode::new(42, EMPTY_ADDR, 0);
        assert!(matches!(leaf.seal(&bstore), Err(HoltError::BadArg)));
    }

    #[test]
    fn test_search_chain_over_siblings() {
        let bstore = MemoryBlockStore::new();
        let mut prev = EMPTY_ADDR;
        let mut ts = 0u64;
        for fanout in 0..3u16 {
            let mut leaf = LeafNode::new(42, prev, fanout);
            for _ in 0..100 {
                leaf.append(ts, ts as f64).unwrap();
                ts += 1;
            }
            prev = leaf.seal(&bstore).unwrap();
        }
        let mut open = LeafNode::new(42, prev, 3);
        for _ in 0..50 {
            open.append(ts, ts as f64).unwrap();
            ts += 1;
        }

        let mut scanner = open.search_chain(0, 1000, &bstore).unwrap();
        let mut ts_out = vec![0u64; 400];
        let mut val_out = vec![0f64; 400];
        let (status, n) = scanner.read(&mut ts_out, &mut val_out).unwrap();
        assert_eq!(n, 350);
        assert_eq!(status, ReadStatus::NoData);
        assert_eq!(ts_out[..350], (0..350).collect::<Vec<_>>()[..]);

        // Backward over a subrange: (50, 250].
        let mut scanner = open.search_chain(250, 50, &bstore).unwrap();
        let (status, n) = scanner.read(&mut ts_out, &mut val_out).unwrap();
        assert_eq!(n, 200);
        assert_eq!(status, ReadStatus::NoData);
        assert_eq!(ts_out[0], 250);
        assert_eq!(ts_out[199], 51);
    }
}
