//! Property-based tests for the leaf codec.
//!
//! The delta-of-delta timestamp codec and the XOR value codec must be
//! lossless for monotonic ticks and arbitrary IEEE-754 doubles; the leaf
//! payload must survive a seal/load round trip bit-exactly.

use holt::tree::codec::{
    BitBuf, TimestampDecoder, TimestampEncoder, ValueDecoder, ValueEncoder,
};
use holt::{HoltError, LeafNode, MemoryBlockStore, EMPTY_ADDR};
use proptest::prelude::*;

/// Monotonic timestamps built from a base plus bounded positive deltas.
fn timestamp_strategy() -> impl Strategy<Value = Vec<u64>> {
    (
        0u64..1_000_000_000_000,
        prop::collection::vec(1u64..1_000_000_000, 1..200),
    )
        .prop_map(|(base, deltas)| {
            let mut out = vec![base];
            let mut current = base;
            for delta in deltas {
                current += delta;
                out.push(current);
            }
            out
        })
}

proptest! {
    #[test]
    fn test_timestamp_roundtrip_proptest(timestamps in timestamp_strategy()) {
        let mut output = BitBuf::new();
        let mut encoder = TimestampEncoder::new();
        for &ts in &timestamps {
            encoder.encode(ts, &mut output);
        }
        let mut decoder = TimestampDecoder::new(&output);
        for &expected in &timestamps {
            prop_assert_eq!(decoder.decode_next(), Some(expected));
        }
        prop_assert_eq!(decoder.decode_next(), None);
    }

    #[test]
    fn test_value_roundtrip_proptest(values in prop::collection::vec(any::<f64>(), 1..200)) {
        let mut output = BitBuf::new();
        let mut encoder = ValueEncoder::new();
        for &val in &values {
            encoder.encode(val, &mut output);
        }
        // Bit-exact comparison; NaN payloads must survive too.
        let mut decoder = ValueDecoder::new(&output);
        for &expected in &values {
            let decoded = decoder.decode_next();
            prop_assert!(decoded.is_some());
            prop_assert_eq!(expected.to_bits(), decoded.unwrap().to_bits());
        }
    }

    #[test]
    fn test_leaf_seal_roundtrip(
        base in 0u64..1_000_000_000,
        deltas in prop::collection::vec(1u64..100_000, 1..400),
        seed in any::<u64>(),
    ) {
        let bstore = MemoryBlockStore::new();
        let mut leaf = LeafNode::new(7, EMPTY_ADDR, 0);
        let mut appended = Vec::new();
        let mut ts = base;
        let mut rng = seed | 1;
        for delta in deltas {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            let value = f64::from_bits(0x3FF0000000000000 | (rng >> 12));
            match leaf.append(ts, value) {
                Ok(()) => appended.push((ts, value)),
                Err(HoltError::Overflow) => break,
                Err(e) => return Err(TestCaseError::fail(format!("append failed: {e}"))),
            }
            ts += delta;
        }
        prop_assert!(!appended.is_empty());

        let addr = leaf.seal(&bstore).unwrap();
        let loaded = LeafNode::load(&bstore, addr, 7).unwrap();
        let (ts_out, xs_out) = loaded.read_all().unwrap();
        prop_assert_eq!(ts_out.len(), appended.len());
        for (ix, &(t, x)) in appended.iter().enumerate() {
            prop_assert_eq!(ts_out[ix], t);
            prop_assert_eq!(xs_out[ix].to_bits(), x.to_bits());
        }
    }
}
