//! Bit-level compression for leaf payloads.
//!
//! Timestamps use delta-of-delta encoding, values use XOR-of-previous
//! encoding. Both are lossless for IEEE-754 doubles and monotonic ticks.
//!
//! # Timestamp encoding
//!
//! - First tick: 64 bits raw
//! - Subsequent ticks, by delta-of-delta:
//!   - `0`: `'0'` (1 bit)
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - else: `'1111'` + 64 bits
//!
//! # Value encoding
//!
//! - First value: 64 bits raw (IEEE-754)
//! - Subsequent values, by XOR with the previous one:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Same window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits
//!
//! Encoders carry a small amount of state and are `Clone`; the leaf
//! snapshots them before each sample so an append that would overflow the
//! block can be rolled back bit-exactly.

use crate::tree::Timestamp;
use bitvec::prelude::*;

/// Bitstream type shared by both codecs.
pub type BitBuf = BitVec<u8, Msb0>;

fn push_bits_u64(output: &mut BitBuf, value: u64, nbits: u32) {
    for i in (0..nbits).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Encoder for timestamps using delta-of-delta encoding.
#[derive(Debug, Clone, Default)]
pub struct TimestampEncoder {
    started: bool,
    prev_ts: Timestamp,
    prev_delta: i64,
}

impl TimestampEncoder {
    /// Creates a new timestamp encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a timestamp into the output bit buffer.
    pub fn encode(&mut self, ts: Timestamp, output: &mut BitBuf) {
        if !self.started {
            self.started = true;
            self.prev_ts = ts;
            self.prev_delta = 0;
            push_bits_u64(output, ts, 64);
            return;
        }

        let delta = ts.wrapping_sub(self.prev_ts) as i64;
        let dod = delta.wrapping_sub(self.prev_delta);

        if dod == 0 {
            output.push(false);
        } else if (-63..=64).contains(&dod) {
            output.push(true);
            output.push(false);
            push_bits_u64(output, (dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            output.push(true);
            output.push(true);
            output.push(false);
            push_bits_u64(output, (dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            output.push(true);
            output.push(true);
            output.push(true);
            output.push(false);
            push_bits_u64(output, (dod + 2047) as u64, 12);
        } else {
            output.push(true);
            output.push(true);
            output.push(true);
            output.push(true);
            push_bits_u64(output, dod as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_ts = ts;
    }
}

/// Decoder for delta-of-delta encoded timestamps.
pub struct TimestampDecoder<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    pos: usize,
    started: bool,
    prev_ts: Timestamp,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    /// Creates a new timestamp decoder over an encoded bit slice.
    pub fn new(bits: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            bits,
            pos: 0,
            started: false,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    fn take_bits(&mut self, nbits: u32) -> Option<u64> {
        if self.pos + nbits as usize > self.bits.len() {
            return None;
        }
        let mut out: u64 = 0;
        for _ in 0..nbits {
            out = (out << 1) | u64::from(self.bits[self.pos]);
            self.pos += 1;
        }
        Some(out)
    }

    /// Decodes the next timestamp, or `None` if the stream is exhausted.
    pub fn decode_next(&mut self) -> Option<Timestamp> {
        if !self.started {
            let ts = self.take_bits(64)?;
            self.started = true;
            self.prev_ts = ts;
            self.prev_delta = 0;
            return Some(ts);
        }

        if self.pos >= self.bits.len() {
            return None;
        }
        let dod = if !self.bits[self.pos] {
            self.pos += 1;
            0i64
        } else if !*self.bits.get(self.pos + 1)? {
            self.pos += 2;
            self.take_bits(7)? as i64 - 63
        } else if !*self.bits.get(self.pos + 2)? {
            self.pos += 3;
            self.take_bits(9)? as i64 - 255
        } else if !*self.bits.get(self.pos + 3)? {
            self.pos += 4;
            self.take_bits(12)? as i64 - 2047
        } else {
            self.pos += 4;
            self.take_bits(64)? as i64
        };

        let delta = self.prev_delta.wrapping_add(dod);
        let ts = self.prev_ts.wrapping_add(delta as u64);
        self.prev_delta = delta;
        self.prev_ts = ts;
        Some(ts)
    }
}

/// Encoder for float values using XOR compression.
#[derive(Debug, Clone, Default)]
pub struct ValueEncoder {
    started: bool,
    window_set: bool,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    /// Creates a new value encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a float value into the output bit buffer.
    pub fn encode(&mut self, value: f64, output: &mut BitBuf) {
        let bits = value.to_bits();

        if !self.started {
            self.started = true;
            self.prev_bits = bits;
            push_bits_u64(output, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_bits;
        if xor == 0 {
            output.push(false);
        } else {
            // Leading zeros are stored in 5 bits, so 31 is the ceiling; the
            // extra zeros simply land inside the meaningful range.
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if self.window_set && leading >= self.prev_leading && trailing >= self.prev_trailing {
                // Same window as the previous value.
                output.push(true);
                output.push(false);
                let meaningful = 64 - self.prev_leading - self.prev_trailing;
                push_bits_u64(output, xor >> self.prev_trailing, meaningful);
            } else {
                // New window: 5 bits leading, 6 bits length.
                output.push(true);
                output.push(true);
                push_bits_u64(output, leading as u64, 5);
                let meaningful = 64 - leading - trailing;
                push_bits_u64(output, (meaningful - 1) as u64, 6);
                push_bits_u64(output, xor >> trailing, meaningful);
                self.window_set = true;
                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_bits = bits;
    }
}

/// Decoder for XOR-encoded float values.
pub struct ValueDecoder<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    pos: usize,
    started: bool,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    /// Creates a new value decoder over an encoded bit slice.
    pub fn new(bits: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            bits,
            pos: 0,
            started: false,
            prev_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn take_bits(&mut self, nbits: u32) -> Option<u64> {
        if self.pos + nbits as usize > self.bits.len() {
            return None;
        }
        let mut out: u64 = 0;
        for _ in 0..nbits {
            out = (out << 1) | u64::from(self.bits[self.pos]);
            self.pos += 1;
        }
        Some(out)
    }

    /// Decodes the next value, or `None` if the stream is exhausted.
    pub fn decode_next(&mut self) -> Option<f64> {
        if !self.started {
            let bits = self.take_bits(64)?;
            self.started = true;
            self.prev_bits = bits;
            return Some(f64::from_bits(bits));
        }

        if self.pos >= self.bits.len() {
            return None;
        }
        let xor = if !self.bits[self.pos] {
            self.pos += 1;
            0u64
        } else if !*self.bits.get(self.pos + 1)? {
            self.pos += 2;
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            self.take_bits(meaningful)? << self.prev_trailing
        } else {
            self.pos += 2;
            let leading = self.take_bits(5)? as u32;
            let meaningful = self.take_bits(6)? as u32 + 1;
            let trailing = 64 - leading - meaningful;
            let xor = self.take_bits(meaningful)? << trailing;
            self.prev_leading = leading;
            self.prev_trailing = trailing;
            xor
        };

        let bits = self.prev_bits ^ xor;
        self.prev_bits = bits;
        Some(f64::from_bits(bits))
    }
}
