//! Block store abstraction and implementations.
//!
//! The storage core performs all I/O through the [`BlockStore`] trait: an
//! append-only collection of fixed-size blocks addressed by a monotonically
//! increasing logical address. Addresses are never reused, so a block that
//! was written once stays readable at the same address for the lifetime of
//! the store.
//!
//! Two implementations are provided:
//!
//! - [`MemoryBlockStore`]: volatile, for tests and short-lived trees
//! - [`FileBlockStore`]: fixed-size slots in a single file
//!
//! A store may host blocks from many series; every block header carries the
//! owning series id.

mod file;
mod memory;

pub use file::FileBlockStore;
pub use memory::MemoryBlockStore;

use crate::error::Result;
use std::sync::Arc;

/// Logical block address assigned by the block store.
pub type LogicAddr = u64;

/// Sentinel address meaning "no block".
pub const EMPTY_ADDR: LogicAddr = LogicAddr::MAX;

/// Size of a single block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Callback invoked after every successful block append with the new
/// address. Used by recovery code to track the last durable write.
pub type CommitCallback = Arc<dyn Fn(LogicAddr) + Send + Sync>;

/// An immutable, cheaply cloneable block read from a store.
///
/// Iterators clone the `Block` they are decoding, which keeps the bytes
/// alive for as long as the iterator needs them regardless of any cache
/// eviction in the store.
#[derive(Debug, Clone)]
pub struct Block {
    data: Arc<[u8; BLOCK_SIZE]>,
}

impl Block {
    /// Wraps raw block bytes.
    pub fn new(data: [u8; BLOCK_SIZE]) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    /// Returns the block contents.
    pub fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }
}

/// Append-only fixed-size block storage.
///
/// Implementations must support a single writer with any number of
/// concurrent readers: an address returned by [`append_block`] is
/// immediately readable, and reads of addresses that were never allocated
/// fail with `BlockNotFound` rather than returning garbage.
///
/// [`append_block`]: BlockStore::append_block
pub trait BlockStore: Send + Sync {
    /// Writes a full block and returns its logical address.
    ///
    /// Addresses are strictly increasing and never reused. A failed append
    /// never leaves a partially visible block.
    fn append_block(&self, data: &[u8; BLOCK_SIZE]) -> Result<LogicAddr>;

    /// Reads the block previously written at `addr`.
    fn read_block(&self, addr: LogicAddr) -> Result<Block>;

    /// Returns true if `addr` resolves to a stored block.
    fn exists(&self, addr: LogicAddr) -> bool;
}

/// CRC32 checksum of a block payload, as stored in block headers.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}
