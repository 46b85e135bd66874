//! Volatile in-memory block store.

use crate::error::{HoltError, Result};
use crate::store::{Block, BlockStore, CommitCallback, LogicAddr, BLOCK_SIZE, EMPTY_ADDR};
use std::sync::RwLock;

/// Block store backed by a growable in-memory vector.
///
/// Blocks are dropped together with the store; this implementation exists
/// for tests and for trees that never need to survive the process.
pub struct MemoryBlockStore {
    blocks: RwLock<Vec<Block>>,
    on_commit: Option<CommitCallback>,
}

impl MemoryBlockStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            on_commit: None,
        }
    }

    /// Creates an empty store that invokes `cb` with the address of every
    /// successfully appended block.
    pub fn with_commit_callback(cb: CommitCallback) -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            on_commit: Some(cb),
        }
    }

    /// Number of blocks currently stored.
    pub fn len(&self) -> usize {
        self.blocks.read().expect("block store lock poisoned").len()
    }

    /// Returns true if no block was ever appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryBlockStore {
    fn append_block(&self, data: &[u8; BLOCK_SIZE]) -> Result<LogicAddr> {
        let addr = {
            let mut blocks = self.blocks.write().expect("block store lock poisoned");
            blocks.push(Block::new(*data));
            (blocks.len() - 1) as LogicAddr
        };
        if let Some(cb) = &self.on_commit {
            cb(addr);
        }
        Ok(addr)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Block> {
        let blocks = self.blocks.read().expect("block store lock poisoned");
        blocks
            .get(addr as usize)
            .cloned()
            .ok_or(HoltError::BlockNotFound(addr))
    }

    fn exists(&self, addr: LogicAddr) -> bool {
        if addr == EMPTY_ADDR {
            return false;
        }
        (addr as usize) < self.len()
    }
}
