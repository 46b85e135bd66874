//! File-backed block store.

use crate::error::{HoltError, Result};
use crate::store::{Block, BlockStore, CommitCallback, LogicAddr, BLOCK_SIZE, EMPTY_ADDR};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Block store backed by fixed-size slots in a single file.
///
/// The slot index is the logical address, so the store needs no separate
/// allocation metadata: the next address is derived from the file length on
/// open. Every append is flushed and synced before the address is handed
/// out, which keeps the "never silently truncates" contract even across a
/// crash.
pub struct FileBlockStore {
    file: Mutex<File>,
    nblocks: AtomicU64,
    on_commit: Option<CommitCallback>,
}

impl FileBlockStore {
    /// Opens (or creates) a store file at `path`.
    ///
    /// A partially written trailing slot, left by a crash in the middle of
    /// an append, is ignored; the next append overwrites it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_inner(path.as_ref(), None)
    }

    /// Same as [`open`](Self::open), with a commit callback invoked after
    /// every successful append.
    pub fn open_with_commit_callback<P: AsRef<Path>>(path: P, cb: CommitCallback) -> Result<Self> {
        Self::open_inner(path.as_ref(), Some(cb))
    }

    fn open_inner(path: &Path, on_commit: Option<CommitCallback>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let nblocks = len / BLOCK_SIZE as u64;
        if len % BLOCK_SIZE as u64 != 0 {
            warn!(
                path = %path.display(),
                len,
                "block store file has a partial trailing slot, ignoring it"
            );
        }
        Ok(Self {
            file: Mutex::new(file),
            nblocks: AtomicU64::new(nblocks),
            on_commit,
        })
    }

    /// Number of blocks currently stored.
    pub fn len(&self) -> u64 {
        self.nblocks.load(Ordering::Acquire)
    }

    /// Returns true if no block was ever appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for FileBlockStore {
    fn append_block(&self, data: &[u8; BLOCK_SIZE]) -> Result<LogicAddr> {
        let addr = {
            let mut file = self.file.lock().expect("block store lock poisoned");
            let addr = self.nblocks.load(Ordering::Acquire);
            file.seek(SeekFrom::Start(addr * BLOCK_SIZE as u64))?;
            file.write_all(data)?;
            file.sync_data()?;
            // Publish the slot only after the bytes are durable.
            self.nblocks.store(addr + 1, Ordering::Release);
            addr
        };
        if let Some(cb) = &self.on_commit {
            cb(addr);
        }
        Ok(addr)
    }

    fn read_block(&self, addr: LogicAddr) -> Result<Block> {
        if !self.exists(addr) {
            return Err(HoltError::BlockNotFound(addr));
        }
        let mut data = [0u8; BLOCK_SIZE];
        {
            let mut file = self.file.lock().expect("block store lock poisoned");
            file.seek(SeekFrom::Start(addr * BLOCK_SIZE as u64))?;
            file.read_exact(&mut data)?;
        }
        Ok(Block::new(data))
    }

    fn exists(&self, addr: LogicAddr) -> bool {
        addr != EMPTY_ADDR && addr < self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pattern_block(tag: u8) -> [u8; BLOCK_SIZE] {
        let mut data = [tag; BLOCK_SIZE];
        data[0] = tag.wrapping_add(1);
        data
    }

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileBlockStore::open(dir.path().join("blocks.holt")).unwrap();

        let a = store.append_block(&pattern_block(1)).unwrap();
        let b = store.append_block(&pattern_block(2)).unwrap();
        assert_eq!((a, b), (0, 1));

        assert_eq!(store.read_block(a).unwrap().bytes()[1], 1);
        assert_eq!(store.read_block(b).unwrap().bytes()[1], 2);
    }

    #[test]
    fn test_reopen_preserves_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.holt");
        {
            let store = FileBlockStore::open(&path).unwrap();
            store.append_block(&pattern_block(7)).unwrap();
            store.append_block(&pattern_block(8)).unwrap();
        }
        let store = FileBlockStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.read_block(1).unwrap().bytes()[1], 8);
        assert_eq!(store.append_block(&pattern_block(9)).unwrap(), 2);
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = TempDir::new().unwrap();
        let store = FileBlockStore::open(dir.path().join("blocks.holt")).unwrap();
        assert!(store.read_block(0).unwrap_err().is_not_found());
        assert!(!store.exists(EMPTY_ADDR));
    }
}
