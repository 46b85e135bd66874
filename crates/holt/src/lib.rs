//! Holt - Lutra numeric B+tree storage core
//!
//! This crate provides the per-series storage primitive of the Lutra time
//! series database: an append-only, durable, recoverable tree of
//! fixed-size blocks, plus the range and aggregation iterators that read
//! from it.
//!
//! # Components
//!
//! - [`ExtentsList`]: the per-series tree of extents (write path, queries,
//!   close/reopen, crash recovery)
//! - [`LeafNode`] / [`SuperblockNode`]: compressed sample blocks and
//!   fixed-fanout index blocks
//! - [`BlockStore`]: append-only fixed-size block storage, with
//!   [`MemoryBlockStore`] and [`FileBlockStore`] implementations
//!
//! # Example
//!
//! ```rust,ignore
//! use holt::{AggregateFn, ExtentsList, MemoryBlockStore};
//! use std::sync::Arc;
//!
//! let bstore = Arc::new(MemoryBlockStore::new());
//! let mut series = ExtentsList::new(42, Vec::new(), bstore);
//!
//! // Append strictly monotonic samples.
//! for ts in 0..100_000u64 {
//!     series.append(ts, f64::from_bits(ts))?;
//! }
//!
//! // Range scan, chunked into caller-provided buffers.
//! let mut it = series.search(1_000, 2_000)?;
//! let (status, n) = it.read(&mut ts_buf, &mut val_buf)?;
//!
//! // O(height) aggregation off the stored rollups.
//! let mut sum = series.aggregate(0, 100_000, AggregateFn::Sum)?;
//!
//! // Durable shutdown; the returned roots reopen the series later.
//! let roots = series.close()?;
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod store;
pub mod tree;

pub use error::{HoltError, Result};
pub use store::{
    Block, BlockStore, CommitCallback, FileBlockStore, LogicAddr, MemoryBlockStore, BLOCK_SIZE,
    EMPTY_ADDR,
};
pub use tree::extents::{AppendStatus, Extent, ExtentsList, RepairStatus};
pub use tree::leaf::LeafNode;
pub use tree::scan::{
    AggregateFn, PointScanner, ReadStatus, Rollup, RollupScanner, ScanDirection,
};
pub use tree::superblock::SuperblockNode;
pub use tree::{NodeKind, NodeSummary, ParamId, Timestamp, FANOUT};
