//! Error and Result types for Holt storage operations.

use crate::store::LogicAddr;
use crate::tree::{ParamId, Timestamp};
use std::io;
use thiserror::Error;

/// A convenience `Result` type for Holt operations.
pub type Result<T> = std::result::Result<T, HoltError>;

/// The error type for storage core operations.
#[derive(Debug, Error)]
pub enum HoltError {
    /// Timestamp is not strictly greater than the last accepted one.
    #[error("late write: timestamp {ts} <= last accepted {last}")]
    LateWrite {
        /// Rejected timestamp.
        ts: Timestamp,
        /// Last timestamp accepted by the series.
        last: Timestamp,
    },

    /// Output buffer too small for a required single-element result.
    #[error("output buffer too small")]
    BadArg,

    /// Node cannot accept another entry. Absorbed by the sealing
    /// machinery, never surfaced through `ExtentsList`.
    #[error("node is full")]
    Overflow,

    /// Attempt to modify a node loaded from a sealed block.
    #[error("node is sealed and cannot be modified")]
    Immutable,

    /// Tree was opened with non-empty roots but `force_init` has not run.
    #[error("extents list is not initialized")]
    Uninitialized,

    /// Requested address was never written to the block store.
    #[error("block not found at address {0}")]
    BlockNotFound(LogicAddr),

    /// Invalid magic bytes in a block header.
    #[error("invalid magic bytes: expected HOLT, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported block format version.
    #[error("unsupported block format version: {0}")]
    UnsupportedVersion(u16),

    /// Block payload checksum does not match the header.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC32 stored in the block header.
        expected: u32,
        /// CRC32 computed over the payload.
        actual: u32,
    },

    /// Block belongs to a different series.
    #[error("series id mismatch: expected {expected}, got {actual}")]
    SeriesMismatch {
        /// Series the tree was opened with.
        expected: ParamId,
        /// Series id found in the block header.
        actual: ParamId,
    },

    /// Block has an unexpected tree level.
    #[error("node level mismatch: expected {expected}, got {actual}")]
    LevelMismatch {
        /// Level required by the referencing node.
        expected: u16,
        /// Level found in the block header.
        actual: u16,
    },

    /// Block payload could not be decoded.
    #[error("payload decode failed: {0}")]
    PayloadDecode(String),

    /// Stored rollup disagrees with the referenced subtree.
    #[error("inconsistent node at address {addr}: bad {field}")]
    InconsistentNode {
        /// Address of the faulty block.
        addr: LogicAddr,
        /// Name of the mismatching header field.
        field: &'static str,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HoltError {
    /// Returns true if the error indicates an unresolvable address.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HoltError::BlockNotFound(_))
    }

    /// Returns true for errors that indicate on-disk corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HoltError::InvalidMagic(_)
                | HoltError::UnsupportedVersion(_)
                | HoltError::ChecksumMismatch { .. }
                | HoltError::SeriesMismatch { .. }
                | HoltError::LevelMismatch { .. }
                | HoltError::PayloadDecode(_)
                | HoltError::InconsistentNode { .. }
        )
    }
}
