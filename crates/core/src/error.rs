//! Unified error type for the vtm substrate.
//!
//! Every crate in the workspace (`vtm-storage`, `vtm-concurrency`,
//! `vtm-durability`) converts its local failures into this one enum at the
//! crate boundary, the same way `strata-core::StrataError` is the single
//! error surface the rest of Strata converts into.

use thiserror::Error;

/// Result type alias used throughout the substrate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the transactional virtual-memory substrate.
#[derive(Debug, Error)]
pub enum Error {
    /// An address or pointer does not lie in any mapped segment.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// Allocation cannot be satisfied and the segment manager declined to grow.
    #[error("no memory available: {0}")]
    NoMemory(String),

    /// Segment seal, heap block signature, or WAL header failed validation.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A bounded retry loop over a contended lock exhausted its attempts.
    #[error("concurrent lock retries exhausted")]
    ConcurrentLock,

    /// `commit`/`rollback` called on a transaction that has already ended.
    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    /// A WAL write or flush failed; the caller's transaction has been rolled back.
    #[error("durability failure: {0}")]
    Durability(String),

    /// The free list has enough total bytes across buckets but no single block
    /// large enough to satisfy the request; a compacting pass could help.
    #[error("no single block large enough: need {needed} bytes, largest free block is {largest} bytes")]
    MemoryNeedCompression {
        /// Bytes requested by the failed allocation.
        needed: u32,
        /// Size of the largest free block found while searching.
        largest: u32,
    },

    /// Passthrough I/O error from the backing file or WAL segment files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error represents a transient lock contention that a
    /// caller may retry the whole operation for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrentLock)
    }

    /// Whether this error indicates on-disk or in-memory structural
    /// corruption rather than a transient or caller-correctable condition.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}
