//! Memory-mapped segments, the per-segment heap allocator, segment
//! topology, and the typed reference helpers built on top of them.
//!
//! This crate has no notion of transactions — it is the substrate the
//! `vtm-concurrency` crate layers shadow-page isolation over. Everything
//! here is either a pure value type or guarded by its own fine-grained
//! lock; callers needing cross-region atomicity belong one layer up.

#![warn(missing_docs)]

pub mod heap;
pub mod refs;
pub mod segment;
pub mod topology;

pub use heap::{HeapBlockHeader, HeapManager, Log2SkipList, HEAP_BLOCK_HEADER_SIZE};
pub use refs::{PersistedArray, PersistedReference, PersistedSizedArray};
pub use segment::{
    BlockHint, ReadonlyBlock, SegmentEventListener, SegmentHeader, SegmentManager,
    WritableBlock, SEGMENT_HEADER_SIZE,
};
pub use topology::{SegmentTopology, Slot};
