//! The per-segment heap allocator: block headers, the bucketed free-list
//! skiplist, and the manager that ties them together (C4/C5).

mod header;
mod manager;
mod skiplist;

pub use header::{HeapBlockHeader, HEAP_BLOCK_HEADER_SIZE};
pub use manager::HeapManager;
pub use skiplist::Log2SkipList;
