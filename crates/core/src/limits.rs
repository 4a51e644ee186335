//! On-disk constants and configurable defaults shared by every crate in the
//! workspace. Kept in `vtm-core` so the storage, concurrency and durability
//! crates all agree on the same magic numbers without depending on each
//! other.

/// Byte alignment every heap block and topology slot is rounded to.
pub const ALIGN: u32 = 16;

/// Minimum user-visible payload size of a heap allocation.
pub const HEAP_MIN_BLOCK: u32 = 32;

/// Constant signature stamped into every `HeapBlockHeader` for integrity
/// checking and free-space salvage.
pub const HEAP_BLOCK_SIGNATURE: u32 = 0x3757;

/// Number of buckets in the per-segment free-list skiplist.
pub const SKIPLIST_BUCKETS: usize = 32;

/// 4-byte seal stamped at offset 0 of every segment.
pub const SEGMENT_SEAL: [u8; 4] = *b"mgtr";

/// Default number of terminating WAL records (commits + rollbacks) held in
/// one log file before rotation.
pub const DEFAULT_TRANSACTIONS_PER_FILE: u32 = 5;

/// Default WAL filename prefix. Filenames are `<prefix><N><suffix>`.
pub const DEFAULT_WAL_PREFIX: &str = "a0";

/// Default WAL filename suffix.
pub const DEFAULT_WAL_SUFFIX: &str = ".tlog";

/// Smallest sane segment size: big enough for the topology reservation plus
/// one minimal heap block on any reasonable topology.
pub const MIN_SEGMENT_SIZE: u32 = 64 * 1024;

/// Sentinel `SegmentPos` meaning "end of segment" / "no residence here".
pub const EOS: u32 = u32::MAX;
