//! Per-segment free-list skiplist: a fixed array of buckets classified by
//! the piecewise-linear size-class mapping, each bucket a singly-linked,
//! size-ascending list of free blocks threaded through
//! [`HeapBlockHeader::next`].
//!
//! Named `Log2SkipList` after the "Log₂-bucketed free-list skiplist" idea it
//! implements — not a classic probabilistic skiplist, but a bucketed free
//! list indexed by size class.

use parking_lot::Mutex;

use vtm_core::address::FarAddress;
use vtm_core::error::Result;
use vtm_core::limits::SKIPLIST_BUCKETS;

use crate::segment::{BlockHint, SegmentManager};

use super::header::{HeapBlockHeader, HEAP_BLOCK_HEADER_SIZE};

/// Size below which the small-size bracket (buckets 0..=2) applies.
const SMALL_SIZE_CEIL: u32 = 256;
/// Size below which the mid-size bracket (buckets 3..=18) applies.
const MID_SIZE_CEIL: u32 = 4352;
/// First bucket of the mid-size bracket.
const MID_BUCKET_START: usize = 3;
/// First bucket of the large-size bracket.
const LARGE_BUCKET_START: usize = 19;

/// Bucketed free list over blocks in one segment's heap.
///
/// Each bucket is guarded independently so concurrent allocations touching
/// different size classes never contend on the same lock.
pub struct Log2SkipList {
    segment_size: u32,
    buckets: Vec<Mutex<FarAddress>>,
}

impl Log2SkipList {
    /// An empty skiplist with all buckets initialized to an empty list.
    ///
    /// `segment_size` scales the top size bracket (see [`Self::bucket_of`])
    /// and must match the segment this skiplist serves.
    pub fn new(segment_size: u32) -> Self {
        Log2SkipList {
            segment_size,
            buckets: (0..SKIPLIST_BUCKETS).map(|_| Mutex::new(FarAddress::NIL)).collect(),
        }
    }

    /// Piecewise-linear size-class bucket for `size`, monotone
    /// non-decreasing in `size`:
    ///
    /// - `size < 256` → bucket `size * 3 / 256` (buckets 0..=2).
    /// - `256 <= size < 4352` → buckets 3..=18, linear in that range.
    /// - otherwise → buckets 19..=31, linear in the remaining segment size,
    ///   clamped to the last bucket.
    fn bucket_of(&self, size: u32) -> usize {
        let bucket = if size < SMALL_SIZE_CEIL {
            (size as u64 * 3 / SMALL_SIZE_CEIL as u64) as usize
        } else if size < MID_SIZE_CEIL {
            let span = (MID_SIZE_CEIL - SMALL_SIZE_CEIL) as u64;
            let steps = (LARGE_BUCKET_START - MID_BUCKET_START) as u64;
            let frac = (size - SMALL_SIZE_CEIL) as u64 * steps / span;
            MID_BUCKET_START + frac as usize
        } else {
            let span = self.segment_size.saturating_sub(MID_SIZE_CEIL).max(1) as u64;
            let steps = (SKIPLIST_BUCKETS - LARGE_BUCKET_START - 1) as u64;
            let offset = (size - MID_SIZE_CEIL) as u64;
            let frac = offset.min(span) * steps / span;
            LARGE_BUCKET_START + frac as usize
        };
        bucket.min(SKIPLIST_BUCKETS - 1)
    }

    /// Push a free block of `size` bytes onto its size-class bucket, kept
    /// spliced in ascending `size` order within the bucket.
    pub fn insert(
        &self,
        segment_manager: &SegmentManager,
        header_addr: FarAddress,
        size: u32,
    ) -> Result<()> {
        let bucket = self.bucket_of(size);
        let mut head = self.buckets[bucket].lock();
        let mut header = HeapBlockHeader::new(size, true);

        if head.is_nil() {
            header.set_next(FarAddress::NIL);
            write_header(segment_manager, header_addr, header)?;
            *head = header_addr;
            return Ok(());
        }

        let first_block = segment_manager.readonly_block(*head, HEAP_BLOCK_HEADER_SIZE)?;
        let first_header = HeapBlockHeader::from_bytes(first_block.as_slice())?;
        if size <= first_header.size() {
            header.set_next(*head);
            write_header(segment_manager, header_addr, header)?;
            *head = header_addr;
            return Ok(());
        }

        let mut prev_addr = *head;
        loop {
            let prev_block = segment_manager.readonly_block(prev_addr, HEAP_BLOCK_HEADER_SIZE)?;
            let prev_header = HeapBlockHeader::from_bytes(prev_block.as_slice())?;
            let next_addr = prev_header.next();

            let splice_here = if next_addr.is_nil() {
                true
            } else {
                let next_block = segment_manager.readonly_block(next_addr, HEAP_BLOCK_HEADER_SIZE)?;
                let next_header = HeapBlockHeader::from_bytes(next_block.as_slice())?;
                size <= next_header.size()
            };

            if splice_here {
                header.set_next(next_addr);
                write_header(segment_manager, header_addr, header)?;
                let mut updated_prev = prev_header;
                updated_prev.set_next(header_addr);
                write_header(segment_manager, prev_addr, updated_prev)?;
                return Ok(());
            }
            prev_addr = next_addr;
        }
    }

    /// Unlink the free block at `target` (classified under `size`'s bucket)
    /// from its bucket list, used to splice a physically-adjacent free
    /// block out before merging it into a just-freed neighbor.
    ///
    /// Returns `false` if `target` was not found in that bucket (it may
    /// already have been pulled by a concurrent allocation).
    pub fn remove(
        &self,
        segment_manager: &SegmentManager,
        size: u32,
        target: FarAddress,
    ) -> Result<bool> {
        let bucket = self.bucket_of(size);
        let mut head = self.buckets[bucket].lock();
        if head.is_nil() {
            return Ok(false);
        }
        if *head == target {
            let block = segment_manager.readonly_block(target, HEAP_BLOCK_HEADER_SIZE)?;
            let header = HeapBlockHeader::from_bytes(block.as_slice())?;
            *head = header.next();
            return Ok(true);
        }
        let mut prev_addr = *head;
        loop {
            let prev_block = segment_manager.readonly_block(prev_addr, HEAP_BLOCK_HEADER_SIZE)?;
            let prev_header = HeapBlockHeader::from_bytes(prev_block.as_slice())?;
            let next_addr = prev_header.next();
            if next_addr.is_nil() {
                return Ok(false);
            }
            if next_addr == target {
                let block = segment_manager.readonly_block(target, HEAP_BLOCK_HEADER_SIZE)?;
                let header = HeapBlockHeader::from_bytes(block.as_slice())?;
                let mut updated_prev = prev_header;
                updated_prev.set_next(header.next());
                write_header(segment_manager, prev_addr, updated_prev)?;
                return Ok(true);
            }
            prev_addr = next_addr;
        }
    }

    /// Pop a free block whose payload is at least `min_size` bytes, if one
    /// exists anywhere in a bucket that can satisfy it.
    ///
    /// Starts at `bucket_of(min_size)` itself: that bucket may hold blocks
    /// both smaller and larger than `min_size` (it is a size-class, not a
    /// lower bound), so its chain is scanned in ascending order for the
    /// first block that actually qualifies. Buckets strictly above that one
    /// are guaranteed to hold only blocks `>= min_size` by the bucketing
    /// function's monotonicity, so their head is popped unconditionally.
    pub fn pull_not_less(
        &self,
        segment_manager: &SegmentManager,
        min_size: u32,
    ) -> Result<Option<(FarAddress, u32)>> {
        let start = self.bucket_of(min_size);
        for bucket in start..SKIPLIST_BUCKETS {
            if let Some(found) = self.pull_from_bucket(segment_manager, bucket, min_size)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Scan one bucket's chain in order, unlink and return the first block
    /// whose payload is `>= min_size`, or `None` if none qualifies.
    fn pull_from_bucket(
        &self,
        segment_manager: &SegmentManager,
        bucket: usize,
        min_size: u32,
    ) -> Result<Option<(FarAddress, u32)>> {
        let mut head = self.buckets[bucket].lock();
        if head.is_nil() {
            return Ok(None);
        }

        let mut prev_addr: Option<FarAddress> = None;
        let mut cursor = *head;
        loop {
            if cursor.is_nil() {
                return Ok(None);
            }
            let block = segment_manager.readonly_block(cursor, HEAP_BLOCK_HEADER_SIZE)?;
            let header = HeapBlockHeader::from_bytes(block.as_slice())?;

            if header.size() >= min_size {
                match prev_addr {
                    None => *head = header.next(),
                    Some(prev) => {
                        let prev_block = segment_manager.readonly_block(prev, HEAP_BLOCK_HEADER_SIZE)?;
                        let mut prev_header = HeapBlockHeader::from_bytes(prev_block.as_slice())?;
                        prev_header.set_next(header.next());
                        write_header(segment_manager, prev, prev_header)?;
                    }
                }
                let mut occupied = header;
                occupied.set_free(false);
                occupied.set_next(FarAddress::NIL);
                write_header(segment_manager, cursor, occupied)?;
                return Ok(Some((cursor, occupied.size())));
            }

            prev_addr = Some(cursor);
            cursor = header.next();
        }
    }
}

fn write_header(
    segment_manager: &SegmentManager,
    addr: FarAddress,
    header: HeapBlockHeader,
) -> Result<()> {
    let mut block = segment_manager.writable_block(addr, HEAP_BLOCK_HEADER_SIZE, BlockHint::Existing)?;
    block.as_mut_slice().copy_from_slice(&header.to_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtm_core::limits::MIN_SEGMENT_SIZE;

    fn test_manager() -> SegmentManager {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let manager = SegmentManager::create_new(&path, MIN_SEGMENT_SIZE).unwrap();
        std::mem::forget(dir);
        manager
    }

    fn test_list() -> Log2SkipList {
        Log2SkipList::new(MIN_SEGMENT_SIZE)
    }

    #[test]
    fn bucket_of_follows_the_piecewise_mapping() {
        let list = test_list();
        assert_eq!(list.bucket_of(0), 0);
        assert_eq!(list.bucket_of(255), 255 * 3 / 256);
        assert_eq!(list.bucket_of(256), 3);
        assert!(list.bucket_of(4351) <= 18);
        assert_eq!(list.bucket_of(4352), 19);
        assert_eq!(list.bucket_of(MIN_SEGMENT_SIZE), SKIPLIST_BUCKETS - 1);
    }

    #[test]
    fn bucket_of_is_monotone_non_decreasing() {
        let list = test_list();
        let mut prev = list.bucket_of(0);
        for size in (1..MIN_SEGMENT_SIZE).step_by(37) {
            let bucket = list.bucket_of(size);
            assert!(bucket >= prev, "bucket_of regressed at size {size}");
            prev = bucket;
        }
    }

    #[test]
    fn insert_then_pull_recovers_block() {
        let manager = test_manager();
        let list = test_list();
        let addr = FarAddress::new(0, 64);
        list.insert(&manager, addr, 48).unwrap();
        let (pulled, size) = list.pull_not_less(&manager, 32).unwrap().unwrap();
        assert_eq!(pulled, addr);
        assert_eq!(size, 48);
    }

    #[test]
    fn pull_finds_a_same_bucket_block_that_head_insertion_would_have_skipped() {
        // 48 and 80 fall in the same small-size bucket (bucket_of(48) ==
        // bucket_of(80) == 0) but a request for 48 must still find the
        // 48-byte block even though it is not the largest in the bucket.
        let manager = test_manager();
        let list = test_list();
        let small = FarAddress::new(0, 64);
        let large = FarAddress::new(0, 256);
        list.insert(&manager, small, 48).unwrap();
        list.insert(&manager, large, 80).unwrap();
        let (pulled, size) = list.pull_not_less(&manager, 48).unwrap().unwrap();
        assert_eq!(pulled, small);
        assert_eq!(size, 48);
    }

    #[test]
    fn pull_returns_none_when_no_block_qualifies() {
        let manager = test_manager();
        let list = test_list();
        list.insert(&manager, FarAddress::new(0, 64), 16).unwrap();
        assert!(list.pull_not_less(&manager, MIN_SEGMENT_SIZE).unwrap().is_none());
    }

    #[test]
    fn pulled_block_is_marked_occupied() {
        let manager = test_manager();
        let list = test_list();
        let addr = FarAddress::new(0, 64);
        list.insert(&manager, addr, 48).unwrap();
        list.pull_not_less(&manager, 32).unwrap();
        let block = manager.readonly_block(addr, HEAP_BLOCK_HEADER_SIZE).unwrap();
        let header = HeapBlockHeader::from_bytes(block.as_slice()).unwrap();
        assert!(!header.is_free());
    }

    #[test]
    fn bucket_stays_size_ascending_across_out_of_order_inserts() {
        let manager = test_manager();
        let list = test_list();
        // all five sizes stay under 86 bytes, so `size * 3 / 256 == 0` for
        // each of them: they all land in the same bucket.
        let sizes = [48u32, 16, 80, 32, 64];
        let mut offset = 64u32;
        for size in sizes {
            let addr = FarAddress::new(0, offset);
            list.insert(&manager, addr, size).unwrap();
            offset += 256;
        }

        // all five land in the same small-size bucket (0..256 bytes).
        let bucket = list.bucket_of(32);
        let mut cursor = *list.buckets[bucket].lock();
        let mut prev_size = 0u32;
        let mut seen = 0;
        while !cursor.is_nil() {
            let block = manager.readonly_block(cursor, HEAP_BLOCK_HEADER_SIZE).unwrap();
            let header = HeapBlockHeader::from_bytes(block.as_slice()).unwrap();
            assert!(header.size() >= prev_size, "bucket chain is not size-ascending");
            prev_size = header.size();
            cursor = header.next();
            seen += 1;
        }
        assert_eq!(seen, sizes.len());
    }
}
