//! Per-segment heap allocator: carves blocks out of a segment's free space,
//! splitting oversized free blocks and recycling released ones through the
//! [`Log2SkipList`].

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use vtm_core::address::{FarAddress, SegmentIndex, SegmentPos};
use vtm_core::error::{Error, Result};
use vtm_core::limits::{ALIGN, HEAP_MIN_BLOCK};

use crate::segment::{BlockHint, SegmentManager};

use super::header::{HeapBlockHeader, HEAP_BLOCK_HEADER_SIZE};
use super::skiplist::Log2SkipList;

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

/// Owns the free-space bookkeeping for one segment's heap region.
///
/// The region managed starts at `reserved_offset` (immediately after the
/// segment header and whatever the topology reserved for itself) and runs
/// to the end of the segment.
pub struct HeapManager {
    segment: SegmentIndex,
    segment_size: u32,
    list: Log2SkipList,
    avail_bytes: AtomicU32,
    high_water: Mutex<SegmentPos>,
}

impl HeapManager {
    /// Start tracking a fresh heap region with nothing yet allocated.
    pub fn new(segment: SegmentIndex, reserved_offset: SegmentPos, segment_size: u32) -> Self {
        HeapManager {
            segment,
            segment_size,
            list: Log2SkipList::new(segment_size),
            avail_bytes: AtomicU32::new(segment_size - reserved_offset),
            high_water: Mutex::new(reserved_offset),
        }
    }

    /// Rebuild a heap manager's bookkeeping for a previously-formatted
    /// segment by walking the chain of block headers from `reserved_offset`.
    ///
    /// The free-list buckets and high-water mark are process memory only —
    /// nothing on disk records them directly — so a reopened database has to
    /// reconstruct both from what *is* on disk: a contiguous run of block
    /// headers, each carrying its own size, terminating wherever the next
    /// header's signature fails to validate (untouched, zero-filled space
    /// past the last allocation ever made in this segment).
    pub fn open_existing(
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
        reserved_offset: SegmentPos,
        segment_size: u32,
    ) -> Result<Self> {
        let list = Log2SkipList::new(segment_size);
        let mut avail: u32 = segment_size - reserved_offset;
        let mut cursor = reserved_offset;
        loop {
            if cursor as u64 + HEAP_BLOCK_HEADER_SIZE as u64 > segment_size as u64 {
                break;
            }
            let header_addr = FarAddress::new(segment, cursor);
            let block = segment_manager.readonly_block(header_addr, HEAP_BLOCK_HEADER_SIZE)?;
            let header = match HeapBlockHeader::from_bytes(block.as_slice()) {
                Ok(header) => header,
                Err(_) => break, // untouched tail: no valid header signature here
            };
            let real_size = header.real_size();
            if header.is_free() {
                list.insert(segment_manager, header_addr, header.size())?;
            } else {
                avail = avail.saturating_sub(real_size);
            }
            cursor += real_size;
        }
        trace!(segment, high_water = cursor, avail, "rebuilt heap manager from on-disk scan");
        Ok(HeapManager {
            segment,
            segment_size,
            list,
            avail_bytes: AtomicU32::new(avail),
            high_water: Mutex::new(cursor),
        })
    }

    /// Bytes available for further allocation, counting both recycled free
    /// blocks and never-touched space. Recycled blocks may be fragmented
    /// across multiple size classes, so this does not guarantee the next
    /// allocation of this size will succeed.
    pub fn available(&self) -> u32 {
        self.avail_bytes.load(Ordering::Acquire)
    }

    /// Carve out `requested` user-visible bytes, returning the address of
    /// the user payload (immediately past its [`HeapBlockHeader`]).
    pub fn allocate(&self, segment_manager: &SegmentManager, requested: u32) -> Result<FarAddress> {
        let size = align_up(requested.max(HEAP_MIN_BLOCK), ALIGN);
        if let Some((header_addr, block_size)) = self.list.pull_not_less(segment_manager, size)? {
            let alloc_addr = self.split_if_worthwhile(segment_manager, header_addr, block_size, size)?;
            self.avail_bytes.fetch_sub(size + HEAP_BLOCK_HEADER_SIZE, Ordering::AcqRel);
            trace!(segment = self.segment, size, "allocated from free list");
            return Ok(HeapBlockHeader::user_addr_for(alloc_addr));
        }

        let mut high_water = self.high_water.lock();
        let needed = size + HEAP_BLOCK_HEADER_SIZE;
        let remaining = self.segment_size.saturating_sub(*high_water);
        if needed > remaining {
            return Err(Error::NoMemory(format!(
                "segment {} has {remaining} bytes left, need {needed}",
                self.segment
            )));
        }
        let header_addr = FarAddress::new(self.segment, *high_water);
        let header = HeapBlockHeader::new(size, false);
        let mut block = segment_manager.writable_block(header_addr, HEAP_BLOCK_HEADER_SIZE, BlockHint::New)?;
        block.as_mut_slice().copy_from_slice(&header.to_bytes());
        *high_water += needed;
        self.avail_bytes.fetch_sub(needed, Ordering::AcqRel);
        trace!(segment = self.segment, size, "allocated from untouched space");
        Ok(HeapBlockHeader::user_addr_for(header_addr))
    }

    /// If the free block pulled from the skiplist is bigger than needed by
    /// more than one minimal block's worth, split the remainder back onto
    /// the free list instead of wasting it as internal fragmentation.
    ///
    /// Per the pulled block's layout: the tail becomes the allocation
    /// (returned as this method's result), the head keeps `header_addr` and
    /// is re-inserted as a smaller free block. Returns the header address
    /// the caller should hand back to [`Self::allocate`]'s caller.
    fn split_if_worthwhile(
        &self,
        segment_manager: &SegmentManager,
        header_addr: FarAddress,
        block_size: u32,
        size: u32,
    ) -> Result<FarAddress> {
        let remainder = block_size - size;
        if remainder < HEAP_MIN_BLOCK + HEAP_BLOCK_HEADER_SIZE {
            // Too small to carve off; hand the whole block to the caller
            // even though it's larger than requested.
            let mut occupied = HeapBlockHeader::new(block_size, false);
            occupied.set_free(false);
            let mut block = segment_manager.writable_block(header_addr, HEAP_BLOCK_HEADER_SIZE, BlockHint::Existing)?;
            block.as_mut_slice().copy_from_slice(&occupied.to_bytes());
            return Ok(header_addr);
        }
        let head_size = remainder - HEAP_BLOCK_HEADER_SIZE;
        let tail_addr = header_addr + (head_size + HEAP_BLOCK_HEADER_SIZE);

        let mut tail = HeapBlockHeader::new(size, false);
        tail.set_free(false);
        let mut block = segment_manager.writable_block(tail_addr, HEAP_BLOCK_HEADER_SIZE, BlockHint::Existing)?;
        block.as_mut_slice().copy_from_slice(&tail.to_bytes());

        self.list.insert(segment_manager, header_addr, head_size)?;
        Ok(tail_addr)
    }

    /// Release a block previously returned by [`Self::allocate`].
    ///
    /// Returns [`Error::InvalidState`] if the block is already free.
    /// Attempts to coalesce with the physically-following block when that
    /// block is also free (forward-only, since the free list is singly
    /// linked by `next` and there is no cheap way to find a block's
    /// physical predecessor).
    pub fn deallocate(&self, segment_manager: &SegmentManager, user_addr: FarAddress) -> Result<()> {
        let header_addr = HeapBlockHeader::header_addr_for(user_addr)?;
        let block = segment_manager.readonly_block(header_addr, HEAP_BLOCK_HEADER_SIZE)?;
        let header = HeapBlockHeader::from_bytes(block.as_slice())?;
        if header.is_free() {
            return Err(Error::InvalidState(format!(
                "double free at {header_addr:?}"
            )));
        }
        let freed_bytes = header.real_size();
        let mut merged_size = header.size();

        let next_header_addr = header_addr + freed_bytes;
        if next_header_addr.offset() < self.segment_size {
            let next_block = segment_manager.readonly_block(next_header_addr, HEAP_BLOCK_HEADER_SIZE)?;
            let next_header = HeapBlockHeader::from_bytes(next_block.as_slice())?;
            if next_header.is_free()
                && self
                    .list
                    .remove(segment_manager, next_header.size(), next_header_addr)?
            {
                merged_size += HEAP_BLOCK_HEADER_SIZE + next_header.size();
            }
        }

        self.list.insert(segment_manager, header_addr, merged_size)?;
        self.avail_bytes.fetch_add(freed_bytes, Ordering::AcqRel);
        Ok(())
    }
}
