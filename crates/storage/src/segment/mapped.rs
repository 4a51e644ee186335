//! A single memory-mapped chunk of the backing file (C2).

use std::cell::UnsafeCell;
use std::fs::File;

use memmap2::MmapMut;

use vtm_core::address::{SegmentIndex, SegmentPos};
use vtm_core::error::{Error, Result};

/// One fixed-size memory-mapped region of the backing file.
///
/// The mapping itself is stable for the lifetime of the `MappedSegment` —
/// callers at higher layers (the transaction layer's shadow history)
/// synchronize concurrent writers to non-overlapping byte ranges. This type
/// only guarantees that any offset it hands out lies within the mapping.
pub struct MappedSegment {
    mmap: UnsafeCell<MmapMut>,
    index: SegmentIndex,
    size: u32,
}

// SAFETY: `MmapMut` is a thin wrapper over a raw pointer and length; the
// underlying pages are valid for the lifetime of this struct. Concurrent
// access to disjoint byte ranges is safe; the transaction layer is
// responsible for ensuring writers never touch overlapping ranges.
unsafe impl Sync for MappedSegment {}

impl MappedSegment {
    /// Map `size` bytes of `file` starting at `file_offset`.
    ///
    /// The file must already be extended to cover `[file_offset, file_offset
    /// + size)` — segment managers grow the file before mapping a new
    /// segment.
    pub fn map(file: &File, index: SegmentIndex, file_offset: u64, size: u32) -> Result<Self> {
        // SAFETY: the caller guarantees the file has been sized to cover
        // this region; mutation through the mapping is synchronized by the
        // caller per the module-level safety note.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(file_offset)
                .len(size as usize)
                .map_mut(file)?
        };
        Ok(MappedSegment {
            mmap: UnsafeCell::new(mmap),
            index,
            size,
        })
    }

    /// The segment index this mapping was created for.
    pub fn index(&self) -> SegmentIndex {
        self.index
    }

    /// Fixed size of this segment in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Pointer to the first byte of the mapping (the `SegmentHeader`).
    pub fn raw_base(&self) -> *mut u8 {
        // SAFETY: single allocation for the lifetime of `self`.
        unsafe { (*self.mmap.get()).as_mut_ptr() }
    }

    /// Offset-to-pointer conversion with a debug bounds check.
    pub fn at(&self, offset: SegmentPos) -> *mut u8 {
        debug_assert!(
            offset <= self.size,
            "offset {offset} out of bounds for segment of size {}",
            self.size
        );
        // SAFETY: caller-provided offset is validated in debug builds;
        // release builds trust the caller (matches the C++ original's
        // debug-only bounds assertion).
        unsafe { self.raw_base().add(offset as usize) }
    }

    /// Borrow `len` bytes starting at `offset` as a checked, immutable slice.
    pub fn slice(&self, offset: SegmentPos, len: u32) -> Result<&[u8]> {
        self.check_bounds(offset, len)?;
        // SAFETY: bounds validated above.
        Ok(unsafe { std::slice::from_raw_parts(self.at(offset), len as usize) })
    }

    /// Borrow `len` bytes starting at `offset` as a checked, mutable slice.
    ///
    /// # Safety invariant
    /// The caller must guarantee that no other live slice overlaps this
    /// range. The transaction layer's shadow history enforces this at the
    /// region-conflict level; this type does not re-check it.
    pub fn slice_mut(&self, offset: SegmentPos, len: u32) -> Result<&mut [u8]> {
        self.check_bounds(offset, len)?;
        // SAFETY: bounds validated above; aliasing is the caller's
        // responsibility per the safety invariant documented above.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.at(offset), len as usize) })
    }

    fn check_bounds(&self, offset: SegmentPos, len: u32) -> Result<()> {
        let end = (offset as u64) + (len as u64);
        if end > self.size as u64 {
            return Err(Error::InvalidBlock(format!(
                "range [{offset}, {end}) exceeds segment size {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Convert a pointer previously returned by [`Self::at`] back to an
    /// offset, validating it lies within this mapping.
    pub fn pointer_to_offset(&self, ptr: *const u8) -> Result<SegmentPos> {
        let base = self.raw_base() as *const u8;
        // SAFETY: both pointers are derived from the same allocation when
        // `ptr` genuinely came from `self`; the range check below rejects
        // anything else before it is dereferenced.
        let in_range = ptr >= base && (ptr as usize) < (base as usize + self.size as usize);
        if !in_range {
            return Err(Error::InvalidBlock(
                "pointer does not lie within this segment's mapping".into(),
            ));
        }
        Ok(unsafe { ptr.offset_from(base) } as SegmentPos)
    }

    /// Ask the OS to persist dirty pages.
    pub fn flush(&self, asynchronous: bool) -> Result<()> {
        // SAFETY: flushing does not alias any live reference.
        let mmap = unsafe { &*self.mmap.get() };
        if asynchronous {
            mmap.flush_async()?;
        } else {
            mmap.flush()?;
        }
        Ok(())
    }
}
