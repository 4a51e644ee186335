//! Typed read/write windows into a [`MappedSegment`](super::mapped::MappedSegment).
//!
//! These stand in for placement-new over raw memory: they take an aligned
//! byte range, and `at`/`at_mut` validate layout before handing back a typed
//! reference instead of invoking undefined behavior on mismatch.

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::sync::Arc;

use vtm_core::address::{FarAddress, SegmentPos};
use vtm_core::error::{Error, Result};

use super::mapped::MappedSegment;

/// Hint passed when requesting a writable block.
///
/// `New` tells the segment manager the caller is about to overwrite the
/// entire range (skip any read-before-write bookkeeping); `Existing` means
/// the caller intends to read-modify-write previously live data. Plain
/// (non-transactional) managers treat both the same way — the distinction
/// exists for the transaction layer's shadow history to decide whether it
/// needs to seed a shadow buffer from committed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockHint {
    /// The block is being freshly formatted; prior content is irrelevant.
    New,
    /// The block may hold live data that must be preserved/read first.
    Existing,
}

/// A read-only byte window into a mapped segment.
#[derive(Clone)]
pub struct ReadonlyBlock {
    segment: Arc<MappedSegment>,
    addr: FarAddress,
    len: u32,
}

impl ReadonlyBlock {
    pub(crate) fn new(segment: Arc<MappedSegment>, addr: FarAddress, len: u32) -> Result<Self> {
        segment.slice(addr.offset(), len)?;
        Ok(ReadonlyBlock { segment, addr, len })
    }

    /// Address this block begins at.
    pub fn address(&self) -> FarAddress {
        self.addr
    }

    /// Number of bytes covered by this block.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the block covers zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw bytes of this block.
    pub fn as_slice(&self) -> &[u8] {
        self.segment
            .slice(self.addr.offset(), self.len)
            .expect("bounds validated at construction")
    }

    /// Interpret `local_offset` bytes into the block as a `&T`.
    ///
    /// Fails with [`Error::InvalidBlock`] if the typed read would run past
    /// the end of the block or the address is misaligned for `T`.
    pub fn at<T>(&self, local_offset: u32) -> Result<&T> {
        let ptr = typed_pointer::<T>(self.as_slice(), local_offset)?;
        // SAFETY: `typed_pointer` validated bounds and alignment.
        Ok(unsafe { &*(ptr as *const T) })
    }

    /// Upgrade this read-only block to a writable one over the same range.
    ///
    /// Plain segment managers serve this directly; under a transaction this
    /// is where a shadow buffer gets allocated (see `vtm-concurrency`).
    pub fn upgrade(self) -> Result<WritableBlock> {
        WritableBlock::new(self.segment, self.addr, self.len)
    }
}

/// A writable byte window into a mapped segment.
pub struct WritableBlock {
    segment: Arc<MappedSegment>,
    addr: FarAddress,
    len: u32,
    _not_sync: PhantomData<*const ()>,
}

impl WritableBlock {
    pub(crate) fn new(segment: Arc<MappedSegment>, addr: FarAddress, len: u32) -> Result<Self> {
        segment.slice_mut(addr.offset(), len)?;
        Ok(WritableBlock {
            segment,
            addr,
            len,
            _not_sync: PhantomData,
        })
    }

    /// Address this block begins at.
    pub fn address(&self) -> FarAddress {
        self.addr
    }

    /// Number of bytes covered by this block.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the block covers zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw bytes of this block, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.segment
            .slice_mut(self.addr.offset(), self.len)
            .expect("bounds validated at construction")
    }

    /// The raw bytes of this block, read-only.
    pub fn as_slice(&self) -> &[u8] {
        self.segment
            .slice(self.addr.offset(), self.len)
            .expect("bounds validated at construction")
    }

    /// Interpret `local_offset` bytes into the block as a `&mut T`.
    pub fn at_mut<T>(&mut self, local_offset: u32) -> Result<&mut T> {
        let ptr = typed_pointer_mut::<T>(self.as_mut_slice(), local_offset)?;
        // SAFETY: `typed_pointer_mut` validated bounds and alignment.
        Ok(unsafe { &mut *(ptr as *mut T) })
    }

    /// Interpret `local_offset` bytes into the block as a `&T`.
    pub fn at<T>(&self, local_offset: u32) -> Result<&T> {
        let ptr = typed_pointer::<T>(self.as_slice(), local_offset)?;
        Ok(unsafe { &*(ptr as *const T) })
    }

    /// Flush this block's segment to disk.
    pub fn flush(&self, asynchronous: bool) -> Result<()> {
        self.segment.flush(asynchronous)
    }
}

fn typed_pointer<T>(bytes: &[u8], local_offset: u32) -> Result<*const u8> {
    let ptr = validate_typed_range::<T>(bytes, local_offset)?;
    Ok(ptr)
}

fn typed_pointer_mut<T>(bytes: &mut [u8], local_offset: u32) -> Result<*mut u8> {
    let ptr = validate_typed_range::<T>(bytes, local_offset)? as *mut u8;
    Ok(ptr)
}

fn validate_typed_range<T>(bytes: &[u8], local_offset: u32) -> Result<*const u8> {
    let end = local_offset as usize + size_of::<T>();
    if end > bytes.len() {
        return Err(Error::InvalidBlock(format!(
            "typed read of {} bytes at offset {local_offset} exceeds block length {}",
            size_of::<T>(),
            bytes.len()
        )));
    }
    let ptr = unsafe { bytes.as_ptr().add(local_offset as usize) };
    if (ptr as usize) % align_of::<T>() != 0 {
        return Err(Error::InvalidBlock(format!(
            "offset {local_offset} is not aligned for a value requiring {}-byte alignment",
            align_of::<T>()
        )));
    }
    Ok(ptr)
}

/// Position of the byte range a [`SegmentPos`]-addressed offset and length
/// cover, used by callers constructing blocks directly from a bare offset.
pub fn block_end(offset: SegmentPos, len: u32) -> u64 {
    offset as u64 + len as u64
}
