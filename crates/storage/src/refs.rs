//! Typed, borrow-free views over a [`FarAddress`] (C10).
//!
//! These types carry no lifetime and no data of their own — just an
//! address and a phantom element type. They exist purely to make call
//! sites self-documenting about what lives at an address; every actual
//! read or write still goes through a borrowed [`SegmentManager`].

use std::marker::PhantomData;
use std::mem::size_of;

use vtm_core::address::FarAddress;
use vtm_core::error::Result;

use crate::segment::{BlockHint, ReadonlyBlock, SegmentManager, WritableBlock};

/// A view over a single `T` living at a fixed address.
pub struct PersistedReference<T> {
    addr: FarAddress,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PersistedReference<T> {
    /// Wrap an address as a reference to a `T`.
    pub fn new(addr: FarAddress) -> Self {
        PersistedReference {
            addr,
            _marker: PhantomData,
        }
    }

    /// The wrapped address.
    pub fn address(&self) -> FarAddress {
        self.addr
    }

    /// Borrow a read-only window sized to exactly one `T`.
    pub fn view(&self, segment_manager: &SegmentManager) -> Result<ReadonlyBlock> {
        segment_manager.view::<T>(self.addr)
    }

    /// Borrow a writable window sized to exactly one `T`.
    pub fn wr(&self, segment_manager: &SegmentManager, hint: BlockHint) -> Result<WritableBlock> {
        segment_manager.wr_at::<T>(self.addr, hint)
    }
}

impl<T> Clone for PersistedReference<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PersistedReference<T> {}

/// A view over a contiguous run of `T`, whose length is known only to the
/// caller at access time (not stored on disk).
pub struct PersistedArray<T> {
    addr: FarAddress,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PersistedArray<T> {
    /// Wrap an address as the start of an array of `T`.
    pub fn new(addr: FarAddress) -> Self {
        PersistedArray {
            addr,
            _marker: PhantomData,
        }
    }

    /// The address of the array's first element.
    pub fn address(&self) -> FarAddress {
        self.addr
    }

    /// Address of the `index`-th element.
    pub fn element_addr(&self, index: u32) -> Result<FarAddress> {
        self.addr
            .checked_offset(index as i64 * size_of::<T>() as i64)
    }

    /// Borrow a read-only window over `capacity` elements.
    pub fn view(&self, segment_manager: &SegmentManager, capacity: u32) -> Result<ReadonlyBlock> {
        segment_manager.readonly_block(self.addr, capacity * size_of::<T>() as u32)
    }

    /// Borrow a writable window over `capacity` elements.
    pub fn wr(
        &self,
        segment_manager: &SegmentManager,
        capacity: u32,
        hint: BlockHint,
    ) -> Result<WritableBlock> {
        segment_manager.writable_block(self.addr, capacity * size_of::<T>() as u32, hint)
    }

    /// Read the `index`-th element out of a window previously borrowed
    /// with [`Self::view`].
    pub fn get<'a>(&self, block: &'a ReadonlyBlock, index: u32) -> Result<&'a T> {
        block.at::<T>(index * size_of::<T>() as u32)
    }
}

impl<T> Clone for PersistedArray<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PersistedArray<T> {}

/// A view over an array preceded by its own `u32` length field on disk.
pub struct PersistedSizedArray<T> {
    addr: FarAddress,
    _marker: PhantomData<fn() -> T>,
}

const LEN_FIELD_SIZE: u32 = 4;

impl<T> PersistedSizedArray<T> {
    /// Wrap an address as a length-prefixed array of `T`.
    pub fn new(addr: FarAddress) -> Self {
        PersistedSizedArray {
            addr,
            _marker: PhantomData,
        }
    }

    /// Address of the leading length field.
    pub fn address(&self) -> FarAddress {
        self.addr
    }

    /// Read the stored element count.
    pub fn len(&self, segment_manager: &SegmentManager) -> Result<u32> {
        let block = segment_manager.readonly_block(self.addr, LEN_FIELD_SIZE)?;
        Ok(u32::from_ne_bytes(block.as_slice().try_into().unwrap()))
    }

    /// Whether the stored element count is zero.
    pub fn is_empty(&self, segment_manager: &SegmentManager) -> Result<bool> {
        Ok(self.len(segment_manager)? == 0)
    }

    /// Overwrite the stored element count.
    pub fn set_len(&self, segment_manager: &SegmentManager, len: u32) -> Result<()> {
        let mut block =
            segment_manager.writable_block(self.addr, LEN_FIELD_SIZE, BlockHint::Existing)?;
        block.as_mut_slice().copy_from_slice(&len.to_ne_bytes());
        Ok(())
    }

    /// Address of the `index`-th element, past the length field.
    pub fn element_addr(&self, index: u32) -> Result<FarAddress> {
        self.addr
            .checked_offset(LEN_FIELD_SIZE as i64 + index as i64 * size_of::<T>() as i64)
    }

    /// Address immediately past the length field, the array's first
    /// element.
    fn elements_start(&self) -> Result<FarAddress> {
        self.addr.checked_offset(LEN_FIELD_SIZE as i64)
    }

    /// Borrow a read-only window over `capacity` elements (not including
    /// the length field).
    pub fn elements_view(
        &self,
        segment_manager: &SegmentManager,
        capacity: u32,
    ) -> Result<ReadonlyBlock> {
        segment_manager.readonly_block(self.elements_start()?, capacity * size_of::<T>() as u32)
    }

    /// Borrow a writable window over `capacity` elements (not including
    /// the length field).
    pub fn elements_wr(
        &self,
        segment_manager: &SegmentManager,
        capacity: u32,
        hint: BlockHint,
    ) -> Result<WritableBlock> {
        segment_manager.writable_block(
            self.elements_start()?,
            capacity * size_of::<T>() as u32,
            hint,
        )
    }
}

impl<T> Clone for PersistedSizedArray<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PersistedSizedArray<T> {}
