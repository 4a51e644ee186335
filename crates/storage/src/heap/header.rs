//! The header stamped before every heap allocation (and recycled as a free
//! list link when the block is free).

use vtm_core::address::FarAddress;
use vtm_core::error::{Error, Result};
use vtm_core::limits::HEAP_BLOCK_SIGNATURE;

/// On-disk size of [`HeapBlockHeader`]: `flags_and_signature: u32 | size:
/// u32 | next: u64`, already 16-byte aligned.
pub const HEAP_BLOCK_HEADER_SIZE: u32 = 16;

const FREE_BIT: u32 = 1 << 31;
const SIGNATURE_MASK: u32 = !FREE_BIT;

/// Header preceding every block carved out of a segment's heap.
///
/// While a block is free its `next` field doubles as the forward pointer of
/// the free-list bucket it lives in (see [`crate::heap::skiplist`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlockHeader {
    free: bool,
    /// User-visible payload size in bytes, not counting this header.
    size: u32,
    next: FarAddress,
}

impl HeapBlockHeader {
    /// Build a header for a freshly carved block of `size` payload bytes.
    pub fn new(size: u32, free: bool) -> Self {
        HeapBlockHeader {
            free,
            size,
            next: FarAddress::NIL,
        }
    }

    /// Whether this block is currently on a free list.
    pub fn is_free(&self) -> bool {
        self.free
    }

    /// Mark this block free or occupied.
    pub fn set_free(&mut self, free: bool) {
        self.free = free;
    }

    /// User-visible payload size.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Set the user-visible payload size.
    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    /// Total bytes this block occupies, header included.
    pub fn real_size(&self) -> u32 {
        self.size + HEAP_BLOCK_HEADER_SIZE
    }

    /// Forward link: the next free block in the same skiplist bucket when
    /// this block is free, or [`FarAddress::NIL`] when occupied or tail.
    pub fn next(&self) -> FarAddress {
        self.next
    }

    /// Set the forward link.
    pub fn set_next(&mut self, next: FarAddress) {
        self.next = next;
    }

    /// Address of the header given the address of the user payload it
    /// precedes.
    pub fn header_addr_for(user_addr: FarAddress) -> Result<FarAddress> {
        user_addr.checked_offset(-(HEAP_BLOCK_HEADER_SIZE as i64))
    }

    /// Address of the user payload given the address of its header.
    pub fn user_addr_for(header_addr: FarAddress) -> FarAddress {
        header_addr + HEAP_BLOCK_HEADER_SIZE
    }

    /// Serialize into the fixed 16-byte on-disk representation.
    pub fn to_bytes(self) -> [u8; HEAP_BLOCK_HEADER_SIZE as usize] {
        let mut bytes = [0u8; HEAP_BLOCK_HEADER_SIZE as usize];
        let mut flags = HEAP_BLOCK_SIGNATURE & SIGNATURE_MASK;
        if self.free {
            flags |= FREE_BIT;
        }
        bytes[0..4].copy_from_slice(&flags.to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_ne_bytes());
        bytes[8..16].copy_from_slice(&self.next.raw().to_ne_bytes());
        bytes
    }

    /// Parse a header from raw bytes, validating the embedded signature.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEAP_BLOCK_HEADER_SIZE as usize {
            return Err(Error::Corruption(format!(
                "heap block header truncated: expected {HEAP_BLOCK_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let flags = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
        if flags & SIGNATURE_MASK != HEAP_BLOCK_SIGNATURE & SIGNATURE_MASK {
            return Err(Error::Corruption(format!(
                "heap block signature mismatch: expected {:#x}, got {:#x}",
                HEAP_BLOCK_SIGNATURE,
                flags & SIGNATURE_MASK
            )));
        }
        let size = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
        let next = FarAddress::from_raw(u64::from_ne_bytes(bytes[8..16].try_into().unwrap()));
        Ok(HeapBlockHeader {
            free: flags & FREE_BIT != 0,
            size,
            next,
        })
    }
}
