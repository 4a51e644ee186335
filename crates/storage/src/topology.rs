//! Segment topology: the fixed, ordered set of regions every segment
//! reserves space for, recorded in a small header right after the segment
//! header (C5).

use std::sync::Arc;

use vtm_core::address::{SegmentIndex, SegmentPos};
use vtm_core::error::{Error, Result};
use vtm_core::limits::{ALIGN, EOS};

use crate::segment::{BlockHint, SegmentManager, SEGMENT_HEADER_SIZE};

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

/// One region a segment topology reserves space for — a heap arena, a
/// node-table root, or any other fixed structure that needs to exist at a
/// stable offset in every segment it claims residence in.
///
/// The same ordered set of slots must be used for every segment of a given
/// database; [`SegmentTopology`] validates the slot *count* recorded in
/// each segment's header against the topology it was built with, which
/// catches a topology built against the wrong set of slot types.
pub trait Slot: Send + Sync {
    /// Human-readable name, used only in error/log messages.
    fn name(&self) -> &'static str;

    /// Whether this slot claims space in `segment_index`. Segment 0
    /// conventionally hosts every slot; later segments may opt out (for
    /// example, a singleton index root only ever lives in segment 0).
    fn has_residence(&self, segment_index: SegmentIndex) -> bool;

    /// Bytes to reserve for this slot, given the offset its region will
    /// start at.
    fn byte_size(&self, segment_start: SegmentPos) -> u32;

    /// Initialize this slot's region in a brand-new segment.
    fn on_new_segment(
        &self,
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
        start: SegmentPos,
    ) -> Result<()>;

    /// Reattach to this slot's region in a previously-created segment.
    fn open(
        &self,
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
        start: SegmentPos,
    ) -> Result<()>;

    /// Drop any in-memory structures this slot keeps for `segment`.
    fn release_segment(&self, _segment: SegmentIndex) {}
}

/// The ordered list of slots every segment of one database reserves space
/// for, plus the logic to stamp and read back the small per-segment header
/// that records where each resident slot landed.
pub struct SegmentTopology {
    slots: Vec<Arc<dyn Slot>>,
}

impl SegmentTopology {
    /// Build a topology from an ordered list of slots. Order is
    /// significant and must not change across the lifetime of a database.
    pub fn new(slots: Vec<Arc<dyn Slot>>) -> Self {
        SegmentTopology { slots }
    }

    /// Bytes this topology's own header occupies: a slot count followed by
    /// one `SegmentPos` per slot.
    pub fn header_byte_size(&self) -> u32 {
        align_up(4 + self.slots.len() as u32 * 4, ALIGN)
    }

    /// Offset the first slot's region can start at in any segment.
    pub fn first_slot_offset(&self) -> SegmentPos {
        SEGMENT_HEADER_SIZE + self.header_byte_size()
    }

    /// Format a brand-new segment: lay out resident slots back to back and
    /// stamp the topology header recording their offsets.
    pub fn on_segment_allocated(
        &self,
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
    ) -> Result<()> {
        let mut cursor = self.first_slot_offset();
        let mut offsets = vec![EOS; self.slots.len()];
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.has_residence(segment) {
                offsets[i] = cursor;
                let size = slot.byte_size(cursor);
                slot.on_new_segment(segment_manager, segment, cursor)?;
                cursor += align_up(size, ALIGN);
            }
        }
        self.write_header(segment_manager, segment, &offsets)
    }

    /// Reattach to a previously-formatted segment: read back the topology
    /// header and replay `open()` for each resident slot at its recorded
    /// offset.
    pub fn on_segment_opening(
        &self,
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
    ) -> Result<()> {
        let offsets = self.read_header(segment_manager, segment)?;
        for (slot, offset) in self.slots.iter().zip(offsets.iter()) {
            if *offset != EOS {
                slot.open(segment_manager, segment, *offset)?;
            }
        }
        Ok(())
    }

    /// Release every slot's in-memory state for `segment`.
    pub fn release_segment(&self, segment: SegmentIndex) {
        for slot in &self.slots {
            slot.release_segment(segment);
        }
    }

    /// Offset the resident slot named `name` starts at in `segment`, or
    /// `None` if it has no residence there.
    pub fn slot_offset(
        &self,
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
        name: &str,
    ) -> Result<Option<SegmentPos>> {
        let offsets = self.read_header(segment_manager, segment)?;
        for (slot, offset) in self.slots.iter().zip(offsets.iter()) {
            if slot.name() == name {
                return Ok(if *offset == EOS { None } else { Some(*offset) });
            }
        }
        Err(Error::InvalidState(format!("no such slot: {name}")))
    }

    fn write_header(
        &self,
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
        offsets: &[SegmentPos],
    ) -> Result<()> {
        use vtm_core::address::FarAddress;
        let addr = FarAddress::new(segment, SEGMENT_HEADER_SIZE);
        let mut block =
            segment_manager.writable_block(addr, self.header_byte_size(), BlockHint::New)?;
        let bytes = block.as_mut_slice();
        bytes[0..4].copy_from_slice(&(self.slots.len() as u32).to_ne_bytes());
        for (i, offset) in offsets.iter().enumerate() {
            let at = 4 + i * 4;
            bytes[at..at + 4].copy_from_slice(&offset.to_ne_bytes());
        }
        Ok(())
    }

    fn read_header(
        &self,
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
    ) -> Result<Vec<SegmentPos>> {
        use vtm_core::address::FarAddress;
        let addr = FarAddress::new(segment, SEGMENT_HEADER_SIZE);
        let block = segment_manager.readonly_block(addr, self.header_byte_size())?;
        let bytes = block.as_slice();
        let count = u32::from_ne_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if count != self.slots.len() {
            return Err(Error::Corruption(format!(
                "segment {segment} topology header has {count} slots, expected {}",
                self.slots.len()
            )));
        }
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let at = 4 + i * 4;
            offsets.push(u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap()));
        }
        Ok(offsets)
    }
}
