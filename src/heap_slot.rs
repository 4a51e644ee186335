//! Adapts [`HeapManager`] to the [`Slot`] trait so the segment topology can
//! reserve and bootstrap one heap arena per segment.

use std::sync::Arc;

use dashmap::DashMap;

use vtm_core::address::{SegmentIndex, SegmentPos};
use vtm_core::error::Result;
use vtm_storage::{HeapManager, SegmentManager, Slot};

/// A [`Slot`] that gives every segment its own [`HeapManager`], keyed by
/// segment index so concurrent allocations against different segments never
/// contend on the same free-list.
pub struct HeapManagerSlot {
    managers: DashMap<SegmentIndex, Arc<HeapManager>>,
}

impl HeapManagerSlot {
    /// Build an empty slot. Heap managers are created lazily, one per
    /// segment, as [`Slot::on_new_segment`] / [`Slot::open`] are driven.
    pub fn new() -> Self {
        HeapManagerSlot {
            managers: DashMap::new(),
        }
    }

    /// The heap manager bootstrapped for `segment`, if any.
    pub fn manager(&self, segment: SegmentIndex) -> Option<Arc<HeapManager>> {
        self.managers.get(&segment).map(|entry| entry.clone())
    }
}

impl Default for HeapManagerSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Slot for HeapManagerSlot {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn has_residence(&self, _segment_index: SegmentIndex) -> bool {
        true
    }

    fn byte_size(&self, _segment_start: SegmentPos) -> u32 {
        // Claims whatever space is left in the segment once earlier slots
        // have taken theirs; must be last in the topology's slot order.
        0
    }

    fn on_new_segment(
        &self,
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
        start: SegmentPos,
    ) -> Result<()> {
        let heap = HeapManager::new(segment, start, segment_manager.segment_size());
        self.managers.insert(segment, Arc::new(heap));
        Ok(())
    }

    fn open(
        &self,
        segment_manager: &SegmentManager,
        segment: SegmentIndex,
        start: SegmentPos,
    ) -> Result<()> {
        let heap =
            HeapManager::open_existing(segment_manager, segment, start, segment_manager.segment_size())?;
        self.managers.insert(segment, Arc::new(heap));
        Ok(())
    }

    fn release_segment(&self, segment: SegmentIndex) {
        self.managers.remove(&segment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtm_core::limits::MIN_SEGMENT_SIZE;
    use vtm_storage::SegmentTopology;

    fn test_manager() -> SegmentManager {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let manager = SegmentManager::create_new(&path, MIN_SEGMENT_SIZE).unwrap();
        std::mem::forget(dir);
        manager
    }

    #[test]
    fn bootstrapping_a_new_segment_makes_its_heap_manager_available() {
        let manager = test_manager();
        let slot = Arc::new(HeapManagerSlot::new());
        let topology = SegmentTopology::new(vec![slot.clone()]);
        topology.on_segment_allocated(&manager, 0).unwrap();

        let heap = slot.manager(0).expect("heap manager present after bootstrap");
        let addr = heap.allocate(&manager, 64).unwrap();
        assert_eq!(addr.segment(), 0);
    }

    #[test]
    fn reopening_preserves_previously_allocated_blocks() {
        let manager = test_manager();
        let slot = Arc::new(HeapManagerSlot::new());
        let topology = SegmentTopology::new(vec![slot.clone()]);
        topology.on_segment_allocated(&manager, 0).unwrap();
        let heap = slot.manager(0).unwrap();
        let first = heap.allocate(&manager, 64).unwrap();

        let reopened_slot = Arc::new(HeapManagerSlot::new());
        let reopened_topology = SegmentTopology::new(vec![reopened_slot.clone()]);
        reopened_topology.on_segment_opening(&manager, 0).unwrap();
        let reopened_heap = reopened_slot.manager(0).unwrap();

        let second = reopened_heap.allocate(&manager, 64).unwrap();
        assert_ne!(first, second);
    }
}
