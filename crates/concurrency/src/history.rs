//! Shadow-page change history: per-transaction copy-on-write buffers,
//! indexed by region so concurrent transactions can detect overlapping
//! writes (C7).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use vtm_core::address::FarAddress;
use vtm_core::error::{Error, Result};
use vtm_core::region::Rwr;
use vtm_storage::{BlockHint, SegmentManager};

use crate::bucket_index::BucketIndexedList;
use crate::shadow::{AccessMode, ShadowBuffer, ShadowState};

/// Number of address buckets the conflict index is split across. Picked
/// large enough that realistic concurrent write-sets keep the per-bucket
/// Bloom filter sparse (see `bucket_index::tests::bloom_false_positive_rate`).
const DEFAULT_NUM_BUCKETS: usize = 1024;

/// Number of region-lock shards guarding the commit-time materialize step.
/// A fixed, modest count — contention here is rare since a region's
/// shadow's commit is already serialized by that region's own conflict
/// exclusion.
const REGION_LOCK_SHARDS: usize = 64;

/// Maintains, for each active transaction, the set of regions it has
/// captured a shadow for, plus a bucket-indexed list used to find
/// conflicting shadows held by *other* transactions.
pub struct ChangeHistory {
    segment_manager: Arc<SegmentManager>,
    bucket_span: u64,
    index: BucketIndexedList<Arc<ShadowBuffer>>,
    per_tx: DashMap<u64, Vec<Arc<ShadowBuffer>>>,
    region_locks: Vec<RwLock<()>>,
}

impl ChangeHistory {
    /// Build a change history over `segment_manager`, partitioning the
    /// address space into conflict-index buckets of `bucket_span` bytes
    /// each.
    pub fn new(segment_manager: Arc<SegmentManager>, bucket_span: u32) -> Self {
        Self::with_bucket_count(segment_manager, bucket_span, DEFAULT_NUM_BUCKETS)
    }

    /// Like [`Self::new`] with an explicit bucket count, mainly for tests
    /// that want to exercise a small index.
    pub fn with_bucket_count(
        segment_manager: Arc<SegmentManager>,
        bucket_span: u32,
        num_buckets: usize,
    ) -> Self {
        ChangeHistory {
            segment_manager,
            bucket_span: bucket_span.max(1) as u64,
            index: BucketIndexedList::new(num_buckets),
            per_tx: DashMap::new(),
            region_locks: (0..REGION_LOCK_SHARDS).map(|_| RwLock::new(())).collect(),
        }
    }

    /// Prepare bookkeeping for a freshly begun transaction.
    pub fn on_new_transaction(&self, tx_id: u64) {
        self.per_tx.insert(tx_id, Vec::new());
    }

    /// Resolve a shadow for `rwr` on behalf of `tx_id`.
    ///
    /// Write mode fails (returns `Ok(None)`) if another active transaction
    /// already holds an overlapping region. Read mode returns the caller's
    /// own covering shadow if one exists, otherwise a fresh read-only
    /// snapshot of the current committed bytes.
    pub fn buffer_of_region(
        &self,
        rwr: Rwr,
        tx_id: u64,
        mode: AccessMode,
        init_bytes: Option<&[u8]>,
    ) -> Result<Option<Arc<ShadowBuffer>>> {
        if let Some(existing) = self.find_own_covering_shadow(tx_id, rwr) {
            return Ok(Some(existing));
        }
        match mode {
            AccessMode::Read => {
                let bytes = self.read_committed(rwr)?;
                Ok(Some(Arc::new(ShadowBuffer::new(rwr, tx_id, AccessMode::Read, bytes))))
            }
            AccessMode::Write => {
                if self.has_foreign_overlap(tx_id, rwr) {
                    trace!(tx_id, ?rwr, "write region conflicts with a foreign shadow");
                    return Ok(None);
                }
                let bytes = match init_bytes {
                    Some(b) => b.to_vec(),
                    None => self.read_committed(rwr)?,
                };
                let shadow = Arc::new(ShadowBuffer::new(rwr, tx_id, AccessMode::Write, bytes));
                self.register(tx_id, rwr, shadow.clone());
                Ok(Some(shadow))
            }
        }
    }

    /// Materialize every write shadow this transaction holds into the
    /// mapped region, then mark it committed.
    pub fn on_commit(&self, tx_id: u64) -> Result<()> {
        let Some((_, shadows)) = self.per_tx.remove(&tx_id) else {
            return Ok(());
        };
        for shadow in &shadows {
            if shadow.mode() == AccessMode::Write {
                self.materialize(shadow)?;
            }
            shadow.mark_committed();
        }
        debug!(tx_id, count = shadows.len(), "committed shadow set");
        Ok(())
    }

    /// Drop every shadow this transaction holds without materializing any
    /// of them.
    pub fn on_rollback(&self, tx_id: u64) {
        if let Some((_, shadows)) = self.per_tx.remove(&tx_id) {
            for shadow in &shadows {
                shadow.mark_rolled_back();
            }
            debug!(tx_id, count = shadows.len(), "rolled back shadow set");
        }
    }

    /// Release a shadow's memory. Since shadows are reference-counted, this
    /// is a no-op beyond dropping the caller's handle — kept for parity
    /// with the source material's explicit `destroy` call.
    pub fn destroy(&self, _tx_id: u64, shadow: Arc<ShadowBuffer>) {
        drop(shadow);
    }

    fn find_own_covering_shadow(&self, tx_id: u64, rwr: Rwr) -> Option<Arc<ShadowBuffer>> {
        let shadows = self.per_tx.get(&tx_id)?;
        shadows
            .iter()
            .find(|s| covers(s.region(), rwr))
            .cloned()
    }

    fn has_foreign_overlap(&self, tx_id: u64, rwr: Rwr) -> bool {
        let mut found = false;
        for bucket in self.touched_buckets(rwr) {
            self.index.for_each_in_bucket(bucket, |shadow: &Arc<ShadowBuffer>| {
                if found {
                    return;
                }
                if shadow.owner_tx() != tx_id
                    && shadow.mode() == AccessMode::Write
                    && shadow.is_active()
                    && shadow.region().overlaps(&rwr)
                {
                    found = true;
                }
            });
            if found {
                break;
            }
        }
        found
    }

    fn register(&self, tx_id: u64, rwr: Rwr, shadow: Arc<ShadowBuffer>) {
        for bucket in self.touched_buckets(rwr) {
            self.index.insert(bucket, rwr.address().raw(), shadow.clone());
        }
        self.per_tx.entry(tx_id).or_default().push(shadow);
    }

    fn touched_buckets(&self, rwr: Rwr) -> Vec<usize> {
        let start = rwr.address().offset() as u64;
        let end = start + rwr.byte_count() as u64;
        let mut buckets = Vec::new();
        let mut pos = start - (start % self.bucket_span);
        while pos < end {
            let key = FarAddress::new(rwr.address().segment(), pos as u32).raw();
            let bucket = bucket_of(key, self.index.bucket_count());
            if !buckets.contains(&bucket) {
                buckets.push(bucket);
            }
            pos += self.bucket_span;
        }
        buckets
    }

    fn read_committed(&self, rwr: Rwr) -> Result<Vec<u8>> {
        let block = self
            .segment_manager
            .readonly_block(rwr.address(), rwr.byte_count())?;
        Ok(block.as_slice().to_vec())
    }

    fn materialize(&self, shadow: &ShadowBuffer) -> Result<()> {
        let rwr = shadow.region();
        let lock = &self.region_locks[region_lock_shard(rwr, self.region_locks.len())];
        let _guard = lock.write();
        let mut block = self.segment_manager.writable_block(
            rwr.address(),
            rwr.byte_count(),
            BlockHint::Existing,
        )?;
        let bytes = shadow.bytes();
        if bytes.len() != block.len() as usize {
            return Err(Error::InvalidState(format!(
                "shadow buffer size {} does not match region length {}",
                bytes.len(),
                block.len()
            )));
        }
        block.as_mut_slice().copy_from_slice(&bytes);
        Ok(())
    }
}

fn covers(covering: Rwr, inner: Rwr) -> bool {
    covering.address().segment() == inner.address().segment()
        && covering.address().offset() <= inner.address().offset()
        && inner.end_offset() <= covering.end_offset()
}

fn bucket_of(key: u64, num_buckets: usize) -> usize {
    (key % num_buckets as u64) as usize
}

fn region_lock_shard(rwr: Rwr, shards: usize) -> usize {
    (rwr.address().raw() as usize) % shards
}
