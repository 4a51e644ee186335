//! `vtmdb` — a transactional, segment-based persistent-memory engine.
//!
//! This crate is the facade that wires together the four path crates into
//! one database handle:
//!
//! - `vtm-storage` — memory-mapped segments, the heap allocator, and the
//!   segment topology that reserves a fixed layout inside every segment.
//! - `vtm-concurrency` — MVCC shadow-page transactions, lock-free indexes.
//! - `vtm-durability` — the rotating write-ahead log and crash recovery.
//!
//! [`Database::create_new`] formats a brand-new backing file;
//! [`Database::open_existing`] reopens one, replaying its WAL to restore
//! any committed-but-unflushed writes before handing out a usable handle.

#![warn(missing_docs)]

mod config;
mod heap_slot;

pub use config::{ConfigError, DatabaseConfig};
pub use heap_slot::HeapManagerSlot;
pub use vtm_concurrency::{AccessMode, BeforeTransactionEnd as TransactionEndHook, Transaction, TxState};
pub use vtm_core::address::FarAddress;
pub use vtm_core::region::Rwr;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{info, instrument, trace};

use vtm_concurrency::{ChangeHistory, TransactionManager};
use vtm_core::address::SegmentIndex;
use vtm_core::error::{Error, Result};
use vtm_durability::{gc_with_names, replay_with_names, ReplayHandler, ReplayReport, WalWriter};
use vtm_storage::{BlockHint, SegmentManager, SegmentTopology};

/// A handle to an open database: a memory-mapped segment file, its heap
/// allocators, and the transaction manager driving commits against the
/// write-ahead log.
///
/// Cloning a `Database` is not supported; share one instance behind an
/// `Arc` across threads instead — every method here takes `&self`.
pub struct Database {
    segment_manager: Arc<SegmentManager>,
    topology: Arc<SegmentTopology>,
    heap_slot: Arc<HeapManagerSlot>,
    transactions: TransactionManager,
    wal: Arc<WalWriter>,
    wal_prefix: String,
    wal_suffix: String,
    alloc_cursor: AtomicU32,
}

impl Database {
    /// Format a brand-new database at `path`. Fails if `path` already
    /// exists — use [`Self::open_existing`] to reopen one.
    #[instrument(skip(config), fields(path = %path.as_ref().display()))]
    pub fn create_new<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self> {
        config.validate().map_err(|e| Error::InvalidState(e.to_string()))?;
        let path = path.as_ref();

        let segment_manager = Arc::new(SegmentManager::create_new(path, config.segment_size)?);
        let heap_slot = Arc::new(HeapManagerSlot::new());
        let topology = Arc::new(SegmentTopology::new(vec![heap_slot.clone()]));
        // `SegmentManager::create_new` already formatted segment 0 before we
        // could register a listener for it, so the topology is bootstrapped
        // directly here rather than through a `SegmentEventListener`.
        topology.on_segment_allocated(&segment_manager, 0)?;

        let wal_dir = wal_dir_for(path);
        let wal = Arc::new(WalWriter::open_with_names(
            &wal_dir,
            &config.wal_prefix,
            &config.wal_suffix,
            config.transactions_per_file,
        )?);

        let history = Arc::new(ChangeHistory::new(segment_manager.clone(), config.conflict_bucket_span));
        let transactions = TransactionManager::new(history, wal.clone(), 0);

        info!(target: %config.log_target, segment_size = config.segment_size, "created new database");

        Ok(Database {
            segment_manager,
            topology,
            heap_slot,
            transactions,
            wal,
            wal_prefix: config.wal_prefix,
            wal_suffix: config.wal_suffix,
            alloc_cursor: AtomicU32::new(0),
        })
    }

    /// Reopen a previously-created database at `path`, replaying its WAL to
    /// restore any writes that committed but never made it into a flushed
    /// segment.
    #[instrument(skip(config), fields(path = %path.as_ref().display()))]
    pub fn open_existing<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self> {
        config.validate().map_err(|e| Error::InvalidState(e.to_string()))?;
        let path = path.as_ref();

        let segment_manager = Arc::new(SegmentManager::open_existing(path)?);
        let heap_slot = Arc::new(HeapManagerSlot::new());
        let topology = Arc::new(SegmentTopology::new(vec![heap_slot.clone()]));
        for segment in 0..segment_manager.segment_count() {
            topology.on_segment_opening(&segment_manager, segment)?;
        }

        let wal_dir = wal_dir_for(path);
        let mut recovery_handler = SegmentWriteHandler {
            segment_manager: segment_manager.clone(),
        };
        let report = replay_with_names(&wal_dir, &config.wal_prefix, &config.wal_suffix, &mut recovery_handler)?;
        info!(
            target: %config.log_target,
            committed = report.committed,
            rolled_back = report.rolled_back,
            abandoned = report.abandoned,
            "replayed write-ahead log on open"
        );
        segment_manager.flush_all(false)?;

        let wal = Arc::new(WalWriter::open_with_names(
            &wal_dir,
            &config.wal_prefix,
            &config.wal_suffix,
            config.transactions_per_file,
        )?);

        let first_tx_id = next_tx_id(&report);
        let history = Arc::new(ChangeHistory::new(segment_manager.clone(), config.conflict_bucket_span));
        let transactions = TransactionManager::new(history, wal.clone(), first_tx_id);

        let alloc_cursor = segment_manager.segment_count().saturating_sub(1);

        Ok(Database {
            segment_manager,
            topology,
            heap_slot,
            transactions,
            wal,
            wal_prefix: config.wal_prefix,
            wal_suffix: config.wal_suffix,
            alloc_cursor: AtomicU32::new(alloc_cursor),
        })
    }

    /// Begin a new transaction. Dropping it without calling
    /// [`Transaction::commit`] or [`Transaction::rollback`] rolls it back.
    pub fn begin_transaction(&self) -> Transaction {
        self.transactions.begin()
    }

    /// Register a handler to be notified whenever any transaction ends,
    /// committed or rolled back.
    pub fn register_end_handler(&self, handler: Arc<dyn TransactionEndHook>) {
        self.transactions.register_handler(handler);
    }

    /// Number of transactions currently active.
    pub fn active_transaction_count(&self) -> usize {
        self.transactions.active_count()
    }

    /// Allocate `requested` bytes from the heap, growing into a new segment
    /// if every existing one is full.
    ///
    /// The search starts from the highest segment a prior call succeeded
    /// against and only moves forward, since earlier segments that have
    /// been exhausted once do not un-exhaust themselves.
    #[instrument(skip(self))]
    pub fn allocate(&self, requested: u32) -> Result<FarAddress> {
        loop {
            let segment = self.alloc_cursor.load(Ordering::Acquire);
            let heap = self.ensure_heap_manager(segment)?;
            match heap.allocate(&self.segment_manager, requested) {
                Ok(addr) => return Ok(addr),
                Err(Error::NoMemory(_)) | Err(Error::MemoryNeedCompression { .. }) => {
                    trace!(segment, "segment exhausted, growing into the next one");
                    self.alloc_cursor.fetch_max(segment + 1, Ordering::AcqRel);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return a previously-allocated block to its segment's heap.
    pub fn deallocate(&self, user_addr: FarAddress) -> Result<()> {
        let heap = self.heap_slot.manager(user_addr.segment()).ok_or_else(|| {
            Error::InvalidState(format!("segment {} has no heap manager", user_addr.segment()))
        })?;
        heap.deallocate(&self.segment_manager, user_addr)
    }

    /// Flush every mapped segment and the current WAL file to the OS.
    /// Pass `asynchronous = true` to request a non-blocking `msync`.
    pub fn flush(&self, asynchronous: bool) -> Result<()> {
        self.segment_manager.flush_all(asynchronous)?;
        self.wal.flush()
    }

    /// Delete WAL files that are entirely superseded by `oldest_live_tx_id`
    /// — the lowest transaction id any still-open transaction might need to
    /// see. Returns the suffix numbers deleted.
    pub fn gc_wal(&self, oldest_live_tx_id: u64) -> Result<Vec<u32>> {
        gc_with_names(self.wal.dir(), &self.wal_prefix, &self.wal_suffix, oldest_live_tx_id)
    }

    /// The configured segment size.
    pub fn segment_size(&self) -> u32 {
        self.segment_manager.segment_size()
    }

    /// Number of segments currently mapped.
    pub fn segment_count(&self) -> SegmentIndex {
        self.segment_manager.segment_count()
    }

    fn ensure_heap_manager(&self, segment: SegmentIndex) -> Result<Arc<vtm_storage::HeapManager>> {
        if let Some(existing) = self.heap_slot.manager(segment) {
            return Ok(existing);
        }
        let is_new = segment >= self.segment_manager.segment_count();
        self.segment_manager.ensure_segment(segment)?;
        if is_new {
            self.topology.on_segment_allocated(&self.segment_manager, segment)?;
        } else {
            self.topology.on_segment_opening(&self.segment_manager, segment)?;
        }
        self.heap_slot
            .manager(segment)
            .ok_or_else(|| Error::InvalidState(format!("heap slot did not bootstrap segment {segment}")))
    }
}

fn next_tx_id(report: &ReplayReport) -> u64 {
    report.max_tx_id.map_or(0, |max| max + 1)
}

/// The directory a database's WAL files live in, sibling to its backing
/// file rather than inside it.
fn wal_dir_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".wal");
    path.with_file_name(name)
}

/// Applies replayed committed writes directly into mapped segments,
/// bypassing the transaction and shadow-history layers entirely — recovery
/// has no concept of "in progress", only "happened" or "didn't".
struct SegmentWriteHandler {
    segment_manager: Arc<SegmentManager>,
}

impl ReplayHandler for SegmentWriteHandler {
    fn apply_write(&mut self, _tx_id: u64, region: Rwr, bytes: &[u8]) -> Result<()> {
        let mut block =
            self.segment_manager
                .writable_block(region.address(), region.byte_count(), BlockHint::Existing)?;
        block.as_mut_slice().copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtm_concurrency::AccessMode;

    fn config() -> DatabaseConfig {
        DatabaseConfig::for_testing()
    }

    #[test]
    fn create_then_allocate_and_commit_a_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let db = Database::create_new(&path, config()).unwrap();

        let addr = db.allocate(64).unwrap();
        let tx = db.begin_transaction();
        let region = Rwr::new(addr, 4);
        let shadow = tx.buffer_of_region(region, AccessMode::Write).unwrap().unwrap();
        shadow.set_bytes(vec![1, 2, 3, 4]);
        tx.commit().unwrap();

        db.flush(false).unwrap();
    }

    #[test]
    fn a_write_survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let addr;
        {
            let db = Database::create_new(&path, config()).unwrap();
            addr = db.allocate(64).unwrap();
            let tx = db.begin_transaction();
            let region = Rwr::new(addr, 4);
            let shadow = tx.buffer_of_region(region, AccessMode::Write).unwrap().unwrap();
            shadow.set_bytes(vec![9, 9, 9, 9]);
            tx.commit().unwrap();
            db.flush(false).unwrap();
        }

        let db = Database::open_existing(&path, config()).unwrap();
        let region = Rwr::new(addr, 4);
        let tx = db.begin_transaction();
        let shadow = tx.buffer_of_region(region, AccessMode::Read).unwrap().unwrap();
        assert_eq!(shadow.bytes(), vec![9, 9, 9, 9]);
        tx.commit().unwrap();
    }

    #[test]
    fn reopen_does_not_treat_live_allocations_as_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let first;
        {
            let db = Database::create_new(&path, config()).unwrap();
            first = db.allocate(128).unwrap();
        }

        let db = Database::open_existing(&path, config()).unwrap();
        let second = db.allocate(128).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn rolled_back_write_is_not_visible_to_a_later_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let db = Database::create_new(&path, config()).unwrap();
        let addr = db.allocate(64).unwrap();
        let region = Rwr::new(addr, 4);

        let tx = db.begin_transaction();
        let shadow = tx.buffer_of_region(region, AccessMode::Write).unwrap().unwrap();
        shadow.set_bytes(vec![5, 5, 5, 5]);
        tx.rollback().unwrap();

        let reader = db.begin_transaction();
        let shadow = reader.buffer_of_region(region, AccessMode::Read).unwrap().unwrap();
        assert_eq!(shadow.bytes(), vec![0, 0, 0, 0]);
        reader.commit().unwrap();
    }

    #[test]
    fn allocation_grows_into_a_new_segment_once_the_first_is_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let db = Database::create_new(&path, config()).unwrap();

        let mut last_segment = 0;
        for _ in 0..64 {
            let addr = db.allocate(4096).unwrap();
            last_segment = addr.segment();
        }
        assert!(last_segment >= 1, "allocator never grew past segment 0");
    }

    #[test]
    fn wal_gc_deletes_sealed_files_once_their_transactions_are_obsolete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.vtm");
        let db = Database::create_new(&path, config()).unwrap();

        for _ in 0..20 {
            let addr = db.allocate(32).unwrap();
            let tx = db.begin_transaction();
            let shadow = tx
                .buffer_of_region(Rwr::new(addr, 4), AccessMode::Write)
                .unwrap()
                .unwrap();
            shadow.set_bytes(vec![1, 1, 1, 1]);
            tx.commit().unwrap();
        }

        let deleted = db.gc_wal(u64::MAX).unwrap();
        assert!(!deleted.is_empty(), "expected at least one obsolete WAL file");
    }
}
