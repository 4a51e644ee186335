//! Transaction lifecycle: id assignment, active-set tracking, and
//! commit/rollback driving the write-ahead log and the shadow-page change
//! history (C9).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use vtm_core::error::{Error, Result};
use vtm_core::region::Rwr;
use vtm_durability::{Record, RecordBody, WalWriter};

use crate::history::ChangeHistory;
use crate::shadow::{AccessMode, ShadowBuffer};

/// Lifecycle state of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Open for reads and writes.
    Active,
    /// Committed: writes materialized, WAL commit record fsynced.
    Committed,
    /// Rolled back: writes discarded.
    RolledBack,
}

/// A hook fired exactly once when a transaction ends, after its outcome
/// (commit or rollback) has already been decided but before it is dropped
/// from the manager's active set.
///
/// Mirrors the source material's `BeforeTransactionEnd` listener — used for
/// things like releasing transaction-scoped resources that must not outlive
/// the transaction itself.
pub trait BeforeTransactionEnd: Send + Sync {
    /// Called with the transaction's id and final state.
    fn on_transaction_end(&self, tx_id: u64, state: TxState);
}

/// A single transaction's view of the database.
pub struct Transaction {
    id: u64,
    manager: Arc<TransactionManagerInner>,
    ended: AtomicBool,
    shadows: Mutex<Vec<Arc<ShadowBuffer>>>,
}

impl Transaction {
    /// This transaction's id, monotonically assigned at [`TransactionManager::begin`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolve a shadow for `region` under this transaction.
    ///
    /// Returns `Ok(None)` for a write whose region conflicts with another
    /// active transaction's write — the caller should retry the whole
    /// transaction (see [`crate::retry::transactional_yield_retry`]) rather
    /// than treat this as a hard error.
    pub fn buffer_of_region(
        &self,
        region: Rwr,
        mode: AccessMode,
    ) -> Result<Option<Arc<ShadowBuffer>>> {
        self.check_active()?;
        let shadow = self.manager.history.buffer_of_region(region, self.id, mode, None)?;
        if let Some(shadow) = &shadow {
            if shadow.mode() == AccessMode::Write {
                self.shadows.lock().push(shadow.clone());
            }
        }
        Ok(shadow)
    }

    /// Commit this transaction: append a `Write` record per captured shadow,
    /// fsync a `Commit` terminator, then materialize the shadows into the
    /// mapped segments.
    ///
    /// If the WAL append itself fails, the transaction is forced to
    /// [`TxState::RolledBack`] instead of left dangling active — a
    /// transaction whose durability step failed must not silently keep
    /// holding write locks on its regions.
    pub fn commit(self) -> Result<()> {
        self.check_active()?;
        let shadows = self.shadows.lock().clone();
        let write_result = self.write_wal_records(&shadows);
        match write_result {
            Ok(()) => {
                self.manager.history.on_commit(self.id)?;
                self.manager.finish(self.id, TxState::Committed);
                self.ended.store(true, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                warn!(tx_id = self.id, error = %err, "WAL append failed during commit, rolling back");
                self.manager.history.on_rollback(self.id);
                self.manager.finish(self.id, TxState::RolledBack);
                self.ended.store(true, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Roll back this transaction, discarding every shadow it captured.
    pub fn rollback(self) -> Result<()> {
        self.check_active()?;
        let record = Record {
            tx_id: self.id,
            body: RecordBody::Rollback,
        };
        self.manager.wal.append(&record)?;
        self.manager.history.on_rollback(self.id);
        self.manager.finish(self.id, TxState::RolledBack);
        self.ended.store(true, Ordering::Release);
        Ok(())
    }

    fn write_wal_records(&self, shadows: &[Arc<ShadowBuffer>]) -> Result<()> {
        for shadow in shadows {
            let record = Record {
                tx_id: self.id,
                body: RecordBody::Write {
                    region: shadow.region(),
                    bytes: shadow.bytes(),
                },
            };
            self.manager.wal.append(&record)?;
        }
        let commit = Record {
            tx_id: self.id,
            body: RecordBody::Commit,
        };
        self.manager.wal.append(&commit)
    }

    fn check_active(&self) -> Result<()> {
        if self.ended.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!(
                "transaction {} has already ended",
                self.id
            )));
        }
        Ok(())
    }
}

impl Drop for Transaction {
    /// A transaction dropped without an explicit commit/rollback is rolled
    /// back, the same way an RAII guard undoes an incomplete operation.
    fn drop(&mut self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            self.manager.history.on_rollback(self.id);
            self.manager.finish(self.id, TxState::RolledBack);
            debug!(tx_id = self.id, "transaction dropped without explicit outcome, rolled back");
        }
    }
}

struct TransactionManagerInner {
    next_id: AtomicU64,
    active: DashMap<u64, ()>,
    history: Arc<ChangeHistory>,
    wal: Arc<WalWriter>,
    handlers: Mutex<Vec<Arc<dyn BeforeTransactionEnd>>>,
}

impl TransactionManagerInner {
    fn finish(&self, tx_id: u64, state: TxState) {
        for handler in self.handlers.lock().iter() {
            handler.on_transaction_end(tx_id, state);
        }
        self.active.remove(&tx_id);
    }
}

/// Owns transaction id assignment and wires the shadow-page change history
/// to the write-ahead log.
///
/// This is the real entry point for starting a transaction: the segment
/// manager underneath has no notion of transactions at all (see
/// `vtm-storage`'s crate doc), so `begin` lives here rather than on
/// `SegmentManager` to avoid a dependency cycle between the storage and
/// concurrency crates.
pub struct TransactionManager {
    inner: Arc<TransactionManagerInner>,
}

impl TransactionManager {
    /// Build a transaction manager over `history` and `wal`. `first_tx_id`
    /// lets a reopened database resume id assignment past whatever the WAL
    /// replay already observed, so ids never repeat across a restart.
    pub fn new(history: Arc<ChangeHistory>, wal: Arc<WalWriter>, first_tx_id: u64) -> Self {
        TransactionManager {
            inner: Arc::new(TransactionManagerInner {
                next_id: AtomicU64::new(first_tx_id),
                active: DashMap::new(),
                history,
                wal,
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a hook to run whenever any transaction this manager owns
    /// ends, in registration order.
    pub fn register_handler(&self, handler: Arc<dyn BeforeTransactionEnd>) {
        self.inner.handlers.lock().push(handler);
    }

    /// Number of transactions currently active.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Begin a new transaction with a freshly assigned, monotonically
    /// increasing id.
    pub fn begin(&self) -> Transaction {
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        self.inner.active.insert(id, ());
        self.inner.history.on_new_transaction(id);
        debug!(tx_id = id, "transaction started");
        Transaction {
            id,
            manager: self.inner.clone(),
            ended: AtomicBool::new(false),
            shadows: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc as StdArc;

    use vtm_core::address::FarAddress;
    use vtm_core::limits::MIN_SEGMENT_SIZE;
    use vtm_storage::{SegmentManager, SEGMENT_HEADER_SIZE};

    fn test_setup() -> (Arc<SegmentManager>, TransactionManager) {
        let segment_dir = tempfile::tempdir().unwrap();
        let wal_dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(
            SegmentManager::create_new(segment_dir.path().join("db.vtm"), MIN_SEGMENT_SIZE).unwrap(),
        );
        let history = Arc::new(ChangeHistory::new(manager.clone(), 4096));
        let wal = Arc::new(WalWriter::open(wal_dir.path(), 5).unwrap());
        std::mem::forget(segment_dir);
        std::mem::forget(wal_dir);
        (manager, TransactionManager::new(history, wal, 0))
    }

    #[test]
    fn ids_are_assigned_monotonically() {
        let (_manager, txm) = test_setup();
        let t1 = txm.begin();
        let t2 = txm.begin();
        assert_eq!(t1.id(), 0);
        assert_eq!(t2.id(), 1);
    }

    #[test]
    fn commit_materializes_bytes_and_removes_from_active_set() {
        let (manager, txm) = test_setup();
        let tx = txm.begin();
        let rwr = Rwr::new(FarAddress::new(0, SEGMENT_HEADER_SIZE), 4);
        let shadow = tx.buffer_of_region(rwr, AccessMode::Write).unwrap().unwrap();
        shadow.set_bytes(vec![9, 9, 9, 9]);
        assert_eq!(txm.active_count(), 1);
        tx.commit().unwrap();
        assert_eq!(txm.active_count(), 0);

        let block = manager.readonly_block(rwr.address(), 4).unwrap();
        assert_eq!(block.as_slice(), &[9, 9, 9, 9]);
    }

    #[test]
    fn rollback_discards_writes() {
        let (manager, txm) = test_setup();
        let tx = txm.begin();
        let rwr = Rwr::new(FarAddress::new(0, SEGMENT_HEADER_SIZE), 4);
        let shadow = tx.buffer_of_region(rwr, AccessMode::Write).unwrap().unwrap();
        shadow.set_bytes(vec![1, 1, 1, 1]);
        tx.rollback().unwrap();

        let block = manager.readonly_block(rwr.address(), 4).unwrap();
        assert_eq!(block.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn overlapping_write_from_a_second_transaction_is_refused() {
        let (_manager, txm) = test_setup();
        let tx1 = txm.begin();
        let tx2 = txm.begin();
        let rwr = Rwr::new(FarAddress::new(0, SEGMENT_HEADER_SIZE), 8);
        assert!(tx1.buffer_of_region(rwr, AccessMode::Write).unwrap().is_some());
        assert!(tx2.buffer_of_region(rwr, AccessMode::Write).unwrap().is_none());
    }

    #[test]
    fn dropping_a_transaction_without_an_outcome_rolls_it_back() {
        let (manager, txm) = test_setup();
        let rwr = Rwr::new(FarAddress::new(0, SEGMENT_HEADER_SIZE), 4);
        {
            let tx = txm.begin();
            let shadow = tx.buffer_of_region(rwr, AccessMode::Write).unwrap().unwrap();
            shadow.set_bytes(vec![7; 4]);
            // tx dropped here without commit/rollback
        }
        assert_eq!(txm.active_count(), 0);
        let block = manager.readonly_block(rwr.address(), 4).unwrap();
        assert_eq!(block.as_slice(), &[0, 0, 0, 0]);
    }

    #[test]
    fn registered_handler_observes_every_transaction_end() {
        struct Counter(AtomicU32);
        impl BeforeTransactionEnd for Counter {
            fn on_transaction_end(&self, _tx_id: u64, _state: TxState) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let (_manager, txm) = test_setup();
        let counter = StdArc::new(Counter(AtomicU32::new(0)));
        txm.register_handler(counter.clone());

        let tx1 = txm.begin();
        tx1.commit().unwrap();
        let tx2 = txm.begin();
        tx2.rollback().unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn read_only_transaction_commits_without_any_shadows() {
        let (_manager, txm) = test_setup();
        let tx = txm.begin();
        let rwr = Rwr::new(FarAddress::new(0, SEGMENT_HEADER_SIZE), 4);
        let shadow = tx.buffer_of_region(rwr, AccessMode::Read).unwrap().unwrap();
        assert_eq!(shadow.bytes(), vec![0; 4]);
        assert!(tx.commit().is_ok());
    }
}
