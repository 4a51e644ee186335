//! A per-transaction copy-on-write buffer shadowing one region's committed
//! bytes (C7).

use parking_lot::Mutex;

use vtm_core::region::Rwr;

/// Whether a shadow was opened for reading or for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// A read snapshot; never materialized back into the mapped region.
    Read,
    /// A writable shadow; materialized on commit, discarded on rollback.
    Write,
}

/// Lifecycle state of one [`ShadowBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    /// Captured and visible only to its owning transaction.
    Captured,
    /// Materialized into the mapped region; the transaction that owned it
    /// has ended successfully.
    Committed,
    /// Discarded without being materialized.
    RolledBack,
}

/// An off-heap (i.e. outside any segment's heap arena — a plain process
/// allocation) private copy of one region's bytes, owned by exactly one
/// transaction.
pub struct ShadowBuffer {
    rwr: Rwr,
    owner_tx: u64,
    mode: AccessMode,
    bytes: Mutex<Vec<u8>>,
    state: Mutex<ShadowState>,
}

impl ShadowBuffer {
    /// Capture `bytes` (already sized to `rwr.byte_count()`) as a new
    /// shadow owned by `owner_tx`.
    pub fn new(rwr: Rwr, owner_tx: u64, mode: AccessMode, bytes: Vec<u8>) -> Self {
        debug_assert_eq!(bytes.len(), rwr.byte_count() as usize);
        ShadowBuffer {
            rwr,
            owner_tx,
            mode,
            bytes: Mutex::new(bytes),
            state: Mutex::new(ShadowState::Captured),
        }
    }

    /// The region this buffer shadows.
    pub fn region(&self) -> Rwr {
        self.rwr
    }

    /// The transaction that owns this shadow.
    pub fn owner_tx(&self) -> u64 {
        self.owner_tx
    }

    /// Whether this shadow was opened for reading or writing.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ShadowState {
        *self.state.lock()
    }

    /// Whether this shadow is still active (neither committed nor rolled
    /// back) — the state a conflict probe cares about.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), ShadowState::Captured)
    }

    /// Copy of the currently-shadowed bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Overwrite the shadowed bytes in place. Only meaningful for
    /// [`AccessMode::Write`] shadows.
    pub fn set_bytes(&self, bytes: Vec<u8>) {
        debug_assert_eq!(bytes.len(), self.rwr.byte_count() as usize);
        *self.bytes.lock() = bytes;
    }

    /// Transition to [`ShadowState::Committed`].
    pub fn mark_committed(&self) {
        *self.state.lock() = ShadowState::Committed;
    }

    /// Transition to [`ShadowState::RolledBack`].
    pub fn mark_rolled_back(&self) {
        *self.state.lock() = ShadowState::RolledBack;
    }
}
