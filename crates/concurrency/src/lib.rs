//! Transaction isolation layered over `vtm-storage`'s segments: lock-free
//! append lists and their bucket-indexed variant (C6), shadow-page change
//! history (C7), and the transaction manager driving commit/rollback
//! against the write-ahead log (C9).

#![warn(missing_docs)]

pub mod append_list;
pub mod bucket_index;
pub mod history;
pub mod retry;
pub mod shadow;
pub mod transaction;

pub use append_list::AppendAtomicList;
pub use bucket_index::{cas_extremum, BucketIndexedList};
pub use history::ChangeHistory;
pub use retry::transactional_yield_retry;
pub use shadow::{AccessMode, ShadowBuffer, ShadowState};
pub use transaction::{BeforeTransactionEnd, Transaction, TransactionManager, TxState};
