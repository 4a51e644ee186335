//! The rotating write-ahead log: record framing, append-with-rotation,
//! crash-tolerant replay and garbage collection (C8).
//!
//! This crate knows nothing about transactions or shadow pages — it is a
//! durable, ordered record of transaction intentions keyed by transaction
//! id. `vtm-concurrency` drives it: one `Write` record per captured region
//! before commit, then a `Commit` or `Rollback` terminator.

#![warn(missing_docs)]

pub mod wal;

pub use wal::{decode_one, gc, replay, DecodeOutcome, Record, RecordBody, ReplayHandler, ReplayReport, WalWriter};
