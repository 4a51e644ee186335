//! Core types shared across the vtm substrate: the [`FarAddress`] address
//! model, the unified [`error::Error`] type, and the on-disk constants every
//! other crate agrees on.
//!
//! This crate has no I/O and no locking — it is pure value types and
//! constants, deliberately kept dependency-free so `vtm-storage`,
//! `vtm-concurrency` and `vtm-durability` can all depend on it without
//! pulling in each other.

#![warn(missing_docs)]

pub mod address;
pub mod error;
pub mod limits;
pub mod region;

pub use address::{FarAddress, SegmentIndex, SegmentPos};
pub use error::{Error, Result};
pub use region::Rwr;
