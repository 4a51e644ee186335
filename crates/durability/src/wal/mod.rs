//! Rotating write-ahead log: self-delimited records, append-with-rotation,
//! crash-tolerant replay, and garbage collection of fully-obsolete files.

mod gc;
mod logfile;
mod record;
mod replay;
mod writer;

pub use gc::{gc, gc_with_names};
pub use record::{decode_one, DecodeOutcome, Record, RecordBody};
pub use replay::{replay, replay_with_names, ReplayHandler, ReplayReport};
pub use writer::WalWriter;
