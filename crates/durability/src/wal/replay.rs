//! Replays a WAL directory on database open, reconstructing committed
//! writes and discarding anything left dangling by a crash (C8).

use std::collections::HashMap;
use std::path::Path;

use vtm_core::error::Result;
use vtm_core::limits::{DEFAULT_WAL_PREFIX, DEFAULT_WAL_SUFFIX};
use vtm_core::region::Rwr;

use super::logfile::{list_log_files, open_read};
use super::record::{decode_one, DecodeOutcome, RecordBody};

/// Receives the writes of every transaction whose commit record was found
/// during replay, in commit order.
pub trait ReplayHandler {
    /// Apply one committed write.
    fn apply_write(&mut self, tx_id: u64, region: Rwr, bytes: &[u8]) -> Result<()>;
}

/// Counts of what replay found, for logging/diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    /// Transactions whose commit record was found and replayed.
    pub committed: u64,
    /// Transactions whose rollback record was found (writes discarded).
    pub rolled_back: u64,
    /// Transactions with buffered writes but no terminator (torn tail or
    /// crash before commit); writes discarded.
    pub abandoned: u64,
    /// Highest transaction id observed across every record, or `None` if
    /// the WAL was empty. Used to seed the next transaction id on reopen.
    pub max_tx_id: Option<u64>,
}

/// Scan every log file in `dir` in ascending suffix order, replaying
/// committed writes into `handler` and reporting what it found.
pub fn replay<H: ReplayHandler>(dir: &Path, handler: &mut H) -> Result<ReplayReport> {
    replay_with_names(dir, DEFAULT_WAL_PREFIX, DEFAULT_WAL_SUFFIX, handler)
}

/// Like [`replay`] with an explicit filename prefix/suffix.
pub fn replay_with_names<H: ReplayHandler>(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    handler: &mut H,
) -> Result<ReplayReport> {
    let mut pending: HashMap<u64, Vec<(Rwr, Vec<u8>)>> = HashMap::new();
    let mut report = ReplayReport::default();

    for (_, path) in list_log_files(dir, prefix, suffix)? {
        let mut reader = open_read(&path)?;
        loop {
            match decode_one(&mut reader)? {
                DecodeOutcome::Eof | DecodeOutcome::Torn => break,
                DecodeOutcome::Record(record) => {
                    report.max_tx_id = Some(report.max_tx_id.map_or(record.tx_id, |m| m.max(record.tx_id)));
                    match record.body {
                        RecordBody::Write { region, bytes } => {
                            pending.entry(record.tx_id).or_default().push((region, bytes));
                        }
                        RecordBody::Commit => {
                            if let Some(writes) = pending.remove(&record.tx_id) {
                                for (region, bytes) in writes {
                                    handler.apply_write(record.tx_id, region, &bytes)?;
                                }
                            }
                            report.committed += 1;
                        }
                        RecordBody::Rollback => {
                            pending.remove(&record.tx_id);
                            report.rolled_back += 1;
                        }
                    }
                }
            }
        }
    }
    report.abandoned = pending.len() as u64;
    Ok(report)
}
