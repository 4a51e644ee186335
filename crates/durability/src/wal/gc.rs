//! Deletes fully-obsolete WAL files: ones whose terminating records all
//! precede the oldest transaction still of interest (C8 `gc`).

use std::path::Path;

use tracing::info;
use vtm_core::error::Result;
use vtm_core::limits::{DEFAULT_WAL_PREFIX, DEFAULT_WAL_SUFFIX};

use super::logfile::{list_log_files, open_read};
use super::record::{decode_one, DecodeOutcome, RecordBody};

/// Delete every log file in `dir`, except the most recent one, whose
/// terminating records (commit/rollback) are all for transaction ids below
/// `oldest_live_tx_id`. Returns the suffix numbers deleted.
pub fn gc(dir: &Path, oldest_live_tx_id: u64) -> Result<Vec<u32>> {
    gc_with_names(dir, DEFAULT_WAL_PREFIX, DEFAULT_WAL_SUFFIX, oldest_live_tx_id)
}

/// Like [`gc`] with an explicit filename prefix/suffix.
pub fn gc_with_names(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    oldest_live_tx_id: u64,
) -> Result<Vec<u32>> {
    let files = list_log_files(dir, prefix, suffix)?;
    let mut deleted = Vec::new();
    // Never delete the last file: it may still be open for append.
    let Some((_, candidates)) = files.split_last() else {
        return Ok(deleted);
    };
    for (suffix_number, path) in candidates {
        if max_terminator_tx_id(path)?.is_some_and(|max| max < oldest_live_tx_id) {
            std::fs::remove_file(path)?;
            info!(suffix_number, "garbage collected obsolete WAL file");
            deleted.push(*suffix_number);
        }
    }
    Ok(deleted)
}

fn max_terminator_tx_id(path: &Path) -> Result<Option<u64>> {
    let mut reader = open_read(path)?;
    let mut max = None;
    loop {
        match decode_one(&mut reader)? {
            DecodeOutcome::Record(record) => {
                if matches!(record.body, RecordBody::Commit | RecordBody::Rollback) {
                    max = Some(max.map_or(record.tx_id, |m: u64| m.max(record.tx_id)));
                }
            }
            DecodeOutcome::Eof | DecodeOutcome::Torn => break,
        }
    }
    Ok(max)
}
