//! Append-only WAL writer with rotation by terminator count (C8).

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use vtm_core::error::Result;
use vtm_core::limits::{DEFAULT_TRANSACTIONS_PER_FILE, DEFAULT_WAL_PREFIX, DEFAULT_WAL_SUFFIX};

use super::logfile::{create_new, list_log_files, open_append, open_read};
use super::record::{decode_one, DecodeOutcome, Record};

struct OpenFile {
    file: File,
    suffix_number: u32,
    terminators_written: u32,
}

/// Appends WAL records to a sequence of rotating files, sealing the current
/// file and starting a new one once it has accumulated
/// `transactions_per_file` terminating (commit/rollback) records.
pub struct WalWriter {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    transactions_per_file: u32,
    current: Mutex<OpenFile>,
}

impl WalWriter {
    /// Open the WAL directory, resuming the highest-numbered existing log
    /// file (or creating suffix 0 if none exists).
    ///
    /// The resumed file's terminator count is recovered by replaying its
    /// own records rather than persisted separately — this is the chosen
    /// resolution for the "is the rotation counter itself durable" design
    /// question: a crash between a terminator write and a rotation simply
    /// re-derives the count next time the file is opened.
    pub fn open<P: AsRef<Path>>(dir: P, transactions_per_file: u32) -> Result<Self> {
        Self::open_with_names(dir, DEFAULT_WAL_PREFIX, DEFAULT_WAL_SUFFIX, transactions_per_file)
    }

    /// Like [`Self::open`] with an explicit filename prefix/suffix.
    pub fn open_with_names<P: AsRef<Path>>(
        dir: P,
        prefix: &str,
        suffix: &str,
        transactions_per_file: u32,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let existing = list_log_files(&dir, prefix, suffix)?;
        let current = match existing.last() {
            Some((suffix_number, path)) => {
                let terminators_written = count_terminators(path)?;
                debug!(suffix_number, terminators_written, "resuming existing WAL file");
                OpenFile {
                    file: open_append(path)?,
                    suffix_number: *suffix_number,
                    terminators_written,
                }
            }
            None => {
                info!(path = %dir.display(), "no WAL files found, starting at suffix 0");
                OpenFile {
                    file: create_new(&dir, prefix, suffix, 0)?,
                    suffix_number: 0,
                    terminators_written: 0,
                }
            }
        };
        Ok(WalWriter {
            dir,
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            transactions_per_file,
            current: Mutex::new(current),
        })
    }

    /// Append one record, rotating the file afterward if this record was a
    /// terminator and pushed the file over its threshold. Terminator
    /// records are fsynced before returning; plain write records are
    /// buffered until the next terminator or rotation.
    pub fn append(&self, record: &Record) -> Result<()> {
        let mut current = self.current.lock();
        record.write_to(&mut current.file)?;
        if record.is_terminator() {
            current.file.sync_data()?;
            current.terminators_written += 1;
            if current.terminators_written >= self.transactions_per_file {
                self.rotate(&mut current)?;
            }
        }
        Ok(())
    }

    fn rotate(&self, current: &mut OpenFile) -> Result<()> {
        current.file.sync_all()?;
        let next_suffix = current.suffix_number + 1;
        let file = create_new(&self.dir, &self.prefix, &self.suffix, next_suffix)?;
        info!(next_suffix, "rotated WAL file");
        current.file = file;
        current.suffix_number = next_suffix;
        current.terminators_written = 0;
        Ok(())
    }

    /// The suffix number of the file currently being appended to.
    pub fn current_suffix(&self) -> u32 {
        self.current.lock().suffix_number
    }

    /// Flush the current file's writes to the OS, without a full fsync.
    pub fn flush(&self) -> Result<()> {
        self.current.lock().file.flush()?;
        Ok(())
    }

    /// The WAL directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn count_terminators(path: &Path) -> Result<u32> {
    let mut reader = open_read(path)?;
    let mut count = 0;
    loop {
        match decode_one(&mut reader)? {
            DecodeOutcome::Record(record) if record.is_terminator() => count += 1,
            DecodeOutcome::Record(_) => {}
            DecodeOutcome::Eof | DecodeOutcome::Torn => break,
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtm_core::address::FarAddress;
    use vtm_core::region::Rwr;

    use super::super::record::RecordBody;

    fn commit(tx_id: u64) -> Record {
        Record {
            tx_id,
            body: RecordBody::Commit,
        }
    }

    fn write(tx_id: u64) -> Record {
        Record {
            tx_id,
            body: RecordBody::Write {
                region: Rwr::new(FarAddress::new(0, 0), 2),
                bytes: vec![1, 2],
            },
        }
    }

    #[test]
    fn fresh_directory_starts_at_suffix_zero() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WalWriter::open(dir.path(), 5).unwrap();
        assert_eq!(writer.current_suffix(), 0);
    }

    #[test]
    fn rotates_after_threshold_terminators() {
        let dir = tempfile::tempdir().unwrap();
        let writer = WalWriter::open(dir.path(), 5).unwrap();
        for i in 0..23u64 {
            writer.append(&write(i)).unwrap();
            writer.append(&commit(i)).unwrap();
        }
        // 23 commits at threshold 5: suffixes 0..4 fully sealed, suffix 4 open
        // with 3 terminators (23 = 4*5 + 3).
        assert_eq!(writer.current_suffix(), 4);
        let files = list_log_files(dir.path(), "a0", ".tlog").unwrap();
        assert_eq!(files.len(), 5);
    }

    #[test]
    fn resuming_existing_file_recovers_terminator_count() {
        let dir = tempfile::tempdir().unwrap();
        {
            let writer = WalWriter::open(dir.path(), 5).unwrap();
            for i in 0..3u64 {
                writer.append(&write(i)).unwrap();
                writer.append(&commit(i)).unwrap();
            }
        }
        let writer = WalWriter::open(dir.path(), 5).unwrap();
        assert_eq!(writer.current_suffix(), 0);
        writer.append(&write(3)).unwrap();
        writer.append(&commit(3)).unwrap();
        writer.append(&write(4)).unwrap();
        writer.append(&commit(4)).unwrap();
        // fifth terminator in this file triggers rotation
        assert_eq!(writer.current_suffix(), 1);
    }
}
