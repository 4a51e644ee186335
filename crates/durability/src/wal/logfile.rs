//! Rotating log file naming: `<prefix><suffix_number><suffix>`, e.g.
//! `a00.tlog`, `a01.tlog`, ... with the default prefix/suffix from
//! `vtm_core::limits`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use vtm_core::error::Result;

/// Build the filename for log file number `suffix_number`.
pub fn file_name(prefix: &str, suffix: &str, suffix_number: u32) -> String {
    format!("{prefix}{suffix_number}{suffix}")
}

/// Parse `name` as `<prefix><N><suffix>`, returning `N` if it matches.
pub fn parse_suffix_number(name: &str, prefix: &str, suffix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?;
    let digits = rest.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// List every log file in `dir` matching `prefix`/`suffix`, ascending by
/// suffix number.
pub fn list_log_files(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<(u32, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(n) = parse_suffix_number(name, prefix, suffix) {
            found.push((n, entry.path()));
        }
    }
    found.sort_by_key(|(n, _)| *n);
    Ok(found)
}

/// Create a brand-new, empty log file for `suffix_number`. Fails if the
/// file already exists.
pub fn create_new(dir: &Path, prefix: &str, suffix: &str, suffix_number: u32) -> Result<File> {
    fs::create_dir_all(dir)?;
    let path = dir.join(file_name(prefix, suffix, suffix_number));
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?)
}

/// Open an existing log file for append, seeking to its current end.
pub fn open_append(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new().read(true).append(true).open(path)?;
    file.seek(SeekFrom::End(0))?;
    Ok(file)
}

/// Open an existing log file for a sequential read-only scan from the start.
pub fn open_read(path: &Path) -> Result<BufReader<File>> {
    let file = OpenOptions::new().read(true).open(path)?;
    Ok(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_matches_default_convention() {
        assert_eq!(file_name("a0", ".tlog", 3), "a03.tlog");
    }

    #[test]
    fn parse_suffix_number_round_trips() {
        assert_eq!(parse_suffix_number("a03.tlog", "a0", ".tlog"), Some(3));
        assert_eq!(parse_suffix_number("a0.tlog", "a0", ".tlog"), None);
        assert_eq!(parse_suffix_number("other.txt", "a0", ".tlog"), None);
    }

    #[test]
    fn list_log_files_sorts_ascending() {
        let dir = tempfile::tempdir().unwrap();
        for n in [2u32, 0, 1] {
            create_new(dir.path(), "a0", ".tlog", n).unwrap();
        }
        let files = list_log_files(dir.path(), "a0", ".tlog").unwrap();
        let suffixes: Vec<u32> = files.iter().map(|(n, _)| *n).collect();
        assert_eq!(suffixes, vec![0, 1, 2]);
    }
}
