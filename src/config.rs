//! Database-wide configuration, validated before any file I/O happens.

use thiserror::Error;

use vtm_core::limits::{
    DEFAULT_TRANSACTIONS_PER_FILE, DEFAULT_WAL_PREFIX, DEFAULT_WAL_SUFFIX, HEAP_MIN_BLOCK,
    MIN_SEGMENT_SIZE,
};

/// Configuration for [`crate::Database::create_new`] / [`crate::Database::open_existing`].
///
/// Most fields only matter at creation time (`segment_size`, `heap_min_block`)
/// or are free to change across a reopen (`transactions_per_file`, the WAL
/// file naming, `conflict_bucket_span`, `log_target`).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Fixed size every segment is formatted to. Immutable after creation.
    pub segment_size: u32,
    /// Smallest payload size the heap allocator will carve a block for.
    /// Currently must equal [`vtm_core::limits::HEAP_MIN_BLOCK`] — kept as a
    /// config field rather than hardcoded so a future allocator revision can
    /// make it tunable without another config-surface change.
    pub heap_min_block: u32,
    /// Number of terminating (commit/rollback) WAL records per rotated file.
    pub transactions_per_file: u32,
    /// WAL filename prefix, e.g. `"a0"`.
    pub wal_prefix: String,
    /// WAL filename suffix, e.g. `".tlog"`.
    pub wal_suffix: String,
    /// Byte span each conflict-index bucket covers when the change history
    /// groups shadow buffers by address.
    pub conflict_bucket_span: u32,
    /// Target name `tracing` events are emitted under.
    pub log_target: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            segment_size: MIN_SEGMENT_SIZE,
            heap_min_block: HEAP_MIN_BLOCK,
            transactions_per_file: DEFAULT_TRANSACTIONS_PER_FILE,
            wal_prefix: DEFAULT_WAL_PREFIX.to_string(),
            wal_suffix: DEFAULT_WAL_SUFFIX.to_string(),
            conflict_bucket_span: 4096,
            log_target: "vtmdb".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// A config tuned for fast tests: the minimum segment size and a short
    /// rotation threshold so WAL rotation exercises in a handful of commits.
    pub fn for_testing() -> Self {
        DatabaseConfig {
            transactions_per_file: 3,
            ..Default::default()
        }
    }

    /// Set the segment size.
    pub fn with_segment_size(mut self, segment_size: u32) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Set the WAL rotation threshold.
    pub fn with_transactions_per_file(mut self, transactions_per_file: u32) -> Self {
        self.transactions_per_file = transactions_per_file;
        self
    }

    /// Set the WAL filename prefix/suffix.
    pub fn with_wal_names(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.wal_prefix = prefix.into();
        self.wal_suffix = suffix.into();
        self
    }

    /// Set the conflict-index bucket span.
    pub fn with_conflict_bucket_span(mut self, span: u32) -> Self {
        self.conflict_bucket_span = span;
        self
    }

    /// Set the `tracing` log target name.
    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }

    /// Validate this configuration, surfacing a [`ConfigError`] before any
    /// file is created or opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(ConfigError::SegmentTooSmall {
                configured: self.segment_size,
                minimum: MIN_SEGMENT_SIZE,
            });
        }
        if self.heap_min_block != HEAP_MIN_BLOCK {
            return Err(ConfigError::UnsupportedHeapMinBlock {
                configured: self.heap_min_block,
                required: HEAP_MIN_BLOCK,
            });
        }
        if self.transactions_per_file == 0 {
            return Err(ConfigError::InvalidTransactionsPerFile);
        }
        if self.wal_prefix.is_empty() || self.wal_suffix.is_empty() {
            return Err(ConfigError::InvalidWalNaming);
        }
        if self.conflict_bucket_span == 0 {
            return Err(ConfigError::InvalidConflictBucketSpan);
        }
        Ok(())
    }
}

/// Configuration validation errors, surfaced before any file I/O happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `segment_size` is below the engine-wide minimum.
    #[error("segment_size {configured} is below the minimum of {minimum}")]
    SegmentTooSmall {
        /// The value that was configured.
        configured: u32,
        /// The minimum segment size the engine supports.
        minimum: u32,
    },
    /// `heap_min_block` does not match the compiled-in minimum block size.
    #[error("heap_min_block {configured} does not match the required {required}")]
    UnsupportedHeapMinBlock {
        /// The value that was configured.
        configured: u32,
        /// The value the allocator actually enforces.
        required: u32,
    },
    /// `transactions_per_file` was zero.
    #[error("transactions_per_file must be at least 1")]
    InvalidTransactionsPerFile,
    /// WAL prefix or suffix was empty.
    #[error("WAL file prefix and suffix must not be empty")]
    InvalidWalNaming,
    /// `conflict_bucket_span` was zero.
    #[error("conflict_bucket_span must be at least 1")]
    InvalidConflictBucketSpan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DatabaseConfig::default().validate().is_ok());
    }

    #[test]
    fn for_testing_config_is_valid() {
        assert!(DatabaseConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn undersized_segment_is_rejected() {
        let config = DatabaseConfig::default().with_segment_size(1024);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SegmentTooSmall { .. })
        ));
    }

    #[test]
    fn zero_transactions_per_file_is_rejected() {
        let config = DatabaseConfig::default().with_transactions_per_file(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTransactionsPerFile)
        ));
    }

    #[test]
    fn empty_wal_suffix_is_rejected() {
        let config = DatabaseConfig::default().with_wal_names("a0", "");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWalNaming)
        ));
    }

    #[test]
    fn builder_methods_compose() {
        let config = DatabaseConfig::default()
            .with_segment_size(MIN_SEGMENT_SIZE * 2)
            .with_transactions_per_file(10)
            .with_log_target("my-db");
        assert_eq!(config.segment_size, MIN_SEGMENT_SIZE * 2);
        assert_eq!(config.transactions_per_file, 10);
        assert_eq!(config.log_target, "my-db");
        assert!(config.validate().is_ok());
    }
}
