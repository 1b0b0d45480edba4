use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::sstable::filter::FilterPolicy;

/// Number of levels in the tree.
pub const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a size compaction.
pub const L0_COMPACTION_TRIGGER: usize = 4;

/// Level-0 file count at which each write is delayed by 1ms.
pub const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Level-0 file count at which writes stop until compaction drains.
pub const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Maximum level a flushed memtable is pushed to when nothing overlaps it.
pub const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Target size of a table file produced by compaction.
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024;

/// Cap on bytes of grandparent (level+2) overlap before a compaction output
/// is split, bounding the cost of the next compaction down.
pub const MAX_GRANDPARENT_OVERLAP_BYTES: u64 = 10 * MAX_FILE_SIZE;

/// Cap on the total size of expanded compaction inputs.
pub const EXPANDED_COMPACTION_BYTE_LIMIT: u64 = 25 * MAX_FILE_SIZE;

/// Table handles the cache keeps free for non-cache use.
pub const NUM_NON_TABLE_CACHE_FILES: usize = 10;

/// Block codec applied by the table builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Snappy,
}

impl CompressionType {
    pub(crate) fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

/// Configuration for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Create the directory if no database exists there (default: true).
    pub create_if_missing: bool,

    /// Fail open() if a database already exists (default: false).
    pub error_if_exists: bool,

    /// Treat any detected corruption during recovery as fatal (default: false).
    pub paranoid_checks: bool,

    /// Memtable size that triggers rotation to an L0 table (default: 4MB).
    pub write_buffer_size: usize,

    /// Bound on open file handles; 10 are reserved outside the table cache
    /// (default: 1000).
    pub max_open_files: usize,

    /// Uncompressed size of a table data block (default: 4KB).
    pub block_size: usize,

    /// Keys between restart points in a block (default: 16).
    pub block_restart_interval: usize,

    /// Codec for table blocks (default: snappy).
    pub compression: CompressionType,

    /// Optional filter consulted before reading table blocks on point lookups.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// User-key order. Its name is recorded in the manifest and must match on
    /// every subsequent open.
    pub comparator: Arc<dyn Comparator>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            compression: CompressionType::Snappy,
            filter_policy: None,
            comparator: Arc::new(BytewiseComparator),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn error_if_exists(mut self, error: bool) -> Self {
        self.error_if_exists = error;
        self
    }

    pub fn paranoid_checks(mut self, paranoid: bool) -> Self {
        self.paranoid_checks = paranoid;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn block_restart_interval(mut self, interval: usize) -> Self {
        self.block_restart_interval = interval;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = Options::default();
        assert!(options.create_if_missing);
        assert!(!options.error_if_exists);
        assert_eq!(options.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(options.max_open_files, 1000);
        assert_eq!(options.block_size, 4 * 1024);
        assert_eq!(options.block_restart_interval, 16);
        assert_eq!(options.compression, CompressionType::Snappy);
        assert_eq!(options.comparator.name(), "tephradb.BytewiseComparator");
    }

    #[test]
    fn test_options_builder() {
        let options = Options::new()
            .write_buffer_size(64 * 1024)
            .compression(CompressionType::None)
            .paranoid_checks(true);

        assert_eq!(options.write_buffer_size, 64 * 1024);
        assert_eq!(options.compression, CompressionType::None);
        assert!(options.paranoid_checks);
    }
}
