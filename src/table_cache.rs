use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::config::{Options, NUM_NON_TABLE_CACHE_FILES};
use crate::error::Result;
use crate::filename::table_file_name;
use crate::key::InternalKeyComparator;
use crate::sstable::Table;

/// Cache of open table readers, keyed by file number.
///
/// Bounds open descriptors at `max_open_files` minus the handles reserved
/// for the WAL, manifest, and friends. Every read path goes through here;
/// eviction closes the least recently used reader.
pub struct TableCache {
    dir: PathBuf,
    options: Options,
    icmp: InternalKeyComparator,
    cache: Mutex<LruCache<u64, Arc<Table>>>,
}

impl TableCache {
    pub fn new(dir: PathBuf, options: Options, icmp: InternalKeyComparator) -> Self {
        let capacity = options
            .max_open_files
            .saturating_sub(NUM_NON_TABLE_CACHE_FILES)
            .max(1);
        Self {
            dir,
            options,
            icmp,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
        }
    }

    /// Returns the open table for `file_number`, opening it on a miss.
    pub fn get(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.lock().unwrap().get(&file_number) {
            return Ok(Arc::clone(table));
        }

        // Open outside the lock; a racing open of the same file just wastes
        // one descriptor briefly.
        let path = table_file_name(&self.dir, file_number);
        let table = Arc::new(Table::open(
            &path,
            file_size,
            self.icmp.clone(),
            &self.options,
        )?);
        self.cache
            .lock()
            .unwrap()
            .put(file_number, Arc::clone(&table));
        Ok(table)
    }

    /// Drops the cached reader for a deleted file.
    pub fn evict(&self, file_number: u64) {
        self.cache.lock().unwrap().pop(&file_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::{make_internal_key, ValueType};
    use crate::sstable::TableBuilder;
    use tempfile::tempdir;

    fn write_table(dir: &std::path::Path, number: u64, options: &Options) -> u64 {
        let mut builder = TableBuilder::new(&table_file_name(dir, number), options).unwrap();
        let key = make_internal_key(b"k", 1, ValueType::Value);
        builder.add(&key, b"v").unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn test_hit_returns_same_reader() {
        let dir = tempdir().unwrap();
        let options = Options::default();
        let size = write_table(dir.path(), 1, &options);

        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let cache = TableCache::new(dir.path().to_path_buf(), options, icmp);

        let a = cache.get(1, size).expect("first open");
        let b = cache.get(1, size).expect("cached open");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_evict_reopens() {
        let dir = tempdir().unwrap();
        let options = Options::default();
        let size = write_table(dir.path(), 1, &options);

        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let cache = TableCache::new(dir.path().to_path_buf(), options, icmp);

        let a = cache.get(1, size).expect("first open");
        cache.evict(1);
        let b = cache.get(1, size).expect("reopen");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let cache = TableCache::new(dir.path().to_path_buf(), Options::default(), icmp);
        assert!(cache.get(42, 1000).is_err());
    }
}
