//! In-memory ordered buffer of recent writes.
//!
//! Entries live in a concurrent skip list keyed by encoded internal key, so
//! the single writer may append while readers traverse without locks. The
//! engine mutex orders rotations; the structure itself is never locked.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::coding::decode_fixed64;
use crate::key::{
    self, InternalKeyComparator, LookupKey, SequenceNumber, ValueType, TRAILER_SIZE,
};

/// Skip-list key: an encoded internal key ordered by the internal comparator.
/// Each key carries the comparator handle so the map can order entries under
/// a caller-supplied user comparator.
#[derive(Clone)]
struct MemKey {
    bytes: Vec<u8>,
    cmp: InternalKeyComparator,
}

impl MemKey {
    fn new(bytes: Vec<u8>, cmp: InternalKeyComparator) -> Self {
        Self { bytes, cmp }
    }
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp.compare(&self.bytes, &other.bytes) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.bytes, &other.bytes)
    }
}

/// Ordered map of internal key to value bytes (empty for tombstones).
pub struct MemTable {
    cmp: InternalKeyComparator,
    data: SkipMap<MemKey, Vec<u8>>,
    usage: AtomicUsize,
}

impl MemTable {
    pub fn new(cmp: InternalKeyComparator) -> Self {
        Self {
            cmp,
            data: SkipMap::new(),
            usage: AtomicUsize::new(0),
        }
    }

    /// Inserts one revision. Tombstones carry an empty value.
    pub fn add(&self, sequence: SequenceNumber, value_type: ValueType, key: &[u8], value: &[u8]) {
        let internal_key = key::make_internal_key(key, sequence, value_type);
        self.usage.fetch_add(
            internal_key.len() + value.len(),
            AtomicOrdering::Relaxed,
        );
        self.data
            .insert(MemKey::new(internal_key, self.cmp.clone()), value.to_vec());
    }

    /// Looks up the newest revision visible at the lookup key's snapshot.
    ///
    /// Returns `Some(Some(value))` for a live value, `Some(None)` for a
    /// tombstone (the key is definitively absent), and `None` when this
    /// memtable holds no revision and deeper sources must be consulted.
    pub fn get(&self, lookup: &LookupKey) -> Option<Option<Vec<u8>>> {
        let seek = MemKey::new(lookup.internal_key().to_vec(), self.cmp.clone());
        let entry = self.data.lower_bound(Bound::Included(&seek))?;
        let found = &entry.key().bytes;
        let user = self.cmp.user_comparator();
        if user.compare(key::user_key(found), lookup.user_key()) != Ordering::Equal {
            return None;
        }
        let trailer = decode_fixed64(&found[found.len() - TRAILER_SIZE..]);
        match trailer & 0xff {
            t if t == ValueType::Value as u64 => Some(Some(entry.value().clone())),
            _ => Some(None),
        }
    }

    /// Approximate bytes held, compared against `write_buffer_size` to decide
    /// rotation.
    pub fn approximate_memory_usage(&self) -> usize {
        self.usage.load(AtomicOrdering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Iterates entries in internal-key order as (internal key, value).
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            mem: Arc::clone(self),
            last: None,
            exhausted: false,
        }
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("entries", &self.data.len())
            .field("usage", &self.approximate_memory_usage())
            .finish()
    }
}

/// Forward iterator over a memtable. Holds a strong reference so the table
/// outlives any rotation, and re-seeks from the last yielded key on each
/// step, which keeps it valid under concurrent inserts.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    last: Option<MemKey>,
    exhausted: bool,
}

impl Iterator for MemTableIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let entry = match &self.last {
            Some(last) => self.mem.data.lower_bound(Bound::Excluded(last)),
            None => self.mem.data.front(),
        };
        match entry {
            Some(entry) => {
                let internal_key = entry.key().bytes.clone();
                let value = entry.value().clone();
                self.last = Some(entry.key().clone());
                Some((internal_key, value))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::parse_internal_key;

    fn new_memtable() -> Arc<MemTable> {
        Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
            BytewiseComparator,
        ))))
    }

    #[test]
    fn test_add_and_get() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"key1", b"value1");
        mem.add(2, ValueType::Value, b"key2", b"value2");

        assert_eq!(
            mem.get(&LookupKey::new(b"key1", 10)),
            Some(Some(b"value1".to_vec()))
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"key2", 10)),
            Some(Some(b"value2".to_vec()))
        );
        assert_eq!(mem.get(&LookupKey::new(b"key3", 10)), None);
    }

    #[test]
    fn test_snapshot_filtering() {
        let mem = new_memtable();
        mem.add(5, ValueType::Value, b"k", b"v1");
        mem.add(9, ValueType::Value, b"k", b"v2");

        // Revisions above the snapshot are invisible.
        assert_eq!(mem.get(&LookupKey::new(b"k", 4)), None);
        assert_eq!(mem.get(&LookupKey::new(b"k", 5)), Some(Some(b"v1".to_vec())));
        assert_eq!(mem.get(&LookupKey::new(b"k", 8)), Some(Some(b"v1".to_vec())));
        assert_eq!(mem.get(&LookupKey::new(b"k", 9)), Some(Some(b"v2".to_vec())));
    }

    #[test]
    fn test_tombstone_answers_definitively() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"k", b"v");
        mem.add(2, ValueType::Deletion, b"k", b"");

        assert_eq!(mem.get(&LookupKey::new(b"k", 2)), Some(None));
        assert_eq!(mem.get(&LookupKey::new(b"k", 1)), Some(Some(b"v".to_vec())));
    }

    #[test]
    fn test_lookup_does_not_match_neighbor_key() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"ab", b"v");
        assert_eq!(mem.get(&LookupKey::new(b"a", 10)), None);
        assert_eq!(mem.get(&LookupKey::new(b"abc", 10)), None);
    }

    #[test]
    fn test_usage_grows() {
        let mem = new_memtable();
        assert_eq!(mem.approximate_memory_usage(), 0);
        mem.add(1, ValueType::Value, b"key", b"value");
        // internal key (3 + 8 trailer) + value (5)
        assert_eq!(mem.approximate_memory_usage(), 16);
    }

    #[test]
    fn test_iterator_orders_revisions_newest_first() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"b", b"old");
        mem.add(3, ValueType::Value, b"b", b"new");
        mem.add(2, ValueType::Value, b"a", b"x");

        let entries: Vec<_> = mem
            .iter()
            .map(|(k, v)| {
                let parsed = parse_internal_key(&k).unwrap();
                (parsed.user_key.to_vec(), parsed.sequence, v)
            })
            .collect();

        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), 2, b"x".to_vec()),
                (b"b".to_vec(), 3, b"new".to_vec()),
                (b"b".to_vec(), 1, b"old".to_vec()),
            ]
        );
    }

    #[test]
    fn test_iterator_survives_concurrent_insert() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"a", b"1");
        mem.add(2, ValueType::Value, b"c", b"3");

        let mut iter = mem.iter();
        assert!(iter.next().is_some()); // "a"

        // Insert between the cursor and the remaining entry.
        mem.add(3, ValueType::Value, b"b", b"2");

        let rest: Vec<_> = iter
            .map(|(k, _)| parse_internal_key(&k).unwrap().user_key.to_vec())
            .collect();
        assert_eq!(rest, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
