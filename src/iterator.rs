//! Read-path iterators: per-source adapters, the N-way merge in internal-key
//! order, and the public snapshot-filtering iterator.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::key::{self, InternalKeyComparator, SequenceNumber, ValueType};
use crate::memtable::{MemTable, MemTableIterator};
use crate::sstable::TableIter;
use crate::table_cache::TableCache;
use crate::version::{FileMetaData, Version};

/// A positioned cursor over (internal key, value) entries in internal-key
/// order. Constructors position at the first entry.
pub(crate) trait InternalIterator: Send {
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn advance(&mut self);
    /// Surfaces an I/O or corruption error that ended iteration early.
    fn status(&self) -> Result<()>;
}

/// Memtable adapter.
pub(crate) struct MemIter {
    inner: MemTableIterator,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemIter {
    pub fn new(mem: &Arc<MemTable>) -> Self {
        let mut inner = mem.iter();
        let current = inner.next();
        Self { inner, current }
    }
}

impl InternalIterator for MemIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().unwrap().0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().unwrap().1
    }

    fn advance(&mut self) {
        self.current = self.inner.next();
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

/// Single-table adapter.
pub(crate) struct TableEntriesIter {
    inner: TableIter,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl TableEntriesIter {
    pub fn new(mut inner: TableIter) -> Self {
        let current = inner.next();
        Self { inner, current }
    }
}

impl InternalIterator for TableEntriesIter {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().unwrap().0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().unwrap().1
    }

    fn advance(&mut self) {
        self.current = self.inner.next();
    }

    fn status(&self) -> Result<()> {
        self.inner.status()
    }
}

/// Concatenation of the disjoint, sorted files of one level (>= 1). Tables
/// are opened through the cache as the cursor reaches them.
pub(crate) struct LevelIter {
    files: Vec<Arc<FileMetaData>>,
    cache: Arc<TableCache>,
    next_file: usize,
    table: Option<TableEntriesIter>,
    status: Result<()>,
}

impl LevelIter {
    pub fn new(files: Vec<Arc<FileMetaData>>, cache: Arc<TableCache>) -> Self {
        let mut iter = Self {
            files,
            cache,
            next_file: 0,
            table: None,
            status: Ok(()),
        };
        iter.skip_to_nonempty_table();
        iter
    }

    fn skip_to_nonempty_table(&mut self) {
        loop {
            if self.table.as_ref().map(|t| t.valid()).unwrap_or(false) {
                return;
            }
            if let Some(t) = &self.table {
                if let Err(e) = t.status() {
                    self.status = Err(e);
                    self.table = None;
                    return;
                }
            }
            if self.next_file >= self.files.len() {
                self.table = None;
                return;
            }
            let file = &self.files[self.next_file];
            self.next_file += 1;
            match self.cache.get(file.number, file.file_size) {
                Ok(table) => self.table = Some(TableEntriesIter::new(table.iter())),
                Err(e) => {
                    self.status = Err(e);
                    self.table = None;
                    return;
                }
            }
        }
    }
}

impl InternalIterator for LevelIter {
    fn valid(&self) -> bool {
        self.table.as_ref().map(|t| t.valid()).unwrap_or(false)
    }

    fn key(&self) -> &[u8] {
        self.table.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.table.as_ref().unwrap().value()
    }

    fn advance(&mut self) {
        if let Some(t) = &mut self.table {
            t.advance();
        }
        self.skip_to_nonempty_table();
    }

    fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

/// N-way merge in internal-key order. Ties on identical internal keys (which
/// committed writes never produce) go to the child listed first.
pub(crate) struct MergingIterator {
    icmp: InternalKeyComparator,
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
}

impl MergingIterator {
    pub fn new(icmp: InternalKeyComparator, children: Vec<Box<dyn InternalIterator>>) -> Self {
        let mut iter = Self {
            icmp,
            children,
            current: None,
        };
        iter.find_smallest();
        iter
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.icmp.compare(child.key(), self.children[s].key()) == Ordering::Less {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.unwrap()].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.unwrap()].value()
    }

    fn advance(&mut self) {
        if let Some(i) = self.current {
            self.children[i].advance();
            self.find_smallest();
        }
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

/// Keeps the sources an iterator reads from alive for its whole lifetime:
/// both memtables and the version (whose `Arc` pins its files against
/// deletion).
pub(crate) struct PinnedState {
    pub mem: Arc<MemTable>,
    pub imm: Option<Arc<MemTable>>,
    pub version: Arc<Version>,
}

/// Ordered iteration over the live user keys of the database at a snapshot.
///
/// Yields `(user_key, value)` ascending by user key: for each key only the
/// newest revision at or below the snapshot, and nothing at all if that
/// revision is a tombstone.
pub struct DbIterator {
    merged: MergingIterator,
    ucmp: Arc<dyn Comparator>,
    sequence: SequenceNumber,
    last_user_key: Option<Vec<u8>>,
    done: bool,
    _pinned: PinnedState,
}

impl DbIterator {
    pub(crate) fn new(
        icmp: InternalKeyComparator,
        sequence: SequenceNumber,
        pinned: PinnedState,
    ) -> Self {
        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        children.push(Box::new(MemIter::new(&pinned.mem)));
        if let Some(imm) = &pinned.imm {
            children.push(Box::new(MemIter::new(imm)));
        }

        let cache = Arc::clone(pinned.version.table_cache());
        // Level-0 files overlap, so each gets its own cursor; deeper levels
        // are disjoint and share one concatenating cursor per level.
        for file in pinned.version.files(0) {
            children.push(Box::new(LevelIter::new(
                vec![Arc::clone(file)],
                Arc::clone(&cache),
            )));
        }
        for level in 1..crate::config::NUM_LEVELS {
            let files = pinned.version.files(level);
            if !files.is_empty() {
                children.push(Box::new(LevelIter::new(files.to_vec(), Arc::clone(&cache))));
            }
        }

        let ucmp = Arc::clone(icmp.user_comparator());
        Self {
            merged: MergingIterator::new(icmp, children),
            ucmp,
            sequence,
            last_user_key: None,
            done: false,
            _pinned: pinned,
        }
    }
}

impl Iterator for DbIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if !self.merged.valid() {
                self.done = true;
                return match self.merged.status() {
                    Ok(()) => None,
                    Err(e) => Some(Err(e)),
                };
            }

            let entry = match key::parse_internal_key(self.merged.key()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            // Above the snapshot: invisible, and does not shadow anything.
            if entry.sequence > self.sequence {
                self.merged.advance();
                continue;
            }

            // Older revision of a user key already decided.
            if self
                .last_user_key
                .as_deref()
                .map(|last| self.ucmp.compare(entry.user_key, last) == Ordering::Equal)
                .unwrap_or(false)
            {
                self.merged.advance();
                continue;
            }

            self.last_user_key = Some(entry.user_key.to_vec());
            match entry.value_type {
                ValueType::Deletion => {
                    self.merged.advance();
                }
                ValueType::Value => {
                    let item = (entry.user_key.to_vec(), self.merged.value().to_vec());
                    self.merged.advance();
                    return Some(Ok(item));
                }
            }
        }
        None
    }
}
