//! The file catalog.
//!
//! A `Version` is an immutable snapshot of the table files across all
//! levels. Edits never mutate a version; applying a `VersionEdit` builds a
//! new one. Readers, iterators, and compactions pin the version they were
//! started against with an `Arc`, which keeps every file it lists safe from
//! deletion until the last holder is gone.

pub mod compaction;
pub mod edit;
pub mod set;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::config::{MAX_GRANDPARENT_OVERLAP_BYTES, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
use crate::error::Result;
use crate::key::{
    self, InternalKeyComparator, LookupKey, ValueType, MAX_SEQUENCE_NUMBER,
};
use crate::table_cache::TableCache;

/// Immutable descriptor of one table file.
#[derive(Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key in the file.
    pub smallest: Vec<u8>,
    /// Largest internal key in the file.
    pub largest: Vec<u8>,
    /// Budget of lookups allowed to pass through this file without
    /// answering before it is nominated for compaction.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: Vec<u8>, largest: Vec<u8>) -> Self {
        // One seek costs about as much as compacting 16KiB, so a file earns
        // proportionally many free seeks, floored for tiny files.
        let allowed_seeks = (file_size as i64 / 16384).max(100);
        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }
}

pub fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Index of the first file in a sorted, disjoint level whose largest key is
/// at or after `ikey`.
fn find_file(icmp: &InternalKeyComparator, files: &[Arc<FileMetaData>], ikey: &[u8]) -> usize {
    let mut left = 0;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(&files[mid].largest, ikey) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

/// Outcome of a version lookup that the engine folds back into compaction
/// scheduling: the first file probed without answering, if a second file had
/// to be consulted.
#[derive(Default)]
pub struct SeekStats {
    pub seek_file: Option<(Arc<FileMetaData>, usize)>,
}

/// One immutable catalog of files per level.
pub struct Version {
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    pub(crate) files: [Vec<Arc<FileMetaData>>; NUM_LEVELS],

    // Filled by the builder when the version is finalized.
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,

    // Seek-driven compaction candidate, set under the engine mutex.
    file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
}

impl Version {
    pub(crate) fn empty(icmp: InternalKeyComparator, table_cache: Arc<TableCache>) -> Self {
        Self {
            icmp,
            table_cache,
            files: Default::default(),
            compaction_score: -1.0,
            compaction_level: 0,
            file_to_compact: Mutex::new(None),
        }
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub(crate) fn table_cache(&self) -> &Arc<TableCache> {
        &self.table_cache
    }

    pub fn file_to_compact(&self) -> Option<(Arc<FileMetaData>, usize)> {
        self.file_to_compact.lock().unwrap().clone()
    }

    /// Charges one seek against `file`; returns true when the budget runs out
    /// and the file became this version's compaction candidate.
    pub fn update_stats(&self, stats: SeekStats) -> bool {
        if let Some((file, level)) = stats.seek_file {
            let remaining = file.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1;
            let mut candidate = self.file_to_compact.lock().unwrap();
            if remaining <= 0 && candidate.is_none() {
                *candidate = Some((file, level));
                return true;
            }
        }
        false
    }

    /// Point lookup through the levels.
    ///
    /// Returns `Some(Some(v))` for a live value, `Some(None)` for a
    /// tombstone, `None` when no file holds a revision of the key, plus the
    /// seek statistics for the engine to apply under its mutex.
    pub fn get(&self, lookup: &LookupKey) -> Result<(Option<Option<Vec<u8>>>, SeekStats)> {
        let ikey = lookup.internal_key();
        let ukey = lookup.user_key();
        let ucmp = self.icmp.user_comparator();

        let mut stats = SeekStats::default();
        let mut last_file_read: Option<(Arc<FileMetaData>, usize)> = None;

        // Level 0 files may overlap: gather every candidate, newest first.
        let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(ukey, key::user_key(&f.smallest)) != Ordering::Less
                    && ucmp.compare(ukey, key::user_key(&f.largest)) != Ordering::Greater
            })
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));

        for file in level0 {
            if let Some(answer) =
                self.probe_file(file, 0, ikey, ukey, &mut stats, &mut last_file_read)?
            {
                return Ok((Some(answer), stats));
            }
        }

        // Deeper levels are disjoint: at most one candidate each.
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(&self.icmp, files, ikey);
            if index >= files.len() {
                continue;
            }
            let file = &files[index];
            if ucmp.compare(ukey, key::user_key(&file.smallest)) == Ordering::Less {
                continue;
            }
            if let Some(answer) =
                self.probe_file(file, level, ikey, ukey, &mut stats, &mut last_file_read)?
            {
                return Ok((Some(answer), stats));
            }
        }

        Ok((None, stats))
    }

    fn probe_file(
        &self,
        file: &Arc<FileMetaData>,
        level: usize,
        ikey: &[u8],
        ukey: &[u8],
        stats: &mut SeekStats,
        last_file_read: &mut Option<(Arc<FileMetaData>, usize)>,
    ) -> Result<Option<Option<Vec<u8>>>> {
        if stats.seek_file.is_none() && last_file_read.is_some() {
            // A second file is being consulted: the first one pays.
            stats.seek_file = last_file_read.take();
        }
        *last_file_read = Some((Arc::clone(file), level));

        let table = self.table_cache.get(file.number, file.file_size)?;
        let Some((found_key, value)) = table.get(ikey)? else {
            return Ok(None);
        };
        let parsed = key::parse_internal_key(&found_key)?;
        if self.icmp.user_comparator().compare(parsed.user_key, ukey) != Ordering::Equal {
            return Ok(None);
        }
        match parsed.value_type {
            ValueType::Value => Ok(Some(Some(value))),
            ValueType::Deletion => Ok(Some(None)),
        }
    }

    /// True if any file at `level` overlaps the user-key range. `None`
    /// bounds are unbounded.
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user: Option<&[u8]>,
        largest_user: Option<&[u8]>,
    ) -> bool {
        let ucmp = self.icmp.user_comparator();
        if level == 0 {
            return self.files[0].iter().any(|f| {
                let after = smallest_user
                    .map(|s| ucmp.compare(key::user_key(&f.largest), s) == Ordering::Less)
                    .unwrap_or(false);
                let before = largest_user
                    .map(|l| ucmp.compare(key::user_key(&f.smallest), l) == Ordering::Greater)
                    .unwrap_or(false);
                !after && !before
            });
        }

        let files = &self.files[level];
        let index = match smallest_user {
            Some(s) => {
                let seek = key::make_internal_key(s, MAX_SEQUENCE_NUMBER, ValueType::Value);
                find_file(&self.icmp, files, &seek)
            }
            None => 0,
        };
        if index >= files.len() {
            return false;
        }
        match largest_user {
            Some(l) => ucmp.compare(key::user_key(&files[index].smallest), l) != Ordering::Greater,
            None => true,
        }
    }

    /// All files at `level` whose user-key range touches `[begin, end]`
    /// (internal-key bounds, `None` = unbounded). At level 0 a matching
    /// file widens the search range, so the scan restarts until closed.
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| key::user_key(k).to_vec());
        let mut user_end = end.map(|k| key::user_key(k).to_vec());

        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;
            let file_start = key::user_key(&file.smallest);
            let file_limit = key::user_key(&file.largest);

            if let Some(ub) = &user_begin {
                if ucmp.compare(file_limit, ub) == Ordering::Less {
                    continue;
                }
            }
            if let Some(ue) = &user_end {
                if ucmp.compare(file_start, ue) == Ordering::Greater {
                    continue;
                }
            }

            inputs.push(Arc::clone(file));
            if level == 0 {
                // Overlapping L0 files can chain: widen and restart.
                let mut restart = false;
                if let Some(ub) = &user_begin {
                    if ucmp.compare(file_start, ub) == Ordering::Less {
                        user_begin = Some(file_start.to_vec());
                        restart = true;
                    }
                }
                if let Some(ue) = &user_end {
                    if ucmp.compare(file_limit, ue) == Ordering::Greater {
                        user_end = Some(file_limit.to_vec());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// Where to install a freshly flushed memtable: level 0, or pushed down
    /// while nothing overlaps and the grandparent overlap stays modest.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user: &[u8],
        largest_user: &[u8],
    ) -> usize {
        let mut level = 0;
        if !self.overlap_in_level(0, Some(smallest_user), Some(largest_user)) {
            let start = key::make_internal_key(smallest_user, MAX_SEQUENCE_NUMBER, ValueType::Value);
            let limit = key::make_internal_key(largest_user, 0, ValueType::Deletion);
            while level < MAX_MEM_COMPACT_LEVEL {
                if self.overlap_in_level(level + 1, Some(smallest_user), Some(largest_user)) {
                    break;
                }
                if level + 2 < NUM_LEVELS {
                    let grandparents =
                        self.overlapping_inputs(level + 2, Some(&start), Some(&limit));
                    if total_file_size(&grandparents) > MAX_GRANDPARENT_OVERLAP_BYTES {
                        break;
                    }
                }
                level += 1;
            }
        }
        level
    }

    /// Approximate byte offset of `ikey` in the keyspace: the total size of
    /// files wholly before it, plus the in-file offset where it straddles one.
    pub fn approximate_offset_of(&self, ikey: &[u8]) -> u64 {
        let mut offset = 0;
        for level in 0..NUM_LEVELS {
            for file in &self.files[level] {
                if self.icmp.compare(&file.largest, ikey) != Ordering::Greater {
                    offset += file.file_size;
                } else if self.icmp.compare(&file.smallest, ikey) == Ordering::Greater {
                    // Entirely past ikey; deeper files at sorted levels are too.
                    if level > 0 {
                        break;
                    }
                } else if let Ok(table) = self.table_cache.get(file.number, file.file_size) {
                    offset += table.approximate_offset_of(ikey);
                }
            }
        }
        offset
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<usize> = self.files.iter().map(|l| l.len()).collect();
        f.debug_struct("Version").field("files", &counts).finish()
    }
}
