use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use super::compaction::Compaction;
use super::edit::VersionEdit;
use super::{total_file_size, FileMetaData, Version};
use crate::config::{
    EXPANDED_COMPACTION_BYTE_LIMIT, L0_COMPACTION_TRIGGER, MAX_FILE_SIZE, NUM_LEVELS,
};
use crate::error::{Error, Result};
use crate::filename::{manifest_file_name, read_current_file};
use crate::key::{InternalKeyComparator, SequenceNumber};
use crate::table_cache::TableCache;
use crate::wal::{LogReader, LogWriter};

/// The mutable holder of the current `Version`, the manifest log, and the
/// monotonic counters. All methods require the engine mutex; the one
/// exception is the manifest I/O of `log_and_apply`, which the engine
/// performs between `prepare_apply` and `finish_apply` with the mutex
/// released.
pub struct VersionSet {
    dir: PathBuf,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    prev_log_number: u64,

    current: Arc<Version>,
    live: Vec<Weak<Version>>,
    compact_pointers: [Vec<u8>; NUM_LEVELS],
    manifest: Option<LogWriter>,
}

/// Everything `finish_apply` needs after the manifest record hits disk.
pub struct PreparedEdit {
    pub(crate) record: Vec<u8>,
    pub(crate) version: Arc<Version>,
    pub(crate) new_manifest: Option<u64>,
    pub(crate) log_number: u64,
    pub(crate) prev_log_number: u64,
}

impl VersionSet {
    pub fn new(dir: PathBuf, icmp: InternalKeyComparator, table_cache: Arc<TableCache>) -> Self {
        let mut set = Self {
            dir,
            icmp: icmp.clone(),
            table_cache: Arc::clone(&table_cache),
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            current: Arc::new(Version::empty(icmp, table_cache)),
            live: Vec::new(),
            compact_pointers: Default::default(),
            manifest: None,
        };
        set.live.push(Arc::downgrade(&set.current));
        set
    }

    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Hands back an allocated but unused file number.
    pub fn reuse_file_number(&mut self, number: u64) {
        if number + 1 == self.next_file_number {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    pub fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(self.current.files(level))
    }

    /// Table files reachable from any live version. Everything else on disk
    /// is garbage (modulo `pending_outputs`).
    pub fn live_files(&mut self) -> HashSet<u64> {
        let mut live = HashSet::new();
        self.live.retain(|weak| {
            let Some(version) = weak.upgrade() else {
                return false;
            };
            for level in 0..NUM_LEVELS {
                for file in version.files(level) {
                    live.insert(file.number);
                }
            }
            true
        });
        live
    }

    fn append_version(&mut self, version: Arc<Version>) {
        self.live.retain(|weak| weak.strong_count() > 0);
        self.live.push(Arc::downgrade(&version));
        self.current = version;
    }

    /// Replays the manifest named by `CURRENT` into this (empty) set.
    pub fn recover(&mut self) -> Result<()> {
        let manifest_path = read_current_file(&self.dir)?;
        let file = File::open(&manifest_path)?;
        let mut reader = LogReader::new(file);

        let mut builder = Builder::new(self.icmp.clone(), self.current());
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader
            .read_record()
            .map_err(|e| Error::Corruption(format!("manifest replay: {e}")))?
        {
            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator_name {
                let ours = self.icmp.user_comparator().name();
                if name != ours {
                    return Err(Error::InvalidArgument(format!(
                        "comparator mismatch: database uses {name}, options supply {ours}"
                    )));
                }
            }
            for (level, key) in &edit.compact_pointers {
                self.compact_pointers[*level] = key.clone();
            }
            builder.apply(&edit);

            log_number = edit.log_number.or(log_number);
            prev_log_number = edit.prev_log_number.or(prev_log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
        }

        let next_file_number = next_file_number
            .ok_or_else(|| Error::Corruption("manifest has no next-file-number".to_string()))?;
        let log_number = log_number
            .ok_or_else(|| Error::Corruption("manifest has no log-number".to_string()))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::Corruption("manifest has no last-sequence".to_string()))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let mut version = builder.finish(&self.table_cache);
        finalize(&mut version);
        self.append_version(Arc::new(version));

        self.next_file_number = next_file_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        // Every open starts a fresh manifest; the old one becomes garbage
        // once CURRENT is repointed.
        self.manifest_file_number = self.new_file_number();

        tracing::info!(
            manifest = %manifest_path.display(),
            last_sequence,
            log_number,
            "recovered version set"
        );
        Ok(())
    }

    /// First half of `logAndApply`, run with the engine mutex held: finalize
    /// the edit's counters, build the successor version, and make sure a
    /// manifest log exists (seeding a new one with a full snapshot).
    pub fn prepare_apply(&mut self, edit: &mut VersionEdit) -> Result<PreparedEdit> {
        match edit.log_number {
            Some(n) => debug_assert!(n >= self.log_number && n < self.next_file_number),
            None => edit.log_number = Some(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.prev_log_number = Some(self.prev_log_number);
        }
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        for (level, key) in &edit.compact_pointers {
            self.compact_pointers[*level] = key.clone();
        }

        let mut builder = Builder::new(self.icmp.clone(), self.current());
        builder.apply(edit);
        let mut version = builder.finish(&self.table_cache);
        finalize(&mut version);

        let new_manifest = if self.manifest.is_none() {
            let number = self.manifest_file_number;
            let file = File::create(manifest_file_name(&self.dir, number))?;
            let mut writer = LogWriter::new(file);
            // Seed with the complete current state so the new manifest
            // stands alone.
            writer.add_record(&self.snapshot_edit().encode())?;
            self.manifest = Some(writer);
            Some(number)
        } else {
            None
        };

        Ok(PreparedEdit {
            record: edit.encode(),
            version: Arc::new(version),
            new_manifest,
            log_number: edit.log_number.unwrap(),
            prev_log_number: edit.prev_log_number.unwrap(),
        })
    }

    /// Lends out the manifest writer for the unlocked I/O step.
    pub fn take_manifest(&mut self) -> LogWriter {
        self.manifest.take().expect("manifest writer present")
    }

    /// Second half of `logAndApply`, with the mutex re-held. On success the
    /// new version is installed; on failure the state is unchanged except
    /// that a just-created manifest is discarded.
    pub fn finish_apply(
        &mut self,
        writer: LogWriter,
        prepared: PreparedEdit,
        io_result: Result<()>,
    ) -> Result<()> {
        match io_result {
            Ok(()) => {
                self.manifest = Some(writer);
                self.log_number = prepared.log_number;
                self.prev_log_number = prepared.prev_log_number;
                self.append_version(prepared.version);
                Ok(())
            }
            Err(e) => {
                if let Some(number) = prepared.new_manifest {
                    drop(writer);
                    self.manifest = None;
                    let _ = std::fs::remove_file(manifest_file_name(&self.dir, number));
                } else {
                    self.manifest = Some(writer);
                }
                Err(e)
            }
        }
    }

    /// The current state expressed as one edit.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(self.icmp.user_comparator().name().to_string());
        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if !pointer.is_empty() {
                edit.set_compact_pointer(level, pointer.clone());
            }
        }
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                edit.add_file(
                    level,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        edit
    }

    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.current.file_to_compact().is_some()
    }

    /// Picks the next compaction: the level whose score crossed 1, else a
    /// file whose seek budget ran out. Returns None when neither applies.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let version = self.current();

        let mut c = if version.compaction_score >= 1.0 {
            let level = version.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);

            // Resume after the last compacted key at this level, wrapping.
            let pointer = &self.compact_pointers[level];
            let first = version
                .files(level)
                .iter()
                .find(|f| {
                    pointer.is_empty()
                        || self.icmp.compare(&f.largest, pointer) == Ordering::Greater
                })
                .or_else(|| version.files(level).first())
                .cloned()?;

            let mut c = Compaction::new(level, Arc::clone(&version), self.icmp.clone());
            c.inputs[0] = vec![first];
            c
        } else if let Some((file, level)) = version.file_to_compact() {
            let mut c = Compaction::new(level, Arc::clone(&version), self.icmp.clone());
            c.inputs[0] = vec![file];
            c
        } else {
            return None;
        };

        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Plans one slice of a manual compaction over `[begin, end]` at `level`.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Option<Compaction> {
        let version = self.current();
        let mut inputs = version.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Keep manual slices bounded; the caller loops until the range is
        // exhausted.
        if level > 0 {
            let mut total = 0;
            for i in 0..inputs.len() {
                total += inputs[i].file_size;
                if total >= MAX_FILE_SIZE {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut c = Compaction::new(level, version, self.icmp.clone());
        c.inputs[0] = inputs;
        self.setup_other_inputs(&mut c);
        Some(c)
    }

    /// Completes a compaction plan: pulls in level+1 overlap, grows the
    /// level-L side when that costs nothing extra at level+1, records the
    /// grandparents, and advances the level's compact pointer.
    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level();
        let version = Arc::clone(c.input_version());

        // Re-expanding by user-key range also picks up neighbors that share
        // a boundary user key, which must compact together.
        let (smallest, largest) = self.range(&c.inputs[0]);
        c.inputs[0] = version.overlapping_inputs(level, Some(&smallest), Some(&largest));
        debug_assert!(!c.inputs[0].is_empty());

        let (smallest, largest) = self.range(&c.inputs[0]);
        c.inputs[1] = version.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));

        let (mut all_start, mut all_limit) = self.range2(&c.inputs[0], &c.inputs[1]);

        if !c.inputs[1].is_empty() {
            let expanded0 = version.overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            let inputs1_size = total_file_size(&c.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size < EXPANDED_COMPACTION_BYTE_LIMIT
            {
                let (new_start, new_limit) = self.range(&expanded0);
                let expanded1 =
                    version.overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                if expanded1.len() == c.inputs[1].len() {
                    tracing::info!(
                        level,
                        from = c.inputs[0].len(),
                        to = expanded0.len(),
                        "expanding compaction inputs"
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let (s, l) = self.range2(&c.inputs[0], &c.inputs[1]);
                    all_start = s;
                    all_limit = l;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents =
                version.overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // The next size compaction at this level resumes past this range,
        // recorded both in memory and in the edit so it survives restarts.
        let (_, largest) = self.range(&c.inputs[0]);
        self.compact_pointers[level] = largest.clone();
        c.edit.set_compact_pointer(level, largest);
    }

    /// Smallest and largest internal keys across a non-empty file set.
    fn range(&self, files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
        debug_assert!(!files.is_empty());
        let mut smallest = files[0].smallest.clone();
        let mut largest = files[0].largest.clone();
        for file in &files[1..] {
            if self.icmp.compare(&file.smallest, &smallest) == Ordering::Less {
                smallest = file.smallest.clone();
            }
            if self.icmp.compare(&file.largest, &largest) == Ordering::Greater {
                largest = file.largest.clone();
            }
        }
        (smallest, largest)
    }

    fn range2(
        &self,
        a: &[Arc<FileMetaData>],
        b: &[Arc<FileMetaData>],
    ) -> (Vec<u8>, Vec<u8>) {
        let mut all: Vec<Arc<FileMetaData>> = a.to_vec();
        all.extend(b.iter().cloned());
        self.range(&all)
    }
}

/// Computes the level most in need of size compaction.
fn finalize(version: &mut Version) {
    let mut best_level = 0;
    let mut best_score = -1.0f64;

    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            // File count, not bytes: L0 files overlap, so every read visits
            // all of them regardless of size.
            version.files(level).len() as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            total_file_size(version.files(level)) as f64 / max_bytes_for_level(level)
        };
        if score > best_score {
            best_score = score;
            best_level = level;
        }
    }

    version.compaction_level = best_level;
    version.compaction_score = best_score;
}

fn max_bytes_for_level(level: usize) -> f64 {
    // 10^level MiB: 10MiB at L1, 100MiB at L2, ...
    let mut result = 1024.0 * 1024.0;
    for _ in 0..level {
        result *= 10.0;
    }
    result
}

/// Accumulates edits against a base version and produces the successor.
struct Builder {
    icmp: InternalKeyComparator,
    base: Arc<Version>,
    deleted: [HashSet<u64>; NUM_LEVELS],
    added: [Vec<Arc<FileMetaData>>; NUM_LEVELS],
}

impl Builder {
    fn new(icmp: InternalKeyComparator, base: Arc<Version>) -> Self {
        Self {
            icmp,
            base,
            deleted: Default::default(),
            added: Default::default(),
        }
    }

    fn apply(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for (level, file) in &edit.new_files {
            self.deleted[*level].remove(&file.number);
            self.added[*level].push(Arc::new(FileMetaData::new(
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            )));
        }
    }

    fn finish(mut self, table_cache: &Arc<TableCache>) -> Version {
        let mut version = Version::empty(self.icmp.clone(), Arc::clone(table_cache));

        for level in 0..NUM_LEVELS {
            let mut files: Vec<Arc<FileMetaData>> = self.base.files(level).to_vec();
            files.append(&mut self.added[level]);
            files.retain(|f| !self.deleted[level].contains(&f.number));

            if level == 0 {
                // Lookup sorts newest-first itself; keep stable number order.
                files.sort_by_key(|f| f.number);
            } else {
                files.sort_by(|a, b| self.icmp.compare(&a.smallest, &b.smallest));
                debug_assert!(
                    files
                        .windows(2)
                        .all(|w| self.icmp.compare(&w[0].largest, &w[1].smallest)
                            == Ordering::Less),
                    "overlapping files installed at level {level}"
                );
            }
            version.files[level] = files;
        }
        version
    }
}
