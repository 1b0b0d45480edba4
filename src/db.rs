//! The engine: one mutex, one background worker, and the coupled machines
//! of the data plane. The write queue runs leader-batched group commit,
//! full memtables rotate behind a fresh WAL, the version set records every
//! file-catalog change in the manifest, and the compaction loop folds
//! levels together.
//!
//! Locking discipline: every state transition happens under `DbCore::state`.
//! The heavy work (WAL appends, table reads and writes, the merge loop)
//! runs with the mutex released, against `Arc`-pinned structures. Threads
//! block only at the documented suspension points: the write queue, the
//! room-for-write loop, manual compaction, and close.

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::batch::WriteBatch;
use crate::config::{
    Options, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER, NUM_LEVELS,
};
use crate::error::{Error, Result};
use crate::filename::{
    self, lock_file_name, log_file_name, manifest_file_name, table_file_name, FileType,
};
use crate::flock::FileLock;
use crate::iterator::{DbIterator, InternalIterator, LevelIter, MergingIterator, PinnedState};
use crate::key::{
    self, InternalKeyComparator, LookupKey, SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER,
};
use crate::memtable::MemTable;
use crate::snapshot::{Snapshot, SnapshotList};
use crate::sstable::TableBuilder;
use crate::table_cache::TableCache;
use crate::version::compaction::Compaction;
use crate::version::edit::VersionEdit;
use crate::version::set::VersionSet;
use crate::wal::{LogReader, LogWriter};

/// An embedded ordered key/value store. One process opens one directory
/// exclusively; the handle is shared freely across threads.
pub struct Database {
    core: Arc<DbCore>,
    background: Mutex<Option<JoinHandle<()>>>,
}

struct DbCore {
    dir: PathBuf,
    options: Options,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,

    shutting_down: AtomicBool,
    /// Mirrors `state.imm.is_some()` so the compaction loop can poll for
    /// flush preemption without taking the mutex on every key.
    has_imm: AtomicBool,

    state: Mutex<DbState>,
    /// Signalled when background work completes; waited on by the write
    /// path, manual compaction, and close.
    background_cv: Condvar,
    /// Wakes the background worker when work is scheduled.
    work_cv: Condvar,
}

struct DbState {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    wal: Option<LogWriter>,
    wal_number: u64,
    versions: VersionSet,

    writers: VecDeque<Arc<Writer>>,
    snapshots: SnapshotList,

    /// File numbers allocated but not yet listed in any installed version;
    /// garbage collection must not touch them.
    pending_outputs: HashSet<u64>,

    background_scheduled: bool,
    background_error: Option<Error>,

    manual_compaction: Option<ManualCompaction>,
    next_manual_id: u64,

    stats: [CompactionStats; NUM_LEVELS],
    lock: Option<FileLock>,
}

/// One queued write. `batch: None` marks a rotation request: it takes no
/// sequence numbers, but forces the memtable to roll when it leads.
struct Writer {
    batch: Option<WriteBatch>,
    sync: bool,
    state: Mutex<WriterState>,
    cv: Condvar,
}

#[derive(Default)]
struct WriterState {
    done: bool,
    promoted: bool,
    result: Option<Result<()>>,
}

struct ManualCompaction {
    id: u64,
    level: usize,
    /// Internal-key bounds; `None` is unbounded.
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    done: bool,
    in_progress: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct CompactionStats {
    micros: u64,
    bytes_read: u64,
    bytes_written: u64,
}

impl CompactionStats {
    fn add(&mut self, micros: u64, bytes_read: u64, bytes_written: u64) {
        self.micros += micros;
        self.bytes_read += bytes_read;
        self.bytes_written += bytes_written;
    }
}

impl Database {
    /// Opens (and if configured, creates) the database in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P, options: Options) -> Result<Database> {
        let dir = dir.as_ref().to_path_buf();
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let table_cache = Arc::new(TableCache::new(dir.clone(), options.clone(), icmp.clone()));

        let _ = fs::create_dir_all(&dir);
        let lock = FileLock::lock(lock_file_name(&dir))?;

        let current_exists = filename::current_file_name(&dir).exists();
        if !current_exists {
            if !options.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "database does not exist at {} and create_if_missing is off",
                    dir.display()
                )));
            }
            initialize_db(&dir, &icmp)?;
        } else if options.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "database already exists at {} and error_if_exists is on",
                dir.display()
            )));
        }

        let mut versions = VersionSet::new(dir.clone(), icmp.clone(), Arc::clone(&table_cache));
        versions.recover()?;

        // Replay WALs newer than the manifest into memtables, spilling to
        // level-0 tables when they grow past the write buffer.
        let mut edit = VersionEdit::new();
        let max_sequence = recover_wal_files(&dir, &options, &icmp, &mut versions, &mut edit)?;
        if versions.last_sequence() < max_sequence {
            versions.set_last_sequence(max_sequence);
        }

        let wal_number = versions.new_file_number();
        let wal_file = File::create(log_file_name(&dir, wal_number))?;
        edit.log_number = Some(wal_number);
        edit.prev_log_number = Some(0);

        let state = DbState {
            mem: Arc::new(MemTable::new(icmp.clone())),
            imm: None,
            wal: Some(LogWriter::new(wal_file)),
            wal_number,
            versions,
            writers: VecDeque::new(),
            snapshots: SnapshotList::new(),
            pending_outputs: HashSet::new(),
            background_scheduled: false,
            background_error: None,
            manual_compaction: None,
            next_manual_id: 1,
            stats: Default::default(),
            lock: Some(lock),
        };

        let core = Arc::new(DbCore {
            dir,
            options,
            icmp,
            table_cache,
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            state: Mutex::new(state),
            background_cv: Condvar::new(),
            work_cv: Condvar::new(),
        });

        {
            let guard = core.state.lock().unwrap();
            let (mut guard, applied) = log_and_apply(&core, guard, edit);
            applied?;
            delete_obsolete_files(&core, &mut guard);
            maybe_schedule_compaction(&core, &mut guard);
        }

        let worker = {
            let core = Arc::clone(&core);
            std::thread::Builder::new()
                .name("tephradb-bg".to_string())
                .spawn(move || background_main(core))?
        };

        tracing::info!(dir = %core.dir.display(), "database opened");
        Ok(Database {
            core,
            background: Mutex::new(Some(worker)),
        })
    }

    /// Inserts or overwrites `key`. Durable on crash only once a sync write
    /// or flush follows; use [`Database::write`] with `sync` for immediate
    /// durability.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, false)
    }

    /// Removes `key`. Deleting an absent key succeeds.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, false)
    }

    /// Commits a batch atomically. With `sync`, the WAL is fsynced before
    /// the call returns.
    pub fn write(&self, batch: WriteBatch, sync: bool) -> Result<()> {
        self.write_internal(Some(batch), sync)
    }

    /// Reads the newest value of `key` at the current sequence.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(key, None)
    }

    /// Reads `key` as of `snapshot` (or the current state when `None`).
    pub fn get_at(&self, key: &[u8], snapshot: Option<&Snapshot>) -> Result<Option<Vec<u8>>> {
        let core = &self.core;
        let mut guard = core.state.lock().unwrap();
        if let Some(e) = &guard.background_error {
            return Err(Error::Background(Box::new(e.clone())));
        }
        let sequence = snapshot
            .map(|s| s.sequence())
            .unwrap_or_else(|| guard.versions.last_sequence());
        let mem = Arc::clone(&guard.mem);
        let imm = guard.imm.clone();
        let version = guard.versions.current();
        drop(guard);

        let lookup = LookupKey::new(key, sequence);
        if let Some(answer) = mem.get(&lookup) {
            return Ok(answer);
        }
        if let Some(imm) = imm {
            if let Some(answer) = imm.get(&lookup) {
                return Ok(answer);
            }
        }

        let (answer, stats) = version.get(&lookup)?;
        if stats.seek_file.is_some() {
            guard = core.state.lock().unwrap();
            if version.update_stats(stats) {
                maybe_schedule_compaction(core, &mut guard);
            }
        }
        Ok(answer.flatten())
    }

    /// Ordered iteration over live keys at the current state or a snapshot.
    /// The iterator pins the memtables and version it reads from.
    pub fn iter(&self, snapshot: Option<&Snapshot>) -> Result<DbIterator> {
        let guard = self.core.state.lock().unwrap();
        if let Some(e) = &guard.background_error {
            return Err(Error::Background(Box::new(e.clone())));
        }
        let sequence = snapshot
            .map(|s| s.sequence())
            .unwrap_or_else(|| guard.versions.last_sequence());
        let pinned = PinnedState {
            mem: Arc::clone(&guard.mem),
            imm: guard.imm.clone(),
            version: guard.versions.current(),
        };
        drop(guard);
        Ok(DbIterator::new(self.core.icmp.clone(), sequence, pinned))
    }

    /// Pins the current sequence. Release with
    /// [`Database::release_snapshot`].
    pub fn snapshot(&self) -> Snapshot {
        let mut guard = self.core.state.lock().unwrap();
        let sequence = guard.versions.last_sequence();
        guard.snapshots.snapshot(sequence)
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        let mut guard = self.core.state.lock().unwrap();
        guard.snapshots.release(&snapshot);
    }

    /// Compacts every level overlapping the user-key range (`None` bounds
    /// are unbounded). Blocks until the work is done. Useful to settle the
    /// database into its densest form.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let core = &self.core;
        let max_level = {
            let guard = core.state.lock().unwrap();
            let version = guard.versions.current();
            let mut max_level = 1;
            for level in 1..NUM_LEVELS - 1 {
                if version.overlap_in_level(level, begin, end) {
                    max_level = level;
                }
            }
            max_level
        };

        // Get the memtable contents onto disk first.
        self.write_internal(None, false)?;
        {
            let mut guard = core.state.lock().unwrap();
            while guard.imm.is_some()
                && guard.background_error.is_none()
                && !core.shutting_down.load(AtomicOrdering::Acquire)
            {
                guard = core.background_cv.wait(guard).unwrap();
            }
            if let Some(e) = &guard.background_error {
                return Err(Error::Background(Box::new(e.clone())));
            }
            if core.shutting_down.load(AtomicOrdering::Acquire) {
                return Err(Error::Shutdown);
            }
        }

        for level in 0..=max_level {
            self.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Approximate on-disk bytes spanned by each `[start, limit]` user-key
    /// range. Memtable contents are not counted.
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let version = {
            let guard = self.core.state.lock().unwrap();
            guard.versions.current()
        };
        ranges
            .iter()
            .map(|(start, limit)| {
                let k1 = key::make_internal_key(start, MAX_SEQUENCE_NUMBER, ValueType::Value);
                let k2 = key::make_internal_key(limit, MAX_SEQUENCE_NUMBER, ValueType::Value);
                version
                    .approximate_offset_of(&k2)
                    .saturating_sub(version.approximate_offset_of(&k1))
            })
            .collect()
    }

    /// Introspection properties: `num-files-at-level<N>` and `stats`.
    pub fn property(&self, name: &str) -> Option<String> {
        let guard = self.core.state.lock().unwrap();
        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(guard.versions.num_level_files(level).to_string());
        }
        if name == "stats" {
            let mut out = String::new();
            out.push_str("                               Compactions\n");
            out.push_str("Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n");
            out.push_str("--------------------------------------------------\n");
            for level in 0..NUM_LEVELS {
                let files = guard.versions.num_level_files(level);
                let stats = guard.stats[level];
                if files > 0 || stats.micros > 0 {
                    out.push_str(&format!(
                        "{:5} {:6} {:8.1} {:9.3} {:8.1} {:9.1}\n",
                        level,
                        files,
                        guard.versions.num_level_bytes(level) as f64 / 1048576.0,
                        stats.micros as f64 / 1e6,
                        stats.bytes_read as f64 / 1048576.0,
                        stats.bytes_written as f64 / 1048576.0,
                    ));
                }
            }
            return Some(out);
        }
        None
    }

    /// Stops the background worker and releases the directory lock.
    /// Equivalent to dropping the handle.
    pub fn close(self) {
        drop(self);
    }

    fn write_internal(&self, batch: Option<WriteBatch>, sync: bool) -> Result<()> {
        let core = &self.core;
        let writer = Arc::new(Writer {
            batch,
            sync,
            state: Mutex::new(WriterState::default()),
            cv: Condvar::new(),
        });

        let mut guard = core.state.lock().unwrap();
        guard.writers.push_back(Arc::clone(&writer));

        if !Arc::ptr_eq(guard.writers.front().unwrap(), &writer) {
            // Follower: sleep until the leader commits us or hands over.
            drop(guard);
            let mut ws = writer.state.lock().unwrap();
            while !ws.done && !ws.promoted {
                ws = writer.cv.wait(ws).unwrap();
            }
            if ws.done {
                return ws.result.take().expect("completed writer has a result");
            }
            drop(ws);
            guard = core.state.lock().unwrap();
        }

        // Leader.
        let force = writer.batch.is_none();
        let (room_guard, room) = make_room_for_write(core, guard, force);
        guard = room_guard;

        let mut result = room;
        let mut group: Vec<Arc<Writer>> = vec![Arc::clone(&writer)];

        if result.is_ok() && writer.batch.is_some() {
            group = build_batch_group(&guard);
            let sequence = guard.versions.last_sequence() + 1;
            let mem = Arc::clone(&guard.mem);
            let mut wal = guard.wal.take().expect("wal writer present");
            drop(guard);

            // WAL append, optional fsync, then memtable apply, all outside
            // the mutex; the queue ensures a single leader.
            let grouped_storage;
            let grouped: &WriteBatch = if group.len() == 1 {
                writer.batch.as_ref().unwrap()
            } else {
                let mut merged = WriteBatch::new();
                for member in &group {
                    merged.append(member.batch.as_ref().expect("grouped writers carry batches"));
                }
                grouped_storage = merged;
                &grouped_storage
            };
            let count = grouped.count() as u64;

            let mut io = wal.add_record(&grouped.encode(sequence));
            if io.is_ok() && writer.sync {
                io = wal.sync();
            }
            if io.is_ok() {
                grouped.insert_into(sequence, &mem);
            }

            guard = core.state.lock().unwrap();
            guard.wal = Some(wal);
            match io {
                Ok(()) => {
                    if count > 0 {
                        guard.versions.set_last_sequence(sequence + count - 1);
                    }
                    result = Ok(());
                }
                Err(e) => {
                    // The WAL tail is now suspect; latch so nothing commits
                    // on top of it.
                    tracing::error!(error = %e, "wal append failed");
                    guard.background_error.get_or_insert(e.clone());
                    core.background_cv.notify_all();
                    result = Err(e);
                }
            }
        }

        // Pop the whole group, waking followers with the shared outcome.
        for member in &group {
            let popped = guard.writers.pop_front().expect("writer queue underflow");
            debug_assert!(Arc::ptr_eq(&popped, member));
            if !Arc::ptr_eq(&popped, &writer) {
                let mut ws = popped.state.lock().unwrap();
                ws.done = true;
                ws.result = Some(result.clone());
                popped.cv.notify_one();
            }
        }
        if let Some(head) = guard.writers.front() {
            let mut ws = head.state.lock().unwrap();
            ws.promoted = true;
            head.cv.notify_one();
        }
        result
    }

    /// Runs one manual compaction covering `[begin, end]` at `level`,
    /// waiting for the background worker to chew through every slice.
    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let core = &self.core;
        let begin_key = begin.map(|b| key::make_internal_key(b, MAX_SEQUENCE_NUMBER, ValueType::Value));
        let end_key = end.map(|e| key::make_internal_key(e, 0, ValueType::Deletion));

        let mut guard = core.state.lock().unwrap();
        let id = guard.next_manual_id;
        guard.next_manual_id += 1;

        loop {
            if core.shutting_down.load(AtomicOrdering::Acquire) {
                return Err(Error::Shutdown);
            }
            if let Some(e) = &guard.background_error {
                return Err(Error::Background(Box::new(e.clone())));
            }
            match &guard.manual_compaction {
                Some(m) if m.id == id => {
                    if m.done && !m.in_progress {
                        guard.manual_compaction = None;
                        return Ok(());
                    }
                    guard = core.background_cv.wait(guard).unwrap();
                }
                Some(_) => {
                    // Another manual compaction owns the slot.
                    guard = core.background_cv.wait(guard).unwrap();
                }
                None => {
                    guard.manual_compaction = Some(ManualCompaction {
                        id,
                        level,
                        begin: begin_key.clone(),
                        end: end_key.clone(),
                        done: false,
                        in_progress: false,
                    });
                    maybe_schedule_compaction(core, &mut guard);
                }
            }
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.core.shutting_down.store(true, AtomicOrdering::Release);
        self.core.work_cv.notify_all();
        self.core.background_cv.notify_all();
        if let Some(handle) = self.background.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut guard = self.core.state.lock().unwrap();
        guard.lock.take();
        tracing::info!(dir = %self.core.dir.display(), "database closed");
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.core.dir)
            .finish()
    }
}

/// Writes the initial manifest and CURRENT for a brand-new database.
fn initialize_db(dir: &Path, icmp: &InternalKeyComparator) -> Result<()> {
    let mut edit = VersionEdit::new();
    edit.comparator_name = Some(icmp.user_comparator().name().to_string());
    edit.log_number = Some(0);
    edit.next_file_number = Some(2);
    edit.last_sequence = Some(0);

    let file = File::create(manifest_file_name(dir, 1))?;
    let mut writer = LogWriter::new(file);
    writer.add_record(&edit.encode())?;
    writer.sync()?;
    filename::set_current_file(dir, 1)
}

/// Replays WALs newer than the manifest. Each batch lands in a recovery
/// memtable; oversized memtables spill to level-0 tables recorded in `edit`.
/// Returns the highest sequence seen.
fn recover_wal_files(
    dir: &Path,
    options: &Options,
    icmp: &InternalKeyComparator,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
) -> Result<SequenceNumber> {
    let mut expected: HashSet<u64> = versions.live_files();
    let mut logs: Vec<u64> = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some((number, file_type)) = filename::parse_file_name(&name) else {
            continue;
        };
        match file_type {
            FileType::Table => {
                expected.remove(&number);
            }
            FileType::Log
                if number >= versions.log_number() || number == versions.prev_log_number() =>
            {
                logs.push(number)
            }
            _ => {}
        }
    }
    if !expected.is_empty() {
        return Err(Error::Corruption(format!(
            "{} table files named by the manifest are missing (e.g. {:06})",
            expected.len(),
            expected.iter().next().unwrap()
        )));
    }

    logs.sort_unstable();
    let mut max_sequence = 0;

    for number in logs {
        let path = log_file_name(dir, number);
        tracing::info!(wal = number, "replaying write-ahead log");
        let mut reader = LogReader::new(File::open(&path)?);
        let mut mem = Arc::new(MemTable::new(icmp.clone()));

        loop {
            let record = match reader.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    if options.paranoid_checks {
                        return Err(e);
                    }
                    tracing::warn!(wal = number, error = %e, "dropping damaged wal tail");
                    break;
                }
            };
            let (sequence, batch) = match WriteBatch::decode(&record) {
                Ok(decoded) => decoded,
                Err(e) => {
                    if options.paranoid_checks {
                        return Err(e);
                    }
                    tracing::warn!(wal = number, error = %e, "dropping undecodable wal record");
                    break;
                }
            };
            batch.insert_into(sequence, &mem);
            if batch.count() > 0 {
                max_sequence = max_sequence.max(sequence + batch.count() as u64 - 1);
            }

            if mem.approximate_memory_usage() > options.write_buffer_size {
                write_level0_table(dir, options, versions, &mem, edit)?;
                mem = Arc::new(MemTable::new(icmp.clone()));
            }
        }

        if !mem.is_empty() {
            write_level0_table(dir, options, versions, &mem, edit)?;
        }
        versions.mark_file_number_used(number);
    }

    Ok(max_sequence)
}

/// Builds a level-0 table from a recovery memtable and records it in `edit`.
fn write_level0_table(
    dir: &Path,
    options: &Options,
    versions: &mut VersionSet,
    mem: &Arc<MemTable>,
    edit: &mut VersionEdit,
) -> Result<()> {
    let number = versions.new_file_number();
    match build_table(dir, options, number, mem)? {
        Some((file_size, smallest, largest)) => {
            edit.add_file(0, number, file_size, smallest, largest);
        }
        None => versions.reuse_file_number(number),
    }
    Ok(())
}

/// Streams a memtable into table file `number`. Returns `None` (and removes
/// the file) when the memtable is empty.
fn build_table(
    dir: &Path,
    options: &Options,
    number: u64,
    mem: &Arc<MemTable>,
) -> Result<Option<(u64, Vec<u8>, Vec<u8>)>> {
    let path = table_file_name(dir, number);
    let mut builder = TableBuilder::new(&path, options)?;

    let mut smallest: Option<Vec<u8>> = None;
    let mut largest: Vec<u8> = Vec::new();
    for (internal_key, value) in mem.iter() {
        if smallest.is_none() {
            smallest = Some(internal_key.clone());
        }
        largest = internal_key.clone();
        builder.add(&internal_key, &value)?;
    }

    match smallest {
        Some(smallest) => {
            let file_size = builder.finish()?;
            tracing::info!(table = number, bytes = file_size, "wrote level-0 table");
            Ok(Some((file_size, smallest, largest)))
        }
        None => {
            drop(builder);
            let _ = fs::remove_file(&path);
            Ok(None)
        }
    }
}

/// Concatenates the batches queued behind the leader, up to the size caps:
/// 1MiB, or `leader + 128KiB` when the leader is small so tiny writes are
/// not held hostage by large ones. Never mixes sync and non-sync, and never
/// crosses a rotation request.
fn build_batch_group(state: &DbState) -> Vec<Arc<Writer>> {
    let first = Arc::clone(state.writers.front().expect("leader enqueued"));
    let first_size = first.batch.as_ref().expect("leader carries a batch").approximate_size();

    let max_size = if first_size <= 128 * 1024 {
        first_size + 128 * 1024
    } else {
        1 << 20
    };

    let mut group = vec![Arc::clone(&first)];
    let mut size = first_size;
    for candidate in state.writers.iter().skip(1) {
        if candidate.sync != first.sync {
            // Grouping must not change any write's durability, in either
            // direction.
            break;
        }
        let Some(batch) = &candidate.batch else {
            break;
        };
        size += batch.approximate_size();
        if size > max_size {
            break;
        }
        group.push(Arc::clone(candidate));
    }
    group
}

/// Admission loop, run by the leader with the mutex held: fail on a latched
/// error, absorb level-0 pressure as a one-time 1ms delay, wait while a
/// flush is pending or level 0 is at the hard stop, and otherwise rotate
/// the memtable when it is full.
fn make_room_for_write<'a>(
    core: &'a DbCore,
    mut guard: MutexGuard<'a, DbState>,
    mut force: bool,
) -> (MutexGuard<'a, DbState>, Result<()>) {
    let mut allow_delay = !force;
    loop {
        if core.shutting_down.load(AtomicOrdering::Acquire) {
            return (guard, Err(Error::Shutdown));
        }
        if let Some(e) = &guard.background_error {
            let e = e.clone();
            return (guard, Err(Error::Background(Box::new(e))));
        }

        if allow_delay && guard.versions.num_level_files(0) > L0_SLOWDOWN_WRITES_TRIGGER {
            // Near the hard limit: spread the stall as 1ms per write and
            // give the compaction thread a turn.
            drop(guard);
            std::thread::sleep(std::time::Duration::from_millis(1));
            guard = core.state.lock().unwrap();
            allow_delay = false;
            continue;
        }

        if !force && guard.mem.approximate_memory_usage() <= core.options.write_buffer_size {
            return (guard, Ok(()));
        }

        if guard.imm.is_some() {
            // Previous memtable still flushing; only one may be immutable.
            guard = core.background_cv.wait(guard).unwrap();
            continue;
        }

        if guard.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
            tracing::warn!("level-0 at hard stop; waiting for compaction");
            guard = core.background_cv.wait(guard).unwrap();
            continue;
        }

        // Rotate: fresh WAL, current memtable becomes immutable.
        debug_assert_eq!(guard.versions.prev_log_number(), 0);
        let new_number = guard.versions.new_file_number();
        let file = match File::create(log_file_name(&core.dir, new_number)) {
            Ok(file) => file,
            Err(e) => {
                guard.versions.reuse_file_number(new_number);
                return (guard, Err(e.into()));
            }
        };
        if let Some(mut old_wal) = guard.wal.take() {
            if let Err(e) = old_wal.flush() {
                tracing::warn!(error = %e, "flush of retired wal failed");
            }
        }
        guard.wal = Some(LogWriter::new(file));
        guard.wal_number = new_number;

        let full = std::mem::replace(&mut guard.mem, Arc::new(MemTable::new(core.icmp.clone())));
        guard.imm = Some(full);
        core.has_imm.store(true, AtomicOrdering::Release);
        force = false;
        maybe_schedule_compaction(core, &mut guard);
    }
}

/// Schedules the single background task if there is work and nothing stands
/// in the way.
fn maybe_schedule_compaction(core: &DbCore, guard: &mut MutexGuard<'_, DbState>) {
    if guard.background_scheduled {
        return;
    }
    if core.shutting_down.load(AtomicOrdering::Acquire) {
        return;
    }
    if guard.background_error.is_some() {
        return;
    }
    let manual_pending = guard
        .manual_compaction
        .as_ref()
        .map(|m| !m.done)
        .unwrap_or(false);
    if guard.imm.is_none() && !manual_pending && !guard.versions.needs_compaction() {
        return;
    }
    guard.background_scheduled = true;
    core.work_cv.notify_one();
}

/// Background worker: waits for scheduled work, runs it, reschedules if more
/// arrived meanwhile, and wakes every waiter after each unit.
fn background_main(core: Arc<DbCore>) {
    let mut guard = core.state.lock().unwrap();
    loop {
        while !guard.background_scheduled && !core.shutting_down.load(AtomicOrdering::Acquire) {
            guard = core.work_cv.wait(guard).unwrap();
        }
        if core.shutting_down.load(AtomicOrdering::Acquire) {
            break;
        }

        guard = background_work(&core, guard);

        guard.background_scheduled = false;
        // The previous pass may have produced more work (a rotation during
        // compaction, a pending manual slice).
        maybe_schedule_compaction(&core, &mut guard);
        core.background_cv.notify_all();
    }
    drop(guard);
    core.background_cv.notify_all();
}

fn background_work<'a>(
    core: &'a DbCore,
    mut guard: MutexGuard<'a, DbState>,
) -> MutexGuard<'a, DbState> {
    // Flushes always come first: they unblock the write path.
    if guard.imm.is_some() {
        let (returned, result) = compact_memtable(core, guard);
        guard = returned;
        match result {
            Ok(()) | Err(Error::Shutdown) => {}
            Err(e) => latch_background_error(core, &mut guard, e),
        }
        return guard;
    }

    let is_manual = guard
        .manual_compaction
        .as_ref()
        .map(|m| !m.done)
        .unwrap_or(false);

    let mut manual_end: Option<Vec<u8>> = None;
    let compaction: Option<Compaction> = if is_manual {
        let (level, begin, end) = {
            let manual = guard.manual_compaction.as_mut().unwrap();
            manual.in_progress = true;
            (manual.level, manual.begin.clone(), manual.end.clone())
        };
        let compaction = guard
            .versions
            .compact_range(level, begin.as_deref(), end.as_deref());
        match &compaction {
            Some(c) => {
                let last = c.num_input_files(0) - 1;
                manual_end = Some(c.input(0, last).largest.clone());
            }
            None => guard.manual_compaction.as_mut().unwrap().done = true,
        }
        compaction
    } else {
        guard.versions.pick_compaction()
    };

    let mut failed = false;
    match compaction {
        None => {}
        Some(mut c) if !is_manual && c.is_trivial_move() => {
            // Relocate the file one level down; no data rewrite.
            let file = Arc::clone(c.input(0, 0));
            let level = c.level();
            c.edit.delete_file(level, file.number);
            c.edit.add_file(
                level + 1,
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            );
            let edit = std::mem::take(&mut c.edit);
            let (returned, applied) = log_and_apply(core, guard, edit);
            guard = returned;
            match applied {
                Ok(()) => {
                    tracing::info!(
                        file = file.number,
                        bytes = file.file_size,
                        from = level,
                        to = level + 1,
                        "trivial move"
                    );
                }
                Err(e) => {
                    failed = true;
                    latch_background_error(core, &mut guard, e);
                }
            }
        }
        Some(c) => {
            let (returned, result) = do_compaction_work(core, guard, c);
            guard = returned;
            match result {
                Ok(()) => {}
                Err(Error::Shutdown) => {
                    // Outputs discarded; next open garbage-collects them.
                }
                Err(e) => {
                    failed = true;
                    latch_background_error(core, &mut guard, e);
                }
            }
            delete_obsolete_files(core, &mut guard);
        }
    }

    if is_manual {
        let manual = guard.manual_compaction.as_mut().unwrap();
        if failed {
            manual.done = true;
        }
        if !manual.done {
            // More of the range remains: continue past the processed keys.
            manual.begin = manual_end;
        }
        manual.in_progress = false;
    }
    guard
}

fn latch_background_error(core: &DbCore, guard: &mut MutexGuard<'_, DbState>, e: Error) {
    tracing::error!(error = %e, "background task failed; latching");
    guard.background_error.get_or_insert(e);
    core.background_cv.notify_all();
}

/// Flushes the immutable memtable to a table file and installs it, pushed to
/// the deepest level it does not disturb.
fn compact_memtable<'a>(
    core: &'a DbCore,
    mut guard: MutexGuard<'a, DbState>,
) -> (MutexGuard<'a, DbState>, Result<()>) {
    debug_assert!(guard.imm.is_some());
    let started = Instant::now();

    let imm = Arc::clone(guard.imm.as_ref().unwrap());
    let base = guard.versions.current();
    let number = guard.versions.new_file_number();
    guard.pending_outputs.insert(number);
    drop(guard);

    let built = build_table(&core.dir, &core.options, number, &imm);

    guard = core.state.lock().unwrap();
    let mut edit = VersionEdit::new();
    match built {
        Ok(Some((file_size, smallest, largest))) => {
            let level = base
                .pick_level_for_memtable_output(key::user_key(&smallest), key::user_key(&largest));
            guard.stats[level].add(started.elapsed().as_micros() as u64, 0, file_size);
            tracing::info!(table = number, level, bytes = file_size, "flushed memtable");
            edit.add_file(level, number, file_size, smallest, largest);
        }
        Ok(None) => {
            guard.pending_outputs.remove(&number);
            guard.versions.reuse_file_number(number);
        }
        Err(e) => {
            guard.pending_outputs.remove(&number);
            return (guard, Err(e));
        }
    }

    if core.shutting_down.load(AtomicOrdering::Acquire) {
        guard.pending_outputs.remove(&number);
        return (guard, Err(Error::Shutdown));
    }

    // The flushed WAL (and anything older) is no longer needed for recovery.
    edit.prev_log_number = Some(0);
    edit.log_number = Some(guard.wal_number);
    let (returned, applied) = log_and_apply(core, guard, edit);
    guard = returned;
    guard.pending_outputs.remove(&number);

    match applied {
        Ok(()) => {
            guard.imm = None;
            core.has_imm.store(false, AtomicOrdering::Release);
            delete_obsolete_files(core, &mut guard);
            (guard, Ok(()))
        }
        Err(e) => (guard, Err(e)),
    }
}

struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: Vec<u8>,
    largest: Vec<u8>,
}

/// Merge-compaction loop: snapshot-aware shadow and tombstone dropping,
/// grandparent-bounded output splitting, and flush preemption.
fn do_compaction_work<'a>(
    core: &'a DbCore,
    mut guard: MutexGuard<'a, DbState>,
    mut c: Compaction,
) -> (MutexGuard<'a, DbState>, Result<()>) {
    let started = Instant::now();
    let level = c.level();
    tracing::info!(
        level,
        inputs0 = c.num_input_files(0),
        inputs1 = c.num_input_files(1),
        "starting compaction"
    );
    debug_assert!(guard.versions.num_level_files(level) > 0);

    let smallest_snapshot = guard
        .snapshots
        .oldest()
        .unwrap_or_else(|| guard.versions.last_sequence());

    let mut input = make_input_iterator(core, &c);
    drop(guard);

    let ucmp = Arc::clone(core.icmp.user_comparator());
    let mut outputs: Vec<CompactionOutput> = Vec::new();
    let mut builder: Option<(u64, TableBuilder, Vec<u8>, Vec<u8>)> = None; // number, builder, smallest, largest

    let mut last_user_key: Option<Vec<u8>> = None;
    let mut last_seq_for_key = MAX_SEQUENCE_NUMBER;
    let mut result: Result<()> = Ok(());

    while input.valid() {
        // Flushes preempt compaction so the write path never stalls on us.
        if core.has_imm.load(AtomicOrdering::Acquire) {
            guard = core.state.lock().unwrap();
            if guard.imm.is_some() {
                let (returned, flushed) = compact_memtable(core, guard);
                guard = returned;
                if let Err(e) = flushed {
                    drop(guard);
                    result = Err(e);
                    break;
                }
            }
            core.background_cv.notify_all();
            drop(guard);
        }
        if core.shutting_down.load(AtomicOrdering::Acquire) {
            result = Err(Error::Shutdown);
            break;
        }

        let internal_key = input.key().to_vec();

        if builder.is_some() && c.should_stop_before(&internal_key) {
            if let Err(e) = finish_output(&mut builder, &mut outputs) {
                result = Err(e);
                break;
            }
        }

        let mut drop_entry = false;
        match key::parse_internal_key(&internal_key) {
            Err(e) => {
                if core.options.paranoid_checks {
                    result = Err(e);
                    break;
                }
                // Keep the bytes verbatim and forget key-tracking state.
                last_user_key = None;
                last_seq_for_key = MAX_SEQUENCE_NUMBER;
            }
            Ok(parsed) => {
                let first_occurrence = !last_user_key
                    .as_deref()
                    .map(|last| ucmp.compare(parsed.user_key, last) == std::cmp::Ordering::Equal)
                    .unwrap_or(false);
                if first_occurrence {
                    last_user_key = Some(parsed.user_key.to_vec());
                    last_seq_for_key = MAX_SEQUENCE_NUMBER;
                }

                if last_seq_for_key <= smallest_snapshot {
                    // Shadowed by a newer revision already emitted.
                    drop_entry = true;
                } else if parsed.value_type == ValueType::Deletion
                    && parsed.sequence <= smallest_snapshot
                    && c.is_base_level_for_key(parsed.user_key)
                {
                    // Tombstone with nothing left to shadow anywhere deeper.
                    drop_entry = true;
                }
                last_seq_for_key = parsed.sequence;
            }
        }

        if !drop_entry {
            if builder.is_none() {
                guard = core.state.lock().unwrap();
                let number = guard.versions.new_file_number();
                guard.pending_outputs.insert(number);
                drop(guard);
                match TableBuilder::new(&table_file_name(&core.dir, number), &core.options) {
                    Ok(b) => builder = Some((number, b, internal_key.clone(), Vec::new())),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            let (_, b, _, largest) = builder.as_mut().unwrap();
            largest.clear();
            largest.extend_from_slice(&internal_key);
            if let Err(e) = b.add(&internal_key, input.value()) {
                result = Err(e);
                break;
            }
            if b.file_size_estimate() >= c.max_output_file_size() {
                if let Err(e) = finish_output(&mut builder, &mut outputs) {
                    result = Err(e);
                    break;
                }
            }
        }

        input.advance();
    }

    if result.is_ok() {
        result = input.status();
    }
    if result.is_ok() && builder.is_some() {
        result = finish_output(&mut builder, &mut outputs);
    }
    drop(input);

    guard = core.state.lock().unwrap();

    let bytes_read = (0..2)
        .map(|which| {
            (0..c.num_input_files(which))
                .map(|i| c.input(which, i).file_size)
                .sum::<u64>()
        })
        .sum::<u64>();
    let bytes_written = outputs.iter().map(|o| o.file_size).sum::<u64>();
    guard.stats[level + 1].add(started.elapsed().as_micros() as u64, bytes_read, bytes_written);

    match result {
        Ok(()) => {
            c.add_input_deletions();
            for output in &outputs {
                c.edit.add_file(
                    level + 1,
                    output.number,
                    output.file_size,
                    output.smallest.clone(),
                    output.largest.clone(),
                );
            }
            let edit = std::mem::take(&mut c.edit);
            let entries_out = outputs.len();
            let (returned, applied) = log_and_apply(core, guard, edit);
            guard = returned;
            for output in &outputs {
                guard.pending_outputs.remove(&output.number);
            }
            match applied {
                Ok(()) => {
                    tracing::info!(
                        level,
                        outputs = entries_out,
                        bytes_read,
                        bytes_written,
                        "compaction finished"
                    );
                    (guard, Ok(()))
                }
                Err(e) => (guard, Err(e)),
            }
        }
        Err(e) => {
            // Forget the half-built outputs; they are garbage on disk now
            // and will be collected once no error is latched (or at reopen).
            if let Some((number, _, _, _)) = &builder {
                guard.pending_outputs.remove(number);
            }
            for output in &outputs {
                guard.pending_outputs.remove(&output.number);
            }
            (guard, Err(e))
        }
    }
}

fn finish_output(
    builder: &mut Option<(u64, TableBuilder, Vec<u8>, Vec<u8>)>,
    outputs: &mut Vec<CompactionOutput>,
) -> Result<()> {
    let (number, b, smallest, largest) = builder.take().expect("open output");
    debug_assert!(b.num_entries() > 0);
    let file_size = b.finish()?;
    outputs.push(CompactionOutput {
        number,
        file_size,
        smallest,
        largest,
    });
    Ok(())
}

/// Merging cursor over a compaction's inputs: every level-0 file separately
/// (they overlap), each deeper level as one concatenated run.
fn make_input_iterator(core: &DbCore, c: &Compaction) -> MergingIterator {
    let cache = Arc::clone(&core.table_cache);
    let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
    if c.level() == 0 {
        for file in &c.inputs[0] {
            children.push(Box::new(LevelIter::new(
                vec![Arc::clone(file)],
                Arc::clone(&cache),
            )));
        }
    } else {
        children.push(Box::new(LevelIter::new(
            c.inputs[0].clone(),
            Arc::clone(&cache),
        )));
    }
    children.push(Box::new(LevelIter::new(c.inputs[1].clone(), cache)));
    MergingIterator::new(core.icmp.clone(), children)
}

/// Applies an edit: finalize under the mutex, write and sync the manifest
/// record (and repoint CURRENT for a fresh manifest) with the mutex
/// released, then install the new version.
fn log_and_apply<'a>(
    core: &'a DbCore,
    mut guard: MutexGuard<'a, DbState>,
    mut edit: VersionEdit,
) -> (MutexGuard<'a, DbState>, Result<()>) {
    let prepared = match guard.versions.prepare_apply(&mut edit) {
        Ok(prepared) => prepared,
        Err(e) => return (guard, Err(e)),
    };
    let mut writer = guard.versions.take_manifest();
    drop(guard);

    let io = writer
        .add_record(&prepared.record)
        .and_then(|_| writer.sync())
        .and_then(|_| match prepared.new_manifest {
            Some(number) => filename::set_current_file(&core.dir, number),
            None => Ok(()),
        });

    let mut guard = core.state.lock().unwrap();
    let result = guard.versions.finish_apply(writer, prepared, io);
    (guard, result)
}

/// Removes files no live version references: retired WALs and manifests,
/// and table files absent from every version and from `pending_outputs`.
fn delete_obsolete_files(core: &DbCore, guard: &mut MutexGuard<'_, DbState>) {
    if guard.background_error.is_some() {
        // After an error the true file state is uncertain; keep everything.
        return;
    }

    let mut live = guard.versions.live_files();
    live.extend(guard.pending_outputs.iter().copied());
    let log_number = guard.versions.log_number();
    let prev_log_number = guard.versions.prev_log_number();
    let manifest_number = guard.versions.manifest_file_number();

    let Ok(entries) = fs::read_dir(&core.dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some((number, file_type)) = filename::parse_file_name(&name) else {
            continue;
        };
        let keep = match file_type {
            FileType::Log => number >= log_number || number == prev_log_number,
            FileType::Manifest => number >= manifest_number,
            FileType::Table | FileType::Temp => live.contains(&number),
            FileType::Current | FileType::Lock => true,
        };
        if keep {
            continue;
        }
        if file_type == FileType::Table {
            core.table_cache.evict(number);
        }
        tracing::info!(file = %name, "deleting obsolete file");
        if let Err(e) = fs::remove_file(core.dir.join(&name)) {
            tracing::warn!(file = %name, error = %e, "failed to delete obsolete file");
        }
    }
}
