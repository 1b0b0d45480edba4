//! End-to-end behavior of the engine: round-trips, snapshots, recovery,
//! write pressure, seek-driven compaction, and tombstone collection.

use std::sync::Arc;

use tephradb::key::{parse_internal_key, InternalKeyComparator};
use tephradb::sstable::Table;
use tephradb::{BytewiseComparator, Database, Options, WriteBatch};

use rand::seq::SliceRandom;
use tempfile::{tempdir, TempDir};

fn open_default() -> (TempDir, Database) {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path(), Options::default()).expect("open");
    (dir, db)
}

fn value_of(db: &Database, key: &[u8]) -> Option<Vec<u8>> {
    db.get(key).expect("get")
}

#[test]
fn test_basic_round_trip() {
    let (_dir, db) = open_default();

    db.put(b"a", b"1").expect("put a");
    db.put(b"b", b"2").expect("put b");
    db.delete(b"a").expect("delete a");

    assert_eq!(value_of(&db, b"a"), None);
    assert_eq!(value_of(&db, b"b"), Some(b"2".to_vec()));

    let entries: Vec<_> = db
        .iter(None)
        .expect("iter")
        .map(|r| r.expect("iter entry"))
        .collect();
    assert_eq!(entries, vec![(b"b".to_vec(), b"2".to_vec())]);
}

#[test]
fn test_snapshot_isolation() {
    let (_dir, db) = open_default();

    db.put(b"k", b"v1").expect("put v1");
    let snapshot = db.snapshot();
    db.put(b"k", b"v2").expect("put v2");

    assert_eq!(value_of(&db, b"k"), Some(b"v2".to_vec()));
    assert_eq!(
        db.get_at(b"k", Some(&snapshot)).expect("get at snapshot"),
        Some(b"v1".to_vec())
    );

    // The snapshot also fixes what an iterator sees.
    let at_snapshot: Vec<_> = db
        .iter(Some(&snapshot))
        .expect("iter")
        .map(|r| r.expect("entry"))
        .collect();
    assert_eq!(at_snapshot, vec![(b"k".to_vec(), b"v1".to_vec())]);

    db.release_snapshot(snapshot);
    db.compact_range(None, None).expect("compact");
    assert_eq!(value_of(&db, b"k"), Some(b"v2".to_vec()));
}

#[test]
fn test_atomic_batch() {
    let (_dir, db) = open_default();

    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1");
    batch.put(b"b", b"2");
    batch.delete(b"a");
    db.write(batch, false).expect("write batch");

    assert_eq!(value_of(&db, b"a"), None);
    assert_eq!(value_of(&db, b"b"), Some(b"2".to_vec()));
}

#[test]
fn test_boundary_values() {
    let (_dir, db) = open_default();

    // Empty key and empty value are ordinary data.
    db.put(b"", b"empty-key").expect("put empty key");
    db.put(b"empty-value", b"").expect("put empty value");
    assert_eq!(value_of(&db, b""), Some(b"empty-key".to_vec()));
    assert_eq!(value_of(&db, b"empty-value"), Some(b"".to_vec()));

    // Deleting a key that never existed succeeds.
    db.delete(b"never-was").expect("delete absent");

    // A zero-op batch commits and consumes no sequence numbers.
    let before = db.snapshot().sequence();
    db.write(WriteBatch::new(), false).expect("empty batch");
    let after = db.snapshot().sequence();
    assert_eq!(before, after);
}

#[test]
fn test_sequences_start_at_one() {
    let (_dir, db) = open_default();
    db.put(b"a", b"1").expect("put");
    db.put(b"b", b"2").expect("put");
    db.put(b"c", b"3").expect("put");
    assert_eq!(db.snapshot().sequence(), 3);
}

#[test]
fn test_repeated_identical_puts_are_distinct_revisions() {
    let (_dir, db) = open_default();

    db.put(b"k", b"v").expect("first put");
    let snapshot = db.snapshot();
    db.put(b"k", b"v").expect("second put");

    // Both revisions are addressable until compaction collapses them.
    assert_eq!(db.snapshot().sequence(), 2);
    assert_eq!(
        db.get_at(b"k", Some(&snapshot)).expect("get"),
        Some(b"v".to_vec())
    );
    assert_eq!(value_of(&db, b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_reopen_preserves_state() {
    let dir = tempdir().expect("tempdir");
    {
        let db = Database::open(dir.path(), Options::default()).expect("open");
        db.put(b"persisted", b"yes").expect("put");
        db.delete(b"gone").expect("delete");
    }
    {
        let db = Database::open(dir.path(), Options::default()).expect("reopen");
        assert_eq!(value_of(&db, b"persisted"), Some(b"yes".to_vec()));
        assert_eq!(value_of(&db, b"gone"), None);

        // Sequences continue past the recovered history.
        db.put(b"more", b"data").expect("put after reopen");
        assert_eq!(value_of(&db, b"more"), Some(b"data".to_vec()));
    }
}

#[test]
fn test_reopen_after_flushes() {
    let dir = tempdir().expect("tempdir");
    let options = Options::default().write_buffer_size(16 * 1024);
    {
        let db = Database::open(dir.path(), options.clone()).expect("open");
        for i in 0..500 {
            let key = format!("key{i:05}");
            let value = format!("value{i:05}").repeat(10);
            db.put(key.as_bytes(), value.as_bytes()).expect("put");
        }
    }
    {
        let db = Database::open(dir.path(), options).expect("reopen");
        for i in 0..500 {
            let key = format!("key{i:05}");
            let expected = format!("value{i:05}").repeat(10);
            assert_eq!(
                value_of(&db, key.as_bytes()),
                Some(expected.into_bytes()),
                "missing {key} after reopen"
            );
        }
    }
}

#[test]
fn test_recovery_tolerates_torn_wal_tail() {
    let dir = tempdir().expect("tempdir");
    {
        let db = Database::open(dir.path(), Options::default()).expect("open");
        for i in 0..1000 {
            let key = format!("key{i:05}");
            db.put(key.as_bytes(), b"payload").expect("put");
        }
    }

    // Tear the tail of the newest WAL, as an interrupted write would.
    let mut logs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| {
            let name = e.unwrap().file_name().into_string().unwrap();
            name.strip_suffix(".log")
                .and_then(|stem| stem.parse::<u64>().ok())
                .map(|num| (num, name))
        })
        .collect();
    logs.sort();
    let (_, newest) = logs.last().expect("a wal exists");
    let path = dir.path().join(newest);
    let len = std::fs::metadata(&path).unwrap().len();
    assert!(len > 64);
    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 15)
        .unwrap();

    let db = Database::open(dir.path(), Options::default()).expect("reopen after tear");

    // Keys form a contiguous prefix: everything before the torn record
    // survived, nothing after it does.
    let mut highest_present: Option<usize> = None;
    let mut lowest_absent: Option<usize> = None;
    for i in 0..1000 {
        let key = format!("key{i:05}");
        match value_of(&db, key.as_bytes()) {
            Some(_) => {
                assert!(lowest_absent.is_none(), "hole before {key}");
                highest_present = Some(i);
            }
            None => lowest_absent = lowest_absent.or(Some(i)),
        }
    }
    let highest = highest_present.expect("some writes survived");
    assert!(highest >= 900, "lost too much: only {highest} keys survived");
}

#[test]
fn test_write_pressure_flushes_and_compacts() {
    let dir = tempdir().expect("tempdir");
    let options = Options::default().write_buffer_size(64 * 1024);
    let db = Database::open(dir.path(), options).expect("open");

    // Overwrite one key range repeatedly so levels overlap and compactions
    // must merge rather than just relocate.
    let mut keys: Vec<usize> = (0..2000).collect();
    keys.shuffle(&mut rand::thread_rng());
    for round in 0..3 {
        for &i in &keys {
            let key = format!("key{i:05}");
            let value = format!("round{round}-{i}").repeat(20);
            db.put(key.as_bytes(), value.as_bytes()).expect("put");

            let level0: usize = db
                .property("num-files-at-level0")
                .unwrap()
                .parse()
                .unwrap();
            assert!(level0 <= 12, "level-0 grew past the stop trigger: {level0}");
        }
    }

    for &i in &keys {
        let key = format!("key{i:05}");
        let expected = format!("round2-{i}").repeat(20);
        assert_eq!(
            value_of(&db, key.as_bytes()),
            Some(expected.into_bytes()),
            "wrong value for {key}"
        );
    }

    // Something must have left level 0.
    let deeper: usize = (1..7)
        .map(|l| {
            db.property(&format!("num-files-at-level{l}"))
                .unwrap()
                .parse::<usize>()
                .unwrap()
        })
        .sum();
    assert!(deeper > 0, "no files ever reached a deeper level");
}

#[test]
fn test_concurrent_writers_group_commit() {
    let (_dir, db) = open_default();
    let db = Arc::new(db);

    let mut handles = Vec::new();
    for t in 0..8 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            for i in 0..200 {
                let key = format!("t{t}-key{i:04}");
                let value = format!("t{t}-value{i:04}");
                db.put(key.as_bytes(), value.as_bytes()).expect("put");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("writer thread");
    }

    for t in 0..8 {
        for i in 0..200 {
            let key = format!("t{t}-key{i:04}");
            let expected = format!("t{t}-value{i:04}");
            assert_eq!(value_of(&db, key.as_bytes()), Some(expected.into_bytes()));
        }
    }
    // 1600 writes committed exactly once each.
    assert_eq!(db.snapshot().sequence(), 1600);
}

#[test]
fn test_seek_hotspot_triggers_compaction() {
    let dir = tempdir().expect("tempdir");
    let options = Options::default().write_buffer_size(16 * 1024);
    let db = Database::open(dir.path(), options).expect("open");

    // Layer 1, settled deep: the keys the reads will ask for.
    for i in 0..200 {
        let key = format!("key{i:04}");
        db.put(key.as_bytes(), format!("deep{i}").repeat(8).as_bytes())
            .expect("put");
    }
    db.compact_range(None, None).expect("settle");

    // Two more overlapping layers flushed above it, holding different keys
    // in the same user-key range.
    for (suffix, pad) in [("a", "mid"), ("b", "top")] {
        for i in 0..200 {
            let key = format!("key{i:04}{suffix}");
            db.put(key.as_bytes(), pad.repeat(30).as_bytes()).expect("put");
        }
        // Roll the memtable so the layer flushes above the settled data.
        for i in 0..400 {
            let key = format!("key{i:04}{suffix}");
            db.put(key.as_bytes(), pad.repeat(30).as_bytes()).expect("put");
        }
    }

    let files_before: usize = (0..7)
        .map(|l| {
            db.property(&format!("num-files-at-level{l}"))
                .unwrap()
                .parse::<usize>()
                .unwrap()
        })
        .sum();
    assert!(files_before > 0);

    // Hammer lookups that every upper file covers but only the deep layer
    // answers; each read bills the first file probed.
    for _ in 0..30 {
        for i in 0..200 {
            let key = format!("key{i:04}");
            let got = value_of(&db, key.as_bytes());
            assert_eq!(got, Some(format!("deep{i}").repeat(8).into_bytes()));
        }
    }

    // Give the background thread a moment to run the nominated compaction.
    std::thread::sleep(std::time::Duration::from_millis(300));

    for i in 0..200 {
        let key = format!("key{i:04}");
        assert_eq!(
            value_of(&db, key.as_bytes()),
            Some(format!("deep{i}").repeat(8).into_bytes())
        );
    }
}

#[test]
fn test_tombstones_are_collected_by_compaction() {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path(), Options::default()).expect("open");

    // Padding keys give the settled file a range that keeps later flushes
    // in the upper levels, where manual compaction will reach them.
    db.put(b"w", b"keep-w").expect("put");
    db.put(b"x", b"doomed").expect("put");
    db.put(b"y", b"keep-y").expect("put");
    db.compact_range(None, None).expect("settle");

    db.delete(b"x").expect("delete");
    db.compact_range(None, None).expect("compact tombstone");

    assert_eq!(value_of(&db, b"x"), None);
    assert_eq!(value_of(&db, b"w"), Some(b"keep-w".to_vec()));
    assert_eq!(value_of(&db, b"y"), Some(b"keep-y".to_vec()));

    // With no snapshots held, neither the value nor the tombstone survives
    // in any table file on disk.
    let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
    let mut tables_scanned = 0;
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().into_string().unwrap();
        if !name.ends_with(".ldb") {
            continue;
        }
        tables_scanned += 1;
        let size = entry.metadata().unwrap().len();
        let table = Arc::new(
            Table::open(&entry.path(), size, icmp.clone(), &Options::default())
                .expect("open table"),
        );
        for (internal_key, _) in table.iter() {
            let parsed = parse_internal_key(&internal_key).expect("parse");
            assert_ne!(parsed.user_key, b"x", "record for x survived in {name}");
        }
    }
    assert!(tables_scanned > 0, "expected at least one table on disk");
}

#[test]
fn test_approximate_sizes_grow_with_data() {
    let dir = tempdir().expect("tempdir");
    let options = Options::default().write_buffer_size(16 * 1024);
    let db = Database::open(dir.path(), options).expect("open");

    for i in 0..500 {
        let key = format!("key{i:04}");
        db.put(key.as_bytes(), &[0xab; 256]).expect("put");
    }
    db.compact_range(None, None).expect("settle");

    let sizes = db.approximate_sizes(&[
        (b"key0000", b"key0250"),
        (b"key0000", b"key0499"),
        (b"zzz0", b"zzz9"),
    ]);
    assert!(sizes[0] > 0, "non-empty range reports zero size");
    assert!(sizes[1] > sizes[0], "larger range not larger: {sizes:?}");
    assert_eq!(sizes[2], 0, "empty range reports data");
}

#[test]
fn test_iterator_is_immune_to_concurrent_writes() {
    let (_dir, db) = open_default();

    for i in 0..100 {
        let key = format!("key{i:03}");
        db.put(key.as_bytes(), b"before").expect("put");
    }

    let iter = db.iter(None).expect("iter");
    // Overwrite everything after the iterator was created.
    for i in 0..100 {
        let key = format!("key{i:03}");
        db.put(key.as_bytes(), b"after").expect("put");
    }

    for entry in iter {
        let (_, value) = entry.expect("entry");
        assert_eq!(value, b"before", "iterator observed a later write");
    }
}

#[test]
fn test_sync_write() {
    let (_dir, db) = open_default();
    let mut batch = WriteBatch::new();
    batch.put(b"durable", b"now");
    db.write(batch, true).expect("sync write");
    assert_eq!(value_of(&db, b"durable"), Some(b"now".to_vec()));
}
