//! An embedded, single-writer, ordered key/value storage engine on the
//! log-structured merge-tree design.
//!
//! One process opens one directory exclusively and drives all access through
//! a [`Database`] handle, which is safe to share across threads. Writes are
//! grouped and committed through a write-ahead log, buffered in an in-memory
//! table, and flushed into immutable sorted table files organized in levels;
//! a single background thread folds levels together as they fill.
//!
//! ```no_run
//! use tephradb::{Database, Options};
//!
//! let db = Database::open("/tmp/demo-db", Options::default())?;
//! db.put(b"name", b"tephra")?;
//! assert_eq!(db.get(b"name")?, Some(b"tephra".to_vec()));
//!
//! let snapshot = db.snapshot();
//! db.delete(b"name")?;
//! assert_eq!(db.get(b"name")?, None);
//! assert_eq!(db.get_at(b"name", Some(&snapshot))?, Some(b"tephra".to_vec()));
//! db.release_snapshot(snapshot);
//! # Ok::<(), tephradb::Error>(())
//! ```

pub mod batch;
pub mod coding;
pub mod comparator;
pub mod config;
pub mod db;
pub mod error;
pub mod filename;
pub mod flock;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod snapshot;
pub mod sstable;
pub mod table_cache;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use comparator::{BytewiseComparator, Comparator};
pub use config::{CompressionType, Options};
pub use db::Database;
pub use error::{Error, Result};
pub use iterator::DbIterator;
pub use snapshot::Snapshot;
pub use sstable::filter::{BloomFilterPolicy, FilterPolicy};
