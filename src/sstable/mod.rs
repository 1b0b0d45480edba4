//! Sorted table files.
//!
//! Layout: data blocks, an optional filter block, an index block, and a
//! fixed-size footer naming the filter and index handles. Entries are
//! internal keys; the index maps each data block's last key to its handle.

pub mod block;
pub mod builder;
pub mod filter;

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use block::{Block, BlockIter};
pub use builder::TableBuilder;

use crate::coding::{decode_fixed32, decode_fixed64, get_varint64, put_fixed64, put_varint64};
use crate::config::{CompressionType, Options};
use crate::error::{Error, Result};
use crate::key::{self, InternalKeyComparator};
use crate::wal::CRC32;

/// Codec tag plus CRC appended to every block.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Two maximal varint64 handles padded to 40 bytes, plus the magic.
pub const FOOTER_SIZE: usize = 48;

const TABLE_MAGIC: u64 = 0xa91e_64d5_c2f0_93b7;

/// Location of a block within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        put_varint64(&mut buf, self.offset);
        put_varint64(&mut buf, self.size);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let (offset, a) = get_varint64(data)?;
        let (size, b) = get_varint64(&data[a..])?;
        Ok((Self { offset, size }, a + b))
    }
}

/// Table footer: filter handle, index handle, zero padding, magic.
#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub filter_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        buf.extend_from_slice(&self.filter_handle.encode());
        buf.extend_from_slice(&self.index_handle.encode());
        buf.resize(FOOTER_SIZE - 8, 0);
        put_fixed64(&mut buf, TABLE_MAGIC);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(Error::Corruption("table footer too short".to_string()));
        }
        let magic = decode_fixed64(&data[FOOTER_SIZE - 8..]);
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption("not a table file (bad magic)".to_string()));
        }
        let (filter_handle, n) = BlockHandle::decode(data)?;
        let (index_handle, _) = BlockHandle::decode(&data[n..])?;
        Ok(Self {
            filter_handle,
            index_handle,
        })
    }
}

/// An open, immutable table file.
pub struct Table {
    file: File,
    icmp: InternalKeyComparator,
    verify_checksums: bool,
    filter_policy: Option<Arc<dyn filter::FilterPolicy>>,
    filter: Option<Vec<u8>>,
    index_block: Arc<Block>,
    file_size: u64,
}

impl Table {
    pub fn open(
        path: &Path,
        file_size: u64,
        icmp: InternalKeyComparator,
        options: &Options,
    ) -> Result<Table> {
        let file = File::open(path)?;
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "table file shorter than footer: {file_size} bytes"
            )));
        }

        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer_buf, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        // The index is load-bearing; verify it regardless of options.
        let index_data = read_block(&file, footer.index_handle, true)?;
        let index_block = Arc::new(Block::new(index_data)?);

        let filter = match (&options.filter_policy, footer.filter_handle.size) {
            (Some(_), size) if size > 0 => Some(read_block(&file, footer.filter_handle, true)?),
            _ => None,
        };

        Ok(Table {
            file,
            icmp,
            verify_checksums: options.paranoid_checks,
            filter_policy: options.filter_policy.clone(),
            filter,
            index_block,
            file_size,
        })
    }

    /// Finds the first entry with internal key >= `ikey`, if any. The caller
    /// inspects the returned key to decide whether it answers the lookup.
    pub fn get(&self, ikey: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index_block.iter(self.icmp.clone());
        index_iter.seek(ikey);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        if let (Some(policy), Some(filter)) = (&self.filter_policy, &self.filter) {
            if !policy.key_may_match(key::user_key(ikey), filter) {
                return Ok(None);
            }
        }

        let (handle, _) = BlockHandle::decode(index_iter.value())?;
        let block = Arc::new(Block::new(read_block(
            &self.file,
            handle,
            self.verify_checksums,
        )?)?);
        let mut block_iter = block.iter(self.icmp.clone());
        block_iter.seek(ikey);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }
        Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
    }

    /// Byte offset within the file where `ikey` would live. Used by size
    /// estimation only.
    pub fn approximate_offset_of(&self, ikey: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.icmp.clone());
        index_iter.seek(ikey);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode(index_iter.value()) {
                return handle.offset;
            }
        }
        // Past every block: about the end of data.
        self.file_size
    }

    pub fn iter(self: &Arc<Self>) -> TableIter {
        let mut index_iter = self.index_block.iter(self.icmp.clone());
        index_iter.seek_to_first();
        TableIter {
            table: Arc::clone(self),
            index_iter,
            data_iter: None,
            status: Ok(()),
        }
    }

    fn load_block(&self, handle: BlockHandle) -> Result<BlockIter> {
        let block = Arc::new(Block::new(read_block(
            &self.file,
            handle,
            self.verify_checksums,
        )?)?);
        let mut iter = block.iter(self.icmp.clone());
        iter.seek_to_first();
        Ok(iter)
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("size", &self.file_size).finish()
    }
}

/// Reads and decodes one block: contents | codec | crc.
fn read_block(file: &File, handle: BlockHandle, verify_checksum: bool) -> Result<Vec<u8>> {
    let len = handle.size as usize + BLOCK_TRAILER_SIZE;
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, handle.offset)?;

    let codec = buf[handle.size as usize];
    if verify_checksum {
        let stored = decode_fixed32(&buf[handle.size as usize + 1..]);
        let computed = CRC32.checksum(&buf[..handle.size as usize + 1]);
        if stored != computed {
            return Err(Error::Corruption("block checksum mismatch".to_string()));
        }
    }
    buf.truncate(handle.size as usize);

    match CompressionType::from_u8(codec) {
        Some(CompressionType::None) => Ok(buf),
        Some(CompressionType::Snappy) => snap::raw::Decoder::new()
            .decompress_vec(&buf)
            .map_err(|e| Error::Corruption(format!("snappy decompression: {e}"))),
        None => Err(Error::Corruption(format!("unknown block codec: {codec}"))),
    }
}

/// Forward iterator over every entry of a table, in internal-key order.
pub struct TableIter {
    table: Arc<Table>,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    status: Result<()>,
}

impl TableIter {
    /// Loads data blocks until one yields an entry or the index is drained.
    fn skip_to_nonempty_block(&mut self) {
        loop {
            if self
                .data_iter
                .as_ref()
                .map(|it| it.valid())
                .unwrap_or(false)
            {
                return;
            }
            if let Some(it) = &self.data_iter {
                if let Err(e) = it.status() {
                    self.status = Err(e);
                    self.data_iter = None;
                    return;
                }
            }
            if !self.index_iter.valid() {
                if let Err(e) = self.index_iter.status() {
                    self.status = Err(e);
                }
                self.data_iter = None;
                return;
            }
            let handle = match BlockHandle::decode(self.index_iter.value()) {
                Ok((handle, _)) => handle,
                Err(e) => {
                    self.status = Err(e);
                    self.data_iter = None;
                    return;
                }
            };
            self.index_iter.next();
            match self.table.load_block(handle) {
                Ok(iter) => self.data_iter = Some(iter),
                Err(e) => {
                    self.status = Err(e);
                    self.data_iter = None;
                    return;
                }
            }
        }
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }
}

impl Iterator for TableIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.status.is_err() {
            return None;
        }
        self.skip_to_nonempty_block();
        let iter = self.data_iter.as_mut()?;
        let entry = (iter.key().to_vec(), iter.value().to_vec());
        iter.next();
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::filter::BloomFilterPolicy;
    use crate::comparator::BytewiseComparator;
    use crate::key::{make_internal_key, parse_internal_key, LookupKey, ValueType};
    use tempfile::tempdir;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn build_table(options: &Options, entries: &[(Vec<u8>, Vec<u8>)]) -> (tempfile::TempDir, Arc<Table>) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("000001.ldb");

        let mut builder = TableBuilder::new(&path, options).expect("builder");
        for (key, value) in entries {
            builder.add(key, value).expect("add");
        }
        let size = builder.finish().expect("finish");
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());

        let table = Table::open(&path, size, icmp(), options).expect("open");
        (dir, Arc::new(table))
    }

    fn sample_entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    make_internal_key(format!("key{i:05}").as_bytes(), 1, ValueType::Value),
                    format!("value{i}").into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_build_and_scan() {
        let options = Options::default().block_size(256);
        let entries = sample_entries(500);
        let (_dir, table) = build_table(&options, &entries);

        let scanned: Vec<_> = table.iter().collect();
        assert_eq!(scanned, entries);
    }

    #[test]
    fn test_point_get() {
        let options = Options::default().block_size(256);
        let entries = sample_entries(200);
        let (_dir, table) = build_table(&options, &entries);

        let lookup = LookupKey::new(b"key00123", 5);
        let (found_key, found_value) = table
            .get(lookup.internal_key())
            .expect("get")
            .expect("entry present");
        let parsed = parse_internal_key(&found_key).unwrap();
        assert_eq!(parsed.user_key, b"key00123");
        assert_eq!(found_value, b"value123");

        // A key past the end finds nothing.
        let lookup = LookupKey::new(b"zzz", 5);
        assert!(table.get(lookup.internal_key()).expect("get").is_none());
    }

    #[test]
    fn test_uncompressed_tables() {
        let options = Options::default()
            .block_size(128)
            .compression(CompressionType::None);
        let entries = sample_entries(100);
        let (_dir, table) = build_table(&options, &entries);
        let scanned: Vec<_> = table.iter().collect();
        assert_eq!(scanned, entries);
    }

    #[test]
    fn test_bloom_filter_passes_present_keys() {
        let options = Options::default()
            .block_size(256)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10)));
        let entries = sample_entries(300);
        let (_dir, table) = build_table(&options, &entries);

        for i in (0..300).step_by(17) {
            let lookup = LookupKey::new(format!("key{i:05}").as_bytes(), 5);
            assert!(
                table.get(lookup.internal_key()).expect("get").is_some(),
                "key{i:05} filtered out"
            );
        }
    }

    #[test]
    fn test_corrupt_footer_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("000001.ldb");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(Table::open(&path, 100, icmp(), &Options::default()).is_err());
    }

    #[test]
    fn test_corrupt_block_detected_under_paranoid_checks() {
        let options = Options::default()
            .block_size(128)
            .compression(CompressionType::None)
            .paranoid_checks(true);
        let entries = sample_entries(100);

        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("000001.ldb");
        let mut builder = TableBuilder::new(&path, &options).expect("builder");
        for (key, value) in &entries {
            builder.add(key, value).expect("add");
        }
        let size = builder.finish().expect("finish");

        // Flip a byte in the first data block.
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&[0xff]).unwrap();
        drop(file);

        let table = Arc::new(Table::open(&path, size, icmp(), &options).expect("open"));
        let lookup = LookupKey::new(b"key00000", 5);
        assert!(table.get(lookup.internal_key()).is_err());
    }
}
