use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::block::BlockBuilder;
use super::{BlockHandle, Footer, BLOCK_TRAILER_SIZE};
use crate::coding::put_fixed32;
use crate::config::{CompressionType, Options};
use crate::error::{Error, Result};
use crate::key;
use crate::wal::CRC32;

/// Builds a table file from a sorted stream of internal-key entries.
///
/// Data blocks are cut at `block_size`, each followed by a one-byte codec
/// tag and a CRC over contents plus tag. `finish` writes the optional filter
/// block, the index block (last key of each data block, in the clear, mapped
/// to its handle), and the footer, then fsyncs.
pub struct TableBuilder {
    writer: BufWriter<File>,
    block_size: usize,
    compression: CompressionType,
    filter_policy: Option<std::sync::Arc<dyn super::filter::FilterPolicy>>,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_keys: Vec<Vec<u8>>,

    last_key: Vec<u8>,
    num_entries: u64,
    offset: u64,
}

impl TableBuilder {
    pub fn new(path: &Path, options: &Options) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            block_size: options.block_size,
            compression: options.compression,
            filter_policy: options.filter_policy.clone(),
            data_block: BlockBuilder::new(options.block_restart_interval),
            // Index entries carry full keys.
            index_block: BlockBuilder::new(1),
            filter_keys: Vec::new(),
            last_key: Vec::new(),
            num_entries: 0,
            offset: 0,
        })
    }

    /// Appends an entry. Internal keys must arrive in increasing order.
    pub fn add(&mut self, internal_key: &[u8], value: &[u8]) -> Result<()> {
        if self.filter_policy.is_some() {
            self.filter_keys.push(key::user_key(internal_key).to_vec());
        }

        self.data_block.add(internal_key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(internal_key);
        self.num_entries += 1;

        if self.data_block.current_size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written plus the pending block, used to decide output splits.
    pub fn file_size_estimate(&self) -> u64 {
        self.offset + self.data_block.current_size_estimate() as u64
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let contents = self.data_block.finish();
        let handle = self.write_block(&contents, self.compression)?;
        self.index_block.add(&self.last_key, &handle.encode());
        Ok(())
    }

    /// Writes `contents | codec:u8 | crc:u32` and returns the handle.
    fn write_block(&mut self, contents: &[u8], compression: CompressionType) -> Result<BlockHandle> {
        let (payload, codec): (std::borrow::Cow<[u8]>, u8) = match compression {
            CompressionType::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(contents)
                    .map_err(|e| Error::Corruption(format!("snappy compression: {e}")))?;
                // Keep the raw bytes unless compression actually pays.
                if compressed.len() < contents.len() - contents.len() / 8 {
                    (compressed.into(), CompressionType::Snappy as u8)
                } else {
                    (contents.into(), CompressionType::None as u8)
                }
            }
            CompressionType::None => (contents.into(), CompressionType::None as u8),
        };

        let mut digest = CRC32.digest();
        digest.update(&payload);
        digest.update(&[codec]);
        let crc = digest.finalize();

        let handle = BlockHandle {
            offset: self.offset,
            size: payload.len() as u64,
        };

        self.writer.write_all(&payload)?;
        let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
        trailer.push(codec);
        put_fixed32(&mut trailer, crc);
        self.writer.write_all(&trailer)?;

        self.offset += handle.size + BLOCK_TRAILER_SIZE as u64;
        Ok(handle)
    }

    /// Flushes the final block, writes filter, index, and footer, fsyncs, and
    /// returns the file size.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_data_block()?;

        let filter_handle = match &self.filter_policy {
            Some(policy) => {
                let filter = policy.create_filter(&self.filter_keys);
                // Filters are probed bitwise; compressing them buys nothing.
                Some(self.write_block(&filter, CompressionType::None)?)
            }
            None => None,
        };

        let index_contents = self.index_block.finish();
        let index_handle = self.write_block(&index_contents, self.compression)?;

        let footer = Footer {
            filter_handle: filter_handle.unwrap_or(BlockHandle { offset: 0, size: 0 }),
            index_handle,
        };
        self.writer.write_all(&footer.encode())?;
        self.offset += super::FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.offset)
    }
}
