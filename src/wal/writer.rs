use std::fs::File;
use std::io::{BufWriter, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use super::{fragment_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::error::Result;

/// Appends framed records to a log file.
///
/// Writes are buffered; nothing is durable until [`LogWriter::sync`]. The
/// engine syncs per write only when the caller asked for it.
pub struct LogWriter {
    writer: BufWriter<File>,
    block_offset: usize,
}

impl LogWriter {
    pub fn new(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
            block_offset: 0,
        }
    }

    /// Appends one record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let mut left = record;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too small for a header: pad out the block.
                if leftover > 0 {
                    self.writer.write_all(&[0u8; HEADER_SIZE][..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(available);
            let end = fragment_len == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true) => RecordType::Last,
            };

            self.emit_fragment(record_type, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;
            if end {
                break;
            }
        }
        Ok(())
    }

    fn emit_fragment(&mut self, record_type: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        let crc = fragment_crc(record_type as u8, payload);

        self.writer.write_u32::<LittleEndian>(crc)?;
        self.writer.write_u16::<LittleEndian>(payload.len() as u16)?;
        self.writer.write_u8(record_type as u8)?;
        self.writer.write_all(payload)?;

        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }

    /// Pushes buffered bytes to the OS.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs, making every appended record durable.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}
