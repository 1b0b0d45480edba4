use std::fs::File;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use super::{fragment_crc, BLOCK_SIZE, HEADER_SIZE};
use crate::error::{Error, Result};

/// Reads framed records back from a log file.
///
/// Fragments are reassembled into records. An incomplete tail (a short
/// header, a fragment cut off mid-payload, or an unfinished FIRST/MIDDLE
/// chain at end of file) ends iteration with `Ok(None)`: that is the torn
/// write of a crash, and everything before it is intact. A checksum or
/// framing violation inside the file is returned as `Corruption`.
pub struct LogReader {
    file: File,
    block: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl LogReader {
    pub fn new(file: File) -> Self {
        Self {
            file,
            block: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Returns the next complete record, or `None` at the end of the log.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembled: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            if self.pos + HEADER_SIZE > self.block.len() {
                if !self.refill()? {
                    // End of file. A dangling FIRST/MIDDLE chain is a torn
                    // tail and is dropped.
                    return Ok(None);
                }
                continue;
            }

            let mut header = Cursor::new(&self.block[self.pos..self.pos + HEADER_SIZE]);
            let crc = header.read_u32::<LittleEndian>()?;
            let length = header.read_u16::<LittleEndian>()? as usize;
            let record_type = header.read_u8()?;

            if record_type == 0 && length == 0 && crc == 0 {
                // Zero fill: block padding or the unwritten tail of a crash.
                self.pos = self.block.len();
                continue;
            }

            if self.pos + HEADER_SIZE + length > self.block.len() {
                if self.block.len() < BLOCK_SIZE {
                    // Fragment torn by a crash mid-write.
                    return Ok(None);
                }
                return Err(Error::Corruption(
                    "log fragment length exceeds block".to_string(),
                ));
            }

            let payload_start = self.pos + HEADER_SIZE;
            let payload = &self.block[payload_start..payload_start + length];

            if fragment_crc(record_type, payload) != crc {
                return Err(Error::Corruption("log fragment crc mismatch".to_string()));
            }

            let payload = payload.to_vec();
            self.pos = payload_start + length;

            match record_type {
                1 => {
                    // FULL
                    if in_fragmented_record {
                        return Err(Error::Corruption(
                            "FULL fragment inside fragmented record".to_string(),
                        ));
                    }
                    return Ok(Some(payload));
                }
                2 => {
                    // FIRST
                    if in_fragmented_record {
                        return Err(Error::Corruption(
                            "FIRST fragment inside fragmented record".to_string(),
                        ));
                    }
                    assembled.extend_from_slice(&payload);
                    in_fragmented_record = true;
                }
                3 => {
                    // MIDDLE
                    if !in_fragmented_record {
                        return Err(Error::Corruption(
                            "MIDDLE fragment without FIRST".to_string(),
                        ));
                    }
                    assembled.extend_from_slice(&payload);
                }
                4 => {
                    // LAST
                    if !in_fragmented_record {
                        return Err(Error::Corruption(
                            "LAST fragment without FIRST".to_string(),
                        ));
                    }
                    assembled.extend_from_slice(&payload);
                    return Ok(Some(assembled));
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown log fragment type: {other}"
                    )));
                }
            }
        }
    }

    /// Loads the next block. Returns false at end of file.
    fn refill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        self.block.clear();
        self.block.resize(BLOCK_SIZE, 0);
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.block[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.block.truncate(filled);
        self.pos = 0;
        Ok(filled > 0)
    }
}
