//! Write-ahead log record framing.
//!
//! Log files (both WALs and manifests) are sequences of 32KiB blocks. A
//! record is stored as one or more fragments, each with a 7-byte header:
//!
//! ```text
//! +------------+---------------+----------+------------------+
//! | crc u32 LE | length u16 LE | type u8  | payload (length) |
//! +------------+---------------+----------+------------------+
//! ```
//!
//! A record that fits the current block is written as a single FULL
//! fragment; otherwise it is split FIRST, MIDDLE..., LAST across blocks.
//! Block tails shorter than a header are zero-padded. The CRC covers the
//! type byte and payload, so a torn write is detected on replay.
//!
//! The reader reassembles fragments and treats an incomplete tail as a clean
//! end of the log: everything before the last complete record survives a
//! crash. CRC mismatches are reported as corruption and left to the caller,
//! who decides fatality via `paranoid_checks`.

pub mod reader;
pub mod writer;

pub use reader::LogReader;
pub use writer::LogWriter;

use crc::{Crc, CRC_32_ISCSI};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Size of one log block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Fragment header: crc, length, type.
pub const HEADER_SIZE: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

pub(crate) fn fragment_crc(record_type: u8, payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&[record_type]);
    digest.update(payload);
    digest.finalize()
}
