//! Atomic multi-key writes.
//!
//! A batch commits as a unit: either every operation becomes visible at
//! consecutive sequence numbers, or none does. On the wire (one WAL record
//! per committed group) a batch is:
//!
//! ```text
//! +-----------------+--------------+----------------------------------+
//! | sequence u64 LE | count u32 LE | ops: tag u8, lenprefix key[, val] |
//! +-----------------+--------------+----------------------------------+
//! ```
//!
//! where the tag is the value type (1 put, 0 delete) and the prefixes are
//! varint32 lengths.

use crate::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed, put_fixed32, put_fixed64,
    put_length_prefixed,
};
use crate::error::{Error, Result};
use crate::key::{SequenceNumber, ValueType};
use crate::memtable::MemTable;

/// Wire header: sequence plus count.
pub const BATCH_HEADER_SIZE: usize = 12;

// Per-entry contributions to the approximate size. These feed the group
// commit caps only; the estimate intentionally undercounts varint overhead.
const PUT_OVERHEAD: usize = 12;
const DELETE_OVERHEAD: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered sequence of put/delete operations applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    approximate_size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an insert or overwrite of `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.approximate_size += PUT_OVERHEAD + key.len() + value.len();
        self.ops.push(BatchOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    /// Queues a tombstone for `key`. Deleting an absent key is legal.
    pub fn delete(&mut self, key: &[u8]) {
        self.approximate_size += DELETE_OVERHEAD + key.len();
        self.ops.push(BatchOp::Delete { key: key.to_vec() });
    }

    /// Number of queued operations.
    pub fn count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Rough byte size, used to bound group commits.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    /// Removes all queued operations.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.approximate_size = 0;
    }

    /// Appends every operation of `other`, preserving order.
    pub fn append(&mut self, other: &WriteBatch) {
        self.ops.extend(other.ops.iter().cloned());
        self.approximate_size += other.approximate_size;
    }

    pub(crate) fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Serializes the batch with its starting sequence number into the WAL
    /// record payload format.
    pub fn encode(&self, sequence: SequenceNumber) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BATCH_HEADER_SIZE + self.approximate_size);
        put_fixed64(&mut buf, sequence);
        put_fixed32(&mut buf, self.ops.len() as u32);
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => {
                    buf.push(ValueType::Value as u8);
                    put_length_prefixed(&mut buf, key);
                    put_length_prefixed(&mut buf, value);
                }
                BatchOp::Delete { key } => {
                    buf.push(ValueType::Deletion as u8);
                    put_length_prefixed(&mut buf, key);
                }
            }
        }
        buf
    }

    /// Parses a WAL record payload back into a batch and its starting
    /// sequence number.
    pub fn decode(data: &[u8]) -> Result<(SequenceNumber, WriteBatch)> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "batch record shorter than header: {} bytes",
                data.len()
            )));
        }
        let sequence = decode_fixed64(data);
        let count = decode_fixed32(&data[8..]) as usize;

        let mut batch = WriteBatch::new();
        let mut pos = BATCH_HEADER_SIZE;
        for _ in 0..count {
            if pos >= data.len() {
                return Err(Error::Corruption("batch record truncated".to_string()));
            }
            let tag = ValueType::from_u8(data[pos])?;
            pos += 1;
            let (key, n) = get_length_prefixed(&data[pos..])?;
            pos += n;
            match tag {
                ValueType::Value => {
                    let (value, n) = get_length_prefixed(&data[pos..])?;
                    pos += n;
                    batch.put(key, value);
                }
                ValueType::Deletion => batch.delete(key),
            }
        }
        if pos != data.len() {
            return Err(Error::Corruption(format!(
                "batch record has {} trailing bytes",
                data.len() - pos
            )));
        }
        Ok((sequence, batch))
    }

    /// Applies the batch to a memtable, stamping operations with consecutive
    /// sequence numbers starting at `sequence`.
    pub fn insert_into(&self, sequence: SequenceNumber, mem: &MemTable) {
        let mut seq = sequence;
        for op in &self.ops {
            match op {
                BatchOp::Put { key, value } => mem.add(seq, ValueType::Value, key, value),
                BatchOp::Delete { key } => mem.add(seq, ValueType::Deletion, key, &[]),
            }
            seq += 1;
        }
    }
}
