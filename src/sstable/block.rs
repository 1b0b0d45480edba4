//! Table block format.
//!
//! A block is a run of prefix-compressed entries followed by a restart
//! array:
//!
//! ```text
//! entry*   restart_offset:u32 LE *   num_restarts:u32 LE
//! entry := shared:varint32 | non_shared:varint32 | value_len:varint32
//!          | key suffix | value
//! ```
//!
//! Every `restart_interval`-th entry stores its full key (`shared = 0`);
//! entries in between share a prefix with their predecessor. Seeks binary
//! search the restart points, then scan forward.

use std::sync::Arc;

use crate::coding::{decode_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::error::{Error, Result};
use crate::key::InternalKeyComparator;

/// Accumulates sorted entries into a serialized block.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    count_since_restart: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            restart_interval: restart_interval.max(1),
            buffer: Vec::new(),
            restarts: vec![0],
            count_since_restart: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.count_since_restart < self.restart_interval {
            shared_prefix_len(&self.last_key, key)
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.count_since_restart = 0;
            0
        };

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, (key.len() - shared) as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.count_since_restart += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Serialized size if finished now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Appends the restart array and returns the block contents, leaving the
    /// builder reset for the next block.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut block = std::mem::take(&mut self.buffer);
        for &restart in &self.restarts {
            put_fixed32(&mut block, restart);
        }
        put_fixed32(&mut block, self.restarts.len() as u32);

        self.restarts.clear();
        self.restarts.push(0);
        self.count_since_restart = 0;
        self.last_key.clear();
        block
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// An immutable, parsed block.
pub struct Block {
    data: Vec<u8>,
    restarts_offset: usize,
    num_restarts: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("block too short".to_string()));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]) as usize;
        let restarts_size = num_restarts
            .checked_mul(4)
            .and_then(|s| s.checked_add(4))
            .ok_or_else(|| Error::Corruption("block restart count overflow".to_string()))?;
        if num_restarts == 0 || restarts_size > data.len() {
            return Err(Error::Corruption(
                "block restart array out of bounds".to_string(),
            ));
        }
        let restarts_offset = data.len() - restarts_size;
        Ok(Self {
            data,
            restarts_offset,
            num_restarts,
        })
    }

    fn restart_point(&self, index: usize) -> usize {
        decode_fixed32(&self.data[self.restarts_offset + index * 4..]) as usize
    }

    pub fn iter(self: &Arc<Self>, cmp: InternalKeyComparator) -> BlockIter {
        BlockIter {
            block: Arc::clone(self),
            cmp,
            next_offset: 0,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            valid: false,
            status: Ok(()),
        }
    }
}

/// Cursor over a block's entries.
pub struct BlockIter {
    block: Arc<Block>,
    cmp: InternalKeyComparator,
    next_offset: usize,
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    valid: bool,
    status: Result<()>,
}

impl BlockIter {
    pub fn seek_to_first(&mut self) {
        self.key.clear();
        self.next_offset = 0;
        self.valid = true;
        self.advance();
    }

    /// Positions at the first entry with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        // Binary search the restarts for the last point whose key < target.
        let mut left = 0;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.restart_key(mid) {
                Ok(key) => {
                    if self.cmp.compare(&key, target) == std::cmp::Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                Err(e) => {
                    self.corrupt(e);
                    return;
                }
            }
        }

        self.key.clear();
        self.next_offset = self.block.restart_point(left);
        self.valid = true;
        loop {
            self.advance();
            if !self.valid || self.cmp.compare(&self.key, target) != std::cmp::Ordering::Less {
                break;
            }
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);
        self.advance();
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    /// Decodes the full key stored at a restart point.
    fn restart_key(&self, index: usize) -> Result<Vec<u8>> {
        let offset = self.block.restart_point(index);
        let data = &self.block.data[..self.block.restarts_offset];
        let (shared, a) = get_varint32(&data[offset..])?;
        let (non_shared, b) = get_varint32(&data[offset + a..])?;
        let (_, c) = get_varint32(&data[offset + a + b..])?;
        if shared != 0 {
            return Err(Error::Corruption(
                "restart entry shares a prefix".to_string(),
            ));
        }
        let start = offset + a + b + c;
        let end = start + non_shared as usize;
        if end > data.len() {
            return Err(Error::Corruption("restart key out of bounds".to_string()));
        }
        Ok(data[start..end].to_vec())
    }

    fn advance(&mut self) {
        let data_end = self.block.restarts_offset;
        if self.next_offset >= data_end {
            self.valid = false;
            return;
        }
        let data = &self.block.data[..data_end];
        let offset = self.next_offset;

        let parsed = (|| -> Result<(usize, usize, usize, usize)> {
            let (shared, a) = get_varint32(&data[offset..])?;
            let (non_shared, b) = get_varint32(&data[offset + a..])?;
            let (value_len, c) = get_varint32(&data[offset + a + b..])?;
            let suffix_start = offset + a + b + c;
            let value_start = suffix_start + non_shared as usize;
            let next = value_start + value_len as usize;
            if shared as usize > self.key.len() || next > data_end {
                return Err(Error::Corruption("block entry out of bounds".to_string()));
            }
            Ok((shared as usize, suffix_start, value_start, next))
        })();

        match parsed {
            Ok((shared, suffix_start, value_start, next)) => {
                self.key.truncate(shared);
                self.key.extend_from_slice(&data[suffix_start..value_start]);
                self.value_start = value_start;
                self.value_len = next - value_start;
                self.next_offset = next;
                self.valid = true;
            }
            Err(e) => self.corrupt(e),
        }
    }

    fn corrupt(&mut self, e: Error) {
        self.valid = false;
        self.status = Err(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::{make_internal_key, ValueType};

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Arc::new(Block::new(builder.finish()).expect("parse built block"))
    }

    fn ikey(user: &[u8], seq: u64) -> Vec<u8> {
        make_internal_key(user, seq, ValueType::Value)
    }

    #[test]
    fn test_scan_recovers_entries() {
        let keys: Vec<Vec<u8>> = (0..40).map(|i| ikey(format!("key{i:03}").as_bytes(), 1)).collect();
        let entries: Vec<(&[u8], &[u8])> =
            keys.iter().map(|k| (k.as_slice(), b"value".as_slice())).collect();
        let block = build_block(&entries, 4);

        let mut iter = block.iter(icmp());
        iter.seek_to_first();
        for expected in &keys {
            assert!(iter.valid());
            assert_eq!(iter.key(), expected.as_slice());
            assert_eq!(iter.value(), b"value");
            iter.next();
        }
        assert!(!iter.valid());
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_seek_lands_on_first_key_at_or_after_target() {
        let k10 = ikey(b"k10", 1);
        let k20 = ikey(b"k20", 1);
        let k30 = ikey(b"k30", 1);
        let block = build_block(
            &[(k10.as_slice(), b"a"), (k20.as_slice(), b"b"), (k30.as_slice(), b"c")],
            2,
        );

        let mut iter = block.iter(icmp());

        iter.seek(&ikey(b"k20", 1));
        assert!(iter.valid());
        assert_eq!(iter.key(), k20.as_slice());

        iter.seek(&ikey(b"k15", 1));
        assert!(iter.valid());
        assert_eq!(iter.key(), k20.as_slice());

        iter.seek(&ikey(b"k05", 1));
        assert!(iter.valid());
        assert_eq!(iter.key(), k10.as_slice());

        iter.seek(&ikey(b"k99", 1));
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_respects_sequence_order() {
        // Newer revisions of the same user key sort first.
        let newer = ikey(b"k", 9);
        let older = ikey(b"k", 3);
        let block = build_block(&[(newer.as_slice(), b"new"), (older.as_slice(), b"old")], 16);

        let mut iter = block.iter(icmp());
        iter.seek(&ikey(b"k", 5));
        assert!(iter.valid());
        assert_eq!(iter.key(), older.as_slice(), "seek at seq 5 skips the seq 9 entry");
    }

    #[test]
    fn test_prefix_compression_restores_keys() {
        let keys: Vec<Vec<u8>> = (0..10)
            .map(|i| ikey(format!("shared_prefix_{i}").as_bytes(), 1))
            .collect();
        let entries: Vec<(&[u8], &[u8])> =
            keys.iter().map(|k| (k.as_slice(), b"v".as_slice())).collect();
        let block = build_block(&entries, 3);

        let mut iter = block.iter(icmp());
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(seen, keys);
    }

    #[test]
    fn test_garbage_block_rejected() {
        assert!(Block::new(vec![]).is_err());
        assert!(Block::new(vec![0xff; 3]).is_err());
        // Restart count pointing past the data.
        let mut data = vec![0u8; 4];
        put_fixed32(&mut data, 100);
        assert!(Block::new(data).is_err());
    }

    #[test]
    fn test_builder_size_estimate_and_reset() {
        let mut builder = BlockBuilder::new(16);
        assert!(builder.is_empty());
        let key = ikey(b"key", 1);
        builder.add(&key, b"value");
        assert!(builder.current_size_estimate() > key.len() + 5);

        let first = builder.finish();
        assert!(builder.is_empty());
        builder.add(&key, b"value");
        let second = builder.finish();
        assert_eq!(first, second, "builder state leaks across finish");
    }
}
