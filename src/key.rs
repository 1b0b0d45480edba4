//! Internal key encoding.
//!
//! Every entry in the engine carries an internal key: the user key followed
//! by an 8-byte little-endian trailer packing a 56-bit sequence number and a
//! one-byte value type:
//!
//! ```text
//! +----------------+---------------------------------+
//! | user key (var) | (sequence << 8 | type) u64 LE   |
//! +----------------+---------------------------------+
//! ```
//!
//! Internal keys order by ascending user key, then descending sequence, then
//! descending type, so the newest revision of a user key sorts first.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::coding::{decode_fixed64, put_fixed64};
use crate::comparator::Comparator;
use crate::error::{Error, Result};

/// Commit stamp assigned to every operation. Only the low 56 bits are used;
/// the top byte of the trailer holds the value type.
pub type SequenceNumber = u64;

/// Largest representable sequence number.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Size of the (sequence, type) trailer.
pub const TRAILER_SIZE: usize = 8;

/// Discriminates live values from tombstones. Deletion is zero so that at
/// equal sequence a value sorts before (is seen before) a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Deletion = 0x0,
    Value = 0x1,
}

impl ValueType {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(ValueType::Deletion),
            0x1 => Ok(ValueType::Value),
            _ => Err(Error::Corruption(format!("invalid value type: {byte}"))),
        }
    }
}

/// Packs sequence and type into the u64 trailer.
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// Appends `user_key` plus trailer to `buf`.
pub fn append_internal_key(
    buf: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    buf.extend_from_slice(user_key);
    put_fixed64(buf, pack_sequence_and_type(sequence, value_type));
}

/// Builds an owned internal key.
pub fn make_internal_key(
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + TRAILER_SIZE);
    append_internal_key(&mut buf, user_key, sequence, value_type);
    buf
}

/// The user-key portion of an encoded internal key.
pub fn user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= TRAILER_SIZE);
    &internal_key[..internal_key.len() - TRAILER_SIZE]
}

/// An internal key split into its parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

/// Splits an encoded internal key. Fails on short keys or unknown types.
pub fn parse_internal_key(internal_key: &[u8]) -> Result<ParsedInternalKey<'_>> {
    if internal_key.len() < TRAILER_SIZE {
        return Err(Error::Corruption(format!(
            "internal key too short: {} bytes",
            internal_key.len()
        )));
    }
    let split = internal_key.len() - TRAILER_SIZE;
    let trailer = decode_fixed64(&internal_key[split..]);
    let value_type = ValueType::from_u8((trailer & 0xff) as u8)?;
    Ok(ParsedInternalKey {
        user_key: &internal_key[..split],
        sequence: trailer >> 8,
        value_type,
    })
}

/// A key positioned for a point lookup at a snapshot: the internal key with
/// trailer `(snapshot, Value)`, which sorts at or before every revision of
/// the user key visible at that snapshot.
pub struct LookupKey {
    key: Vec<u8>,
    user_len: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], snapshot: SequenceNumber) -> Self {
        Self {
            key: make_internal_key(user_key, snapshot, ValueType::Value),
            user_len: user_key.len(),
        }
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.key
    }

    pub fn user_key(&self) -> &[u8] {
        &self.key[..self.user_len]
    }
}

/// Orders encoded internal keys: user key ascending per the user comparator,
/// then trailer descending (newest revision first).
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(user_key(a), user_key(b)) {
            Ordering::Equal => {
                let ta = decode_fixed64(&a[a.len() - TRAILER_SIZE..]);
                let tb = decode_fixed64(&b[b.len() - TRAILER_SIZE..]);
                tb.cmp(&ta)
            }
            ord => ord,
        }
    }
}

impl fmt::Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalKeyComparator")
            .field("user", &self.user.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn test_internal_key_roundtrip() {
        let key = make_internal_key(b"foo", 42, ValueType::Value);
        let parsed = parse_internal_key(&key).expect("parse failed");
        assert_eq!(parsed.user_key, b"foo");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.value_type, ValueType::Value);

        let key = make_internal_key(b"", MAX_SEQUENCE_NUMBER, ValueType::Deletion);
        let parsed = parse_internal_key(&key).expect("parse failed");
        assert_eq!(parsed.user_key, b"");
        assert_eq!(parsed.sequence, MAX_SEQUENCE_NUMBER);
        assert_eq!(parsed.value_type, ValueType::Deletion);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_internal_key(b"short").is_err());
        let mut key = make_internal_key(b"k", 1, ValueType::Value);
        let trailer_start = key.len() - TRAILER_SIZE;
        key[trailer_start] = 0x7f; // unknown type
        assert!(parse_internal_key(&key).is_err());
    }

    #[test]
    fn test_order_user_key_ascending() {
        let cmp = icmp();
        let a = make_internal_key(b"a", 100, ValueType::Value);
        let b = make_internal_key(b"b", 1, ValueType::Value);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_order_sequence_descending() {
        let cmp = icmp();
        let newer = make_internal_key(b"k", 5, ValueType::Value);
        let older = make_internal_key(b"k", 4, ValueType::Value);
        assert_eq!(cmp.compare(&newer, &older), Ordering::Less);
    }

    #[test]
    fn test_order_type_descending_at_equal_sequence() {
        let cmp = icmp();
        let value = make_internal_key(b"k", 5, ValueType::Value);
        let tombstone = make_internal_key(b"k", 5, ValueType::Deletion);
        assert_eq!(cmp.compare(&value, &tombstone), Ordering::Less);
    }

    #[test]
    fn test_lookup_key_sorts_before_visible_revisions() {
        let cmp = icmp();
        let lookup = LookupKey::new(b"k", 7);
        let at_snapshot = make_internal_key(b"k", 7, ValueType::Value);
        let above_snapshot = make_internal_key(b"k", 8, ValueType::Value);
        // Entries with sequence > 7 sort strictly before the lookup key and
        // are skipped by a seek; the entry at the snapshot is found.
        assert_eq!(cmp.compare(lookup.internal_key(), &at_snapshot), Ordering::Equal);
        assert_eq!(
            cmp.compare(&above_snapshot, lookup.internal_key()),
            Ordering::Less
        );
        assert_eq!(lookup.user_key(), b"k");
    }
}
