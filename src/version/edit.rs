//! Manifest records.
//!
//! A `VersionEdit` is the unit of change to the file catalog: files added
//! and deleted per level, counter advances, and compaction cursors. The
//! manifest is a log of serialized edits; replaying them from an empty
//! catalog reproduces the current `Version`.
//!
//! Wire format: a sequence of tagged fields, each a varint32 tag followed by
//! varint/length-prefixed payloads:
//!
//! ```text
//! 1 comparator-name      2 log-number           3 next-file-number
//! 4 last-sequence        5 compact-pointer      6 deleted-file
//! 7 new-file             9 prev-log-number
//! ```

use crate::coding::{
    get_length_prefixed, get_varint32, get_varint64, put_length_prefixed, put_varint32,
    put_varint64,
};
use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::key::SequenceNumber;

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// A table file recorded in an edit, before it becomes a `FileMetaData`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFileEntry {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key in the file.
    pub smallest: Vec<u8>,
    /// Largest internal key in the file.
    pub largest: Vec<u8>,
}

/// A delta against the current version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    pub compact_pointers: Vec<(usize, Vec<u8>)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, NewFileEntry)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: Vec<u8>,
        largest: Vec<u8>,
    ) {
        self.new_files.push((
            level,
            NewFileEntry {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: Vec<u8>) {
        self.compact_pointers.push((level, key));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Some(name) = &self.comparator_name {
            put_varint32(&mut buf, TAG_COMPARATOR);
            put_length_prefixed(&mut buf, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint32(&mut buf, TAG_LOG_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(&mut buf, TAG_PREV_LOG_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(&mut buf, TAG_NEXT_FILE_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint32(&mut buf, TAG_LAST_SEQUENCE);
            put_varint64(&mut buf, n);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(&mut buf, TAG_COMPACT_POINTER);
            put_varint32(&mut buf, *level as u32);
            put_length_prefixed(&mut buf, key);
        }
        for (level, number) in &self.deleted_files {
            put_varint32(&mut buf, TAG_DELETED_FILE);
            put_varint32(&mut buf, *level as u32);
            put_varint64(&mut buf, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(&mut buf, TAG_NEW_FILE);
            put_varint32(&mut buf, *level as u32);
            put_varint64(&mut buf, file.number);
            put_varint64(&mut buf, file.file_size);
            put_length_prefixed(&mut buf, &file.smallest);
            put_length_prefixed(&mut buf, &file.largest);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();
        let mut pos = 0;

        while pos < data.len() {
            let (tag, n) = get_varint32(&data[pos..])?;
            pos += n;
            match tag {
                TAG_COMPARATOR => {
                    let (name, n) = get_length_prefixed(&data[pos..])?;
                    pos += n;
                    let name = String::from_utf8(name.to_vec()).map_err(|_| {
                        Error::Corruption("comparator name is not utf-8".to_string())
                    })?;
                    edit.comparator_name = Some(name);
                }
                TAG_LOG_NUMBER => {
                    let (v, n) = get_varint64(&data[pos..])?;
                    pos += n;
                    edit.log_number = Some(v);
                }
                TAG_PREV_LOG_NUMBER => {
                    let (v, n) = get_varint64(&data[pos..])?;
                    pos += n;
                    edit.prev_log_number = Some(v);
                }
                TAG_NEXT_FILE_NUMBER => {
                    let (v, n) = get_varint64(&data[pos..])?;
                    pos += n;
                    edit.next_file_number = Some(v);
                }
                TAG_LAST_SEQUENCE => {
                    let (v, n) = get_varint64(&data[pos..])?;
                    pos += n;
                    edit.last_sequence = Some(v);
                }
                TAG_COMPACT_POINTER => {
                    let (level, n) = get_varint32(&data[pos..])?;
                    pos += n;
                    let (key, n) = get_length_prefixed(&data[pos..])?;
                    pos += n;
                    edit.compact_pointers
                        .push((check_level(level)?, key.to_vec()));
                }
                TAG_DELETED_FILE => {
                    let (level, n) = get_varint32(&data[pos..])?;
                    pos += n;
                    let (number, n) = get_varint64(&data[pos..])?;
                    pos += n;
                    edit.deleted_files.push((check_level(level)?, number));
                }
                TAG_NEW_FILE => {
                    let (level, n) = get_varint32(&data[pos..])?;
                    pos += n;
                    let (number, n) = get_varint64(&data[pos..])?;
                    pos += n;
                    let (file_size, n) = get_varint64(&data[pos..])?;
                    pos += n;
                    let (smallest, n) = get_length_prefixed(&data[pos..])?;
                    pos += n;
                    let smallest = smallest.to_vec();
                    let (largest, n) = get_length_prefixed(&data[pos..])?;
                    pos += n;
                    edit.new_files.push((
                        check_level(level)?,
                        NewFileEntry {
                            number,
                            file_size,
                            smallest,
                            largest: largest.to_vec(),
                        },
                    ));
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag: {other}"
                    )));
                }
            }
        }
        Ok(edit)
    }
}

fn check_level(level: u32) -> Result<usize> {
    let level = level as usize;
    if level >= NUM_LEVELS {
        return Err(Error::Corruption(format!(
            "version edit names level {level} (max {})",
            NUM_LEVELS - 1
        )));
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{make_internal_key, ValueType};

    fn sample_edit() -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some("tephradb.BytewiseComparator".to_string());
        edit.log_number = Some(12);
        edit.prev_log_number = Some(0);
        edit.next_file_number = Some(99);
        edit.last_sequence = Some(1 << 40);
        edit.set_compact_pointer(2, make_internal_key(b"cursor", 7, ValueType::Value));
        edit.delete_file(1, 4);
        edit.delete_file(3, 17);
        edit.add_file(
            0,
            42,
            4096,
            make_internal_key(b"aardvark", 3, ValueType::Value),
            make_internal_key(b"zebra", 9, ValueType::Deletion),
        );
        edit
    }

    #[test]
    fn test_roundtrip_is_bijective() {
        let edit = sample_edit();
        let decoded = VersionEdit::decode(&edit.encode()).expect("decode failed");
        assert_eq!(decoded, edit);
        // Re-encoding the decoded edit reproduces the bytes.
        assert_eq!(decoded.encode(), edit.encode());
    }

    #[test]
    fn test_empty_edit_roundtrip() {
        let edit = VersionEdit::new();
        assert!(edit.encode().is_empty());
        assert_eq!(VersionEdit::decode(&[]).expect("decode failed"), edit);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = Vec::new();
        crate::coding::put_varint32(&mut buf, 8); // never assigned
        assert!(VersionEdit::decode(&buf).is_err());
    }

    #[test]
    fn test_out_of_range_level_rejected() {
        let mut buf = Vec::new();
        crate::coding::put_varint32(&mut buf, 6); // deleted-file
        crate::coding::put_varint32(&mut buf, NUM_LEVELS as u32);
        crate::coding::put_varint64(&mut buf, 1);
        assert!(VersionEdit::decode(&buf).is_err());
    }

    #[test]
    fn test_truncated_edit_rejected() {
        let encoded = sample_edit().encode();
        assert!(VersionEdit::decode(&encoded[..encoded.len() - 3]).is_err());
    }
}
