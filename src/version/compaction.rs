use std::cmp::Ordering;
use std::sync::Arc;

use super::edit::VersionEdit;
use super::{total_file_size, FileMetaData, Version};
use crate::config::{MAX_FILE_SIZE, MAX_GRANDPARENT_OVERLAP_BYTES, NUM_LEVELS};
use crate::key::{self, InternalKeyComparator};

/// One planned compaction: inputs from `level` and `level + 1`, plus the
/// `level + 2` files used only to bound output overlap. Pins the version it
/// was planned against.
pub struct Compaction {
    level: usize,
    input_version: Arc<Version>,
    pub edit: VersionEdit,

    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,

    // Cursor state for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level cursors for is_base_level_for_key; valid because compaction
    // consumes keys in ascending user-key order.
    level_ptrs: [usize; NUM_LEVELS],

    icmp: InternalKeyComparator,
}

impl Compaction {
    pub(crate) fn new(
        level: usize,
        input_version: Arc<Version>,
        icmp: InternalKeyComparator,
    ) -> Self {
        Self {
            level,
            input_version,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
            icmp,
        }
    }

    /// The level being compacted; outputs land at `level + 1`.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn max_output_file_size(&self) -> u64 {
        MAX_FILE_SIZE
    }

    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    pub fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// A compaction that moves a single file down a level without rewriting
    /// it: one input, nothing to merge with, and little enough grandparent
    /// overlap that the move does not make the next compaction down costly.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= MAX_GRANDPARENT_OVERLAP_BYTES
    }

    /// Records the deletion of every input file in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.delete_file(self.level + which, file.number);
            }
        }
    }

    /// True iff no level deeper than the output level contains `user_key`.
    /// Lets an obsolete tombstone be dropped instead of copied down forever.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let ucmp = self.icmp.user_comparator().clone();
        for level in self.level + 2..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, key::user_key(&file.largest)) != Ordering::Greater {
                    if ucmp.compare(user_key, key::user_key(&file.smallest)) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                // The merged input only moves forward, so neither do we.
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True when the current output should be closed before `internal_key`
    /// is added: the bytes of level+2 overlapped since the output began
    /// exceed the cap.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                &self.grandparents[self.grandparent_index].largest,
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > MAX_GRANDPARENT_OVERLAP_BYTES {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compaction")
            .field("level", &self.level)
            .field("inputs0", &self.inputs[0].len())
            .field("inputs1", &self.inputs[1].len())
            .field("grandparents", &self.grandparents.len())
            .finish()
    }
}
