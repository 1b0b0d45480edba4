use std::collections::VecDeque;
use std::sync::Arc;

use crate::key::SequenceNumber;

/// A handle pinning the database state at a sequence number. Reads through
/// a snapshot see exactly the writes committed at or before it, and while
/// any snapshot is held, compaction preserves the revisions needed to answer
/// reads at its sequence.
///
/// Release with [`crate::Database::release_snapshot`]; a leaked snapshot
/// pins old revisions for the life of the engine.
pub struct Snapshot {
    pub(crate) inner: Arc<SnapshotInner>,
}

pub(crate) struct SnapshotInner {
    sequence: SequenceNumber,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNumber {
        self.inner.sequence
    }
}

/// Live snapshots ordered oldest-first; the front bounds the smallest
/// sequence compaction must keep.
pub(crate) struct SnapshotList {
    snapshots: VecDeque<Arc<SnapshotInner>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self {
            snapshots: VecDeque::new(),
        }
    }

    pub fn snapshot(&mut self, sequence: SequenceNumber) -> Snapshot {
        debug_assert!(self
            .snapshots
            .back()
            .map(|s| s.sequence <= sequence)
            .unwrap_or(true));
        let inner = Arc::new(SnapshotInner { sequence });
        self.snapshots.push_back(Arc::clone(&inner));
        Snapshot { inner }
    }

    pub fn release(&mut self, snapshot: &Snapshot) {
        self.snapshots
            .retain(|s| !Arc::ptr_eq(s, &snapshot.inner));
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.snapshots.front().map(|s| s.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_tracks_release_order() {
        let mut list = SnapshotList::new();
        assert!(list.is_empty());
        assert_eq!(list.oldest(), None);

        let a = list.snapshot(5);
        let b = list.snapshot(9);
        let c = list.snapshot(9);
        assert_eq!(list.oldest(), Some(5));

        list.release(&a);
        assert_eq!(list.oldest(), Some(9));

        // Two snapshots at the same sequence are distinct handles.
        list.release(&b);
        assert_eq!(list.oldest(), Some(9));
        list.release(&c);
        assert!(list.is_empty());
    }
}
