//! Tree operation counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, bumped without latches.
#[derive(Debug, Default)]
pub(crate) struct TreeCounters {
    pub root_splits: AtomicU64,
    pub splits: AtomicU64,
    pub relatches_required: AtomicU64,
    pub inserts: AtomicU64,
    pub duplicate_trees_created: AtomicU64,
    pub subtrees_deleted: AtomicU64,
    pub roots_deleted: AtomicU64,
}

impl TreeCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TreeStats {
        TreeStats {
            root_splits: self.root_splits.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            relatches_required: self.relatches_required.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            duplicate_trees_created: self.duplicate_trees_created.load(Ordering::Relaxed),
            subtrees_deleted: self.subtrees_deleted.load(Ordering::Relaxed),
            roots_deleted: self.roots_deleted.load(Ordering::Relaxed),
        }
    }
}

/// Statistics about one tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    /// Splits of the main tree root.
    pub root_splits: u64,
    /// Splits of nodes below a root, main and duplicate trees alike.
    pub splits: u64,
    /// Searches restarted to fetch a child under an exclusive root latch.
    pub relatches_required: u64,
    /// Records inserted, duplicates included.
    pub inserts: u64,
    /// Leaves converted into duplicate trees.
    pub duplicate_trees_created: u64,
    /// Emptied subtrees detached from their parent.
    pub subtrees_deleted: u64,
    /// Times the whole tree was removed.
    pub roots_deleted: u64,
}
