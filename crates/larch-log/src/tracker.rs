//! Per-file utilization accounting.
//!
//! The tree reports every node version that a newer version, a subtree
//! removal, or a provisional-obsolete flush has made dead. A log cleaner
//! uses these counts to pick files worth reclaiming.

use crate::record::{LogEntryType, Lsn};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Counters for a single log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSummary {
    /// Entries written to the file.
    pub total_count: u64,
    /// Bytes written to the file.
    pub total_size: u64,
    /// Internal node entries written.
    pub total_in_count: u64,
    /// Leaf node entries written.
    pub total_ln_count: u64,
    /// Internal node entries known to be obsolete.
    pub obsolete_in_count: u64,
    /// Leaf node entries known to be obsolete.
    pub obsolete_ln_count: u64,
    /// Bytes known to be obsolete, for entries whose size was reported.
    pub obsolete_size: u64,
}

impl FileSummary {
    /// Returns the number of entries still live in the file.
    pub fn live_count(&self) -> u64 {
        self.total_count
            .saturating_sub(self.obsolete_in_count + self.obsolete_ln_count)
    }

    /// Returns the percentage of written bytes still considered live.
    pub fn utilization(&self) -> u64 {
        if self.total_size == 0 {
            return 100;
        }
        let live = self.total_size.saturating_sub(self.obsolete_size);
        live * 100 / self.total_size
    }
}

/// Tracks obsolete log entries per file.
#[derive(Debug, Default)]
pub struct UtilizationTracker {
    files: Mutex<BTreeMap<u32, FileSummary>>,
}

impl UtilizationTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a newly written entry.
    pub fn count_new_entry(&self, lsn: Lsn, entry_type: LogEntryType, size: usize) {
        let mut files = self.files.lock();
        let summary = files.entry(lsn.file_number()).or_default();
        summary.total_count += 1;
        summary.total_size += size as u64;
        if entry_type.is_internal_node() {
            summary.total_in_count += 1;
        } else if entry_type.is_leaf_node() {
            summary.total_ln_count += 1;
        }
    }

    /// Counts a node entry as obsolete. A size of zero means unknown.
    pub fn count_obsolete_node(&self, lsn: Lsn, entry_type: Option<LogEntryType>, size: usize) {
        if lsn.is_null() {
            return;
        }
        let mut files = self.files.lock();
        let summary = files.entry(lsn.file_number()).or_default();
        match entry_type {
            Some(t) if t.is_leaf_node() => summary.obsolete_ln_count += 1,
            _ => summary.obsolete_in_count += 1,
        }
        summary.obsolete_size += size as u64;
    }

    /// Counts a batch of internal node entries as obsolete.
    pub fn count_obsolete_ins(&self, lsns: &[Lsn]) {
        for lsn in lsns {
            self.count_obsolete_node(*lsn, Some(LogEntryType::In), 0);
        }
    }

    /// Returns the summary for one file.
    pub fn file_summary(&self, file_number: u32) -> FileSummary {
        self.files
            .lock()
            .get(&file_number)
            .copied()
            .unwrap_or_default()
    }

    /// Returns the total number of obsolete entries across all files.
    pub fn total_obsolete(&self) -> u64 {
        self.files
            .lock()
            .values()
            .map(|s| s.obsolete_in_count + s.obsolete_ln_count)
            .sum()
    }

    /// Forgets a file, after the cleaner has deleted it.
    pub fn remove_file(&self, file_number: u32) {
        self.files.lock().remove(&file_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_obsolete_counts() {
        let tracker = UtilizationTracker::new();
        let in_lsn = Lsn::new(1, 16);
        let ln_lsn = Lsn::new(1, 64);
        tracker.count_new_entry(in_lsn, LogEntryType::Bin, 48);
        tracker.count_new_entry(ln_lsn, LogEntryType::Ln, 32);
        tracker.count_obsolete_node(ln_lsn, Some(LogEntryType::Ln), 32);

        let summary = tracker.file_summary(1);
        assert_eq!(summary.total_count, 2);
        assert_eq!(summary.total_in_count, 1);
        assert_eq!(summary.total_ln_count, 1);
        assert_eq!(summary.obsolete_ln_count, 1);
        assert_eq!(summary.live_count(), 1);
        assert_eq!(summary.utilization(), 60);
    }

    #[test]
    fn test_null_lsn_ignored() {
        let tracker = UtilizationTracker::new();
        tracker.count_obsolete_node(Lsn::NULL, None, 10);
        assert_eq!(tracker.total_obsolete(), 0);
    }

    #[test]
    fn test_count_obsolete_ins_spans_files() {
        let tracker = UtilizationTracker::new();
        tracker.count_obsolete_ins(&[Lsn::new(1, 16), Lsn::new(2, 16), Lsn::new(2, 80)]);
        assert_eq!(tracker.file_summary(1).obsolete_in_count, 1);
        assert_eq!(tracker.file_summary(2).obsolete_in_count, 2);
        assert_eq!(tracker.total_obsolete(), 3);

        tracker.remove_file(2);
        assert_eq!(tracker.total_obsolete(), 1);
    }

    #[test]
    fn test_empty_file_utilization() {
        assert_eq!(FileSummary::default().utilization(), 100);
    }
}
