//! The log manager interface consumed by the tree, and an in-memory log.

use crate::constants::FILE_HEADER_SIZE;
use crate::record::{LogEntryType, LogRecord, Lsn};
use crate::tracker::UtilizationTracker;
use bytes::Bytes;
use larch_common::{LarchError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Append-only log used to persist and fetch tree nodes.
pub trait LogManager: Send + Sync {
    /// Appends an entry and returns its LSN.
    ///
    /// A non-NULL `old_lsn` names the previous version of the same node,
    /// which the utilization tracker counts obsolete once the new entry is
    /// written.
    fn log(
        &self,
        entry_type: LogEntryType,
        payload: Bytes,
        provisional: bool,
        background_io: bool,
        old_lsn: Lsn,
        old_size: usize,
    ) -> Result<Lsn>;

    /// Reads the entry at `lsn`.
    fn get(&self, lsn: Lsn) -> Result<LogRecord>;

    /// Returns the utilization tracker fed by this log.
    fn tracker(&self) -> &UtilizationTracker;

    /// Counts one node version obsolete.
    fn count_obsolete_node(&self, lsn: Lsn, entry_type: Option<LogEntryType>, size: usize) {
        self.tracker().count_obsolete_node(lsn, entry_type, size);
    }

    /// Counts a batch of internal node versions obsolete.
    fn count_obsolete_nodes(&self, lsns: &[Lsn]) {
        self.tracker().count_obsolete_ins(lsns);
    }

    /// Returns the LSN the next entry would receive, used for reporting.
    fn end_of_log(&self) -> Lsn;
}

/// Shared handle to a log manager.
pub type SharedLogManager = Arc<dyn LogManager>;

/// Log kept entirely in memory.
///
/// Files roll at `file_max` bytes exactly as the file-backed log does, so
/// LSNs span several file numbers even in tests.
pub struct MemoryLogManager {
    inner: Mutex<MemoryLogInner>,
    file_max: u64,
    tracker: UtilizationTracker,
}

struct MemoryLogInner {
    files: BTreeMap<u32, Vec<u8>>,
    current_file: u32,
    entries_written: u64,
}

impl MemoryLogManager {
    /// Creates an empty log starting at file zero.
    pub fn new(file_max: u64) -> Self {
        Self::starting_at(0, file_max)
    }

    /// Creates an empty log whose first file has the given number.
    pub fn starting_at(first_file: u32, file_max: u64) -> Self {
        let mut files = BTreeMap::new();
        files.insert(first_file, vec![0u8; FILE_HEADER_SIZE]);
        Self {
            inner: Mutex::new(MemoryLogInner {
                files,
                current_file: first_file,
                entries_written: 0,
            }),
            file_max,
            tracker: UtilizationTracker::new(),
        }
    }

    /// Starts a new file. Later entries receive the next file number.
    pub fn roll_file(&self) -> u32 {
        let mut inner = self.inner.lock();
        Self::roll_locked(&mut inner)
    }

    fn roll_locked(inner: &mut MemoryLogInner) -> u32 {
        inner.current_file += 1;
        let file = inner.current_file;
        inner.files.insert(file, vec![0u8; FILE_HEADER_SIZE]);
        debug!(file_number = file, "rolled in-memory log file");
        file
    }

    /// Drops a file, as a cleaner would after migrating its live entries.
    pub fn delete_file(&self, file_number: u32) -> bool {
        let removed = self.inner.lock().files.remove(&file_number).is_some();
        if removed {
            self.tracker.remove_file(file_number);
        }
        removed
    }

    /// Returns the number of the file currently being appended to.
    pub fn current_file(&self) -> u32 {
        self.inner.lock().current_file
    }

    /// Returns the number of entries appended so far.
    pub fn entries_written(&self) -> u64 {
        self.inner.lock().entries_written
    }
}

impl LogManager for MemoryLogManager {
    fn log(
        &self,
        entry_type: LogEntryType,
        payload: Bytes,
        provisional: bool,
        _background_io: bool,
        old_lsn: Lsn,
        old_size: usize,
    ) -> Result<Lsn> {
        let record = LogRecord::new(entry_type, provisional, payload);
        let data = record.serialize()?;

        let lsn = {
            let mut inner = self.inner.lock();
            let current = inner.current_file;
            let len = inner.files.get(&current).map_or(0, |f| f.len());
            if len > FILE_HEADER_SIZE && (len + data.len()) as u64 > self.file_max {
                Self::roll_locked(&mut inner);
            }
            let current = inner.current_file;
            let file = inner
                .files
                .get_mut(&current)
                .ok_or(LarchError::LogFileNotFound {
                    file_number: current,
                })?;
            let offset = file.len();
            file.extend_from_slice(&data);
            inner.entries_written += 1;
            Lsn::new(current, offset as u32)
        };

        self.tracker.count_new_entry(lsn, entry_type, data.len());
        if !old_lsn.is_null() {
            self.tracker
                .count_obsolete_node(old_lsn, Some(entry_type), old_size);
        }
        Ok(lsn)
    }

    fn get(&self, lsn: Lsn) -> Result<LogRecord> {
        if lsn.is_null() {
            return Err(LarchError::Internal("fetch of NULL LSN".to_string()));
        }
        let inner = self.inner.lock();
        let file = inner
            .files
            .get(&lsn.file_number())
            .ok_or(LarchError::LogFileNotFound {
                file_number: lsn.file_number(),
            })?;
        let offset = lsn.file_offset() as usize;
        if offset >= file.len() {
            return Err(LarchError::LogCorrupted {
                lsn: lsn.to_string(),
                reason: "offset past end of file".to_string(),
            });
        }
        LogRecord::deserialize(lsn, &file[offset..])
    }

    fn tracker(&self) -> &UtilizationTracker {
        &self.tracker
    }

    fn end_of_log(&self) -> Lsn {
        let inner = self.inner.lock();
        let len = inner.files.get(&inner.current_file).map_or(0, |f| f.len());
        Lsn::new(inner.current_file, len as u32)
    }
}
