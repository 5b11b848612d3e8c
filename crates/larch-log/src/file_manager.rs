//! File-backed log.
//!
//! Each log file starts with a 16 byte header and is named after its file
//! number (`0000002a.jdb`). Records are appended to the newest file until
//! it would exceed the configured size, then the next file number is used.

use crate::constants::{FILE_HEADER_SIZE, FILE_MAGIC, FILE_SUFFIX, FILE_VERSION, HEADER_SIZE};
use crate::manager::LogManager;
use crate::record::{LogEntryType, LogRecord, Lsn};
use crate::tracker::UtilizationTracker;
use bytes::Bytes;
use larch_common::{LarchError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Header at the beginning of each log file.
///
/// Layout (16 bytes):
/// - magic: 4 bytes ("LRCH")
/// - version: 4 bytes
/// - file_number: 4 bytes
/// - checksum: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Magic bytes for identification.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// File number, repeated from the file name.
    pub file_number: u32,
    /// Header checksum.
    pub checksum: u32,
}

impl FileHeader {
    /// Creates a header for the given file number.
    pub fn new(file_number: u32) -> Self {
        let mut header = Self {
            magic: FILE_MAGIC,
            version: FILE_VERSION,
            file_number,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> u32 {
        let mut data = [0u8; FILE_HEADER_SIZE - 4];
        data[0..4].copy_from_slice(&self.magic);
        data[4..8].copy_from_slice(&self.version.to_le_bytes());
        data[8..12].copy_from_slice(&self.file_number.to_le_bytes());
        crc32fast::hash(&data)
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut data = [0u8; FILE_HEADER_SIZE];
        data[0..4].copy_from_slice(&self.magic);
        data[4..8].copy_from_slice(&self.version.to_le_bytes());
        data[8..12].copy_from_slice(&self.file_number.to_le_bytes());
        data[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        data
    }

    /// Deserializes and validates a header.
    pub fn from_bytes(data: &[u8; FILE_HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        let header = Self {
            magic,
            version: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            file_number: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            checksum: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        };
        let lsn = Lsn::new(header.file_number, 0);
        if header.magic != FILE_MAGIC {
            return Err(LarchError::LogCorrupted {
                lsn: lsn.to_string(),
                reason: "invalid magic bytes".to_string(),
            });
        }
        if header.version != FILE_VERSION {
            return Err(LarchError::LogCorrupted {
                lsn: lsn.to_string(),
                reason: format!("unsupported version: {}", header.version),
            });
        }
        if header.checksum != header.compute_checksum() {
            return Err(LarchError::LogCorrupted {
                lsn: lsn.to_string(),
                reason: "header checksum mismatch".to_string(),
            });
        }
        Ok(header)
    }
}

/// Returns the file name used for a log file number.
pub fn file_name(file_number: u32) -> String {
    format!("{:08x}.{}", file_number, FILE_SUFFIX)
}

/// Log stored as numbered files in one directory.
pub struct FileLogManager {
    dir: PathBuf,
    file_max: u64,
    writer: Mutex<FileWriter>,
    tracker: UtilizationTracker,
}

struct FileWriter {
    file_number: u32,
    file: File,
    position: u64,
}

impl FileLogManager {
    /// Opens the log in `dir`, appending after the highest existing file.
    pub fn open(dir: impl AsRef<Path>, file_max: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let last = Self::list_files(&dir)?.into_iter().max();
        let writer = match last {
            Some(file_number) => {
                let path = dir.join(file_name(file_number));
                let mut file = OpenOptions::new().read(true).append(true).open(&path)?;
                let mut header = [0u8; FILE_HEADER_SIZE];
                file.seek(SeekFrom::Start(0))?;
                file.read_exact(&mut header)?;
                FileHeader::from_bytes(&header)?;
                let position = file.seek(SeekFrom::End(0))?;
                info!(file_number, position, "reopened log file");
                FileWriter {
                    file_number,
                    file,
                    position,
                }
            }
            None => Self::create_file(&dir, 0)?,
        };

        Ok(Self {
            dir,
            file_max,
            writer: Mutex::new(writer),
            tracker: UtilizationTracker::new(),
        })
    }

    fn create_file(dir: &Path, file_number: u32) -> Result<FileWriter> {
        let path = dir.join(file_name(file_number));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(&FileHeader::new(file_number).to_bytes())?;
        debug!(file_number, "created log file");
        Ok(FileWriter {
            file_number,
            file,
            position: FILE_HEADER_SIZE as u64,
        })
    }

    /// Returns the numbers of all log files in the directory.
    pub fn list_files(dir: &Path) -> Result<Vec<u32>> {
        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{}", FILE_SUFFIX)) else {
                continue;
            };
            if let Ok(n) = u32::from_str_radix(stem, 16) {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Forces buffered writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().file.sync_data()?;
        Ok(())
    }

    /// Deletes a log file that no longer holds live entries.
    pub fn delete_file(&self, file_number: u32) -> Result<bool> {
        if self.writer.lock().file_number == file_number {
            return Err(LarchError::IllegalArgument(format!(
                "cannot delete the active log file 0x{:x}",
                file_number
            )));
        }
        match std::fs::remove_file(self.dir.join(file_name(file_number))) {
            Ok(()) => {
                self.tracker.remove_file(file_number);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the directory holding the log files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl LogManager for FileLogManager {
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
            let mut writer = self.writer.lock();
            if writer.position > FILE_HEADER_SIZE as u64
                && writer.position + data.len() as u64 > self.file_max
            {
                writer.file.flush()?;
                let next = writer.file_number + 1;
                *writer = Self::create_file(&self.dir, next)?;
            }
            let lsn = Lsn::new(writer.file_number, writer.position as u32);
            writer
                .file
                .write_all(&data)
                .map_err(|e| LarchError::LogWriteFailed(e.to_string()))?;
            writer.position += data.len() as u64;
            lsn
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
        let path = self.dir.join(file_name(lsn.file_number()));
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(LarchError::LogFileNotFound {
                    file_number: lsn.file_number(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(lsn.file_offset() as u64))?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        let mut data = vec![0u8; HEADER_SIZE + LogRecord::payload_len(&header)];
        data[..HEADER_SIZE].copy_from_slice(&header);
        file.read_exact(&mut data[HEADER_SIZE..])?;
        LogRecord::deserialize(lsn, &data)
    }

    fn tracker(&self) -> &UtilizationTracker {
        &self.tracker
    }

    fn end_of_log(&self) -> Lsn {
        let writer = self.writer.lock();
        Lsn::new(writer.file_number, writer.position as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use tempfile::tempdir;

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader::new(42);
        let parsed = FileHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);

        let mut bad = header.to_bytes();
        bad[0] = b'X';
        assert!(FileHeader::from_bytes(&bad).is_err());
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name(0x2a), "0000002a.jdb");
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let log = FileLogManager::open(dir.path(), 1024 * 1024).unwrap();
        let mut rng = rand::thread_rng();
        let mut written = Vec::new();
        for i in 0..50u8 {
            let len = rng.gen_range(1..200);
            let payload = Bytes::from(vec![i; len]);
            let lsn = log
                .log(LogEntryType::Ln, payload.clone(), false, false, Lsn::NULL, 0)
                .unwrap();
            written.push((lsn, payload));
        }
        for (lsn, payload) in written {
            let record = log.get(lsn).unwrap();
            assert_eq!(record.payload, payload);
        }
    }

    #[test]
    fn test_roll_and_reopen() {
        let dir = tempdir().unwrap();
        let last_lsn;
        {
            let log = FileLogManager::open(dir.path(), 128).unwrap();
            for _ in 0..10 {
                log.log(
                    LogEntryType::Bin,
                    Bytes::from(vec![1u8; 60]),
                    true,
                    false,
                    Lsn::NULL,
                    0,
                )
                .unwrap();
            }
            last_lsn = log.end_of_log();
            log.sync().unwrap();
        }
        assert!(last_lsn.file_number() > 0);

        let log = FileLogManager::open(dir.path(), 128).unwrap();
        assert_eq!(log.end_of_log(), last_lsn);
        let files = FileLogManager::list_files(dir.path()).unwrap();
        assert_eq!(files.len() as u32, last_lsn.file_number() + 1);
    }

    #[test]
    fn test_deleted_file_reports_not_found() {
        let dir = tempdir().unwrap();
        let log = FileLogManager::open(dir.path(), 64).unwrap();
        let first = log
            .log(LogEntryType::Ln, Bytes::from(vec![0u8; 30]), false, false, Lsn::NULL, 0)
            .unwrap();
        log.log(LogEntryType::Ln, Bytes::from(vec![0u8; 30]), false, false, Lsn::NULL, 0)
            .unwrap();
        assert!(log.delete_file(first.file_number()).unwrap());
        assert!(log.get(first).unwrap_err().is_log_file_not_found());
        assert!(log.delete_file(log.end_of_log().file_number()).is_err());
    }
}
