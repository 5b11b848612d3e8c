//! Log record format and LSN addressing.

use crate::constants::{
    FLAG_PROVISIONAL, HEADER_SIZE, MAX_PAYLOAD_SIZE, OFF_CHECKSUM, OFF_ENTRY_TYPE, OFF_FLAGS,
    OFF_PAYLOAD_LEN,
};
use bytes::{BufMut, Bytes, BytesMut};
use larch_common::{LarchError, Result};
use serde::{Deserialize, Serialize};

/// Log Sequence Number: the durable address of a logged entry.
///
/// The upper 32 bits hold the log file number and the lower 32 bits the
/// byte offset within that file. `Lsn::NULL` marks "never logged".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// No log address.
    pub const NULL: Lsn = Lsn(u64::MAX);

    /// Creates an LSN from a file number and an offset within that file.
    pub fn new(file_number: u32, file_offset: u32) -> Self {
        Self(((file_number as u64) << 32) | (file_offset as u64))
    }

    /// Returns the file number portion of this LSN.
    pub fn file_number(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the offset within the file.
    pub fn file_offset(&self) -> u32 {
        self.0 as u32
    }

    /// Returns true if this is `Lsn::NULL`.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl Default for Lsn {
    fn default() -> Self {
        Self::NULL
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            write!(f, "0x{:x}/0x{:x}", self.file_number(), self.file_offset())
        }
    }
}

/// Types of log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogEntryType {
    /// Upper internal node.
    In = 1,
    /// Bottom internal node.
    Bin = 2,
    /// Duplicate tree internal node.
    Din = 3,
    /// Duplicate tree bottom internal node.
    Dbin = 4,
    /// Changed slots of a BIN since its last full version.
    BinDelta = 5,
    /// Changed slots of a DBIN since its last full version.
    DupBinDelta = 6,
    /// Non-transactional leaf node.
    Ln = 10,
    /// Transactional leaf node.
    LnTx = 11,
    /// Deleted duplicate leaf node.
    DelDupLn = 12,
    /// Transactional deleted duplicate leaf node.
    DelDupLnTx = 13,
    /// Duplicate count leaf node.
    DupCountLn = 14,
    /// Transactional duplicate count leaf node.
    DupCountLnTx = 15,
    /// Catalog entry mapping a database id to its root.
    MapLn = 16,
    /// Catalog entry mapping a name to a database id.
    NameLn = 17,
    /// Removal of a main tree subtree.
    InDeleteInfo = 20,
    /// Removal of a duplicate tree subtree.
    InDupDeleteInfo = 21,
}

impl LogEntryType {
    /// Returns true for internal node entries (full versions or deltas).
    pub fn is_internal_node(&self) -> bool {
        matches!(
            self,
            LogEntryType::In
                | LogEntryType::Bin
                | LogEntryType::Din
                | LogEntryType::Dbin
                | LogEntryType::BinDelta
                | LogEntryType::DupBinDelta
        )
    }

    /// Returns true for leaf node entries.
    pub fn is_leaf_node(&self) -> bool {
        matches!(
            self,
            LogEntryType::Ln
                | LogEntryType::LnTx
                | LogEntryType::DelDupLn
                | LogEntryType::DelDupLnTx
                | LogEntryType::DupCountLn
                | LogEntryType::DupCountLnTx
                | LogEntryType::MapLn
                | LogEntryType::NameLn
        )
    }

    /// Returns true for any entry that describes a node.
    pub fn is_node(&self) -> bool {
        self.is_internal_node() || self.is_leaf_node()
    }

    /// Returns true for entries written on behalf of a transaction.
    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            LogEntryType::LnTx | LogEntryType::DelDupLnTx | LogEntryType::DupCountLnTx
        )
    }

    /// Returns the transactional variant of a leaf entry type.
    pub fn transactional(self) -> Self {
        match self {
            LogEntryType::Ln => LogEntryType::LnTx,
            LogEntryType::DelDupLn => LogEntryType::DelDupLnTx,
            LogEntryType::DupCountLn => LogEntryType::DupCountLnTx,
            other => other,
        }
    }
}

impl TryFrom<u8> for LogEntryType {
    type Error = LarchError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LogEntryType::In),
            2 => Ok(LogEntryType::Bin),
            3 => Ok(LogEntryType::Din),
            4 => Ok(LogEntryType::Dbin),
            5 => Ok(LogEntryType::BinDelta),
            6 => Ok(LogEntryType::DupBinDelta),
            10 => Ok(LogEntryType::Ln),
            11 => Ok(LogEntryType::LnTx),
            12 => Ok(LogEntryType::DelDupLn),
            13 => Ok(LogEntryType::DelDupLnTx),
            14 => Ok(LogEntryType::DupCountLn),
            15 => Ok(LogEntryType::DupCountLnTx),
            16 => Ok(LogEntryType::MapLn),
            17 => Ok(LogEntryType::NameLn),
            20 => Ok(LogEntryType::InDeleteInfo),
            21 => Ok(LogEntryType::InDupDeleteInfo),
            _ => Err(LarchError::LogCorrupted {
                lsn: Lsn::NULL.to_string(),
                reason: format!("invalid entry type: {}", value),
            }),
        }
    }
}

/// A single entry in the log.
///
/// Record format on disk:
/// - header (12 bytes):
///   - entry_type: 1 byte
///   - flags: 1 byte
///   - reserved: 2 bytes
///   - payload_len: 4 bytes
///   - checksum: 4 bytes (CRC32 of the first 8 header bytes + payload)
/// - payload: variable length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Type of this entry.
    pub entry_type: LogEntryType,
    /// Whether recovery may skip this entry unless a later ancestor confirms it.
    pub provisional: bool,
    /// Serialized entry body.
    pub payload: Bytes,
}

impl LogRecord {
    /// Creates a new log record.
    pub fn new(entry_type: LogEntryType, provisional: bool, payload: Bytes) -> Self {
        Self {
            entry_type,
            provisional,
            payload,
        }
    }

    /// Returns the total size of this record on disk.
    pub fn size_on_disk(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serializes this record to bytes.
    pub fn serialize(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(LarchError::LogWriteFailed(format!(
                "payload of {} bytes exceeds the {} byte limit",
                self.payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let mut buf = BytesMut::with_capacity(self.size_on_disk());
        buf.put_u8(self.entry_type as u8);
        buf.put_u8(if self.provisional { FLAG_PROVISIONAL } else { 0 });
        buf.put_u16_le(0);
        buf.put_u32_le(self.payload.len() as u32);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..OFF_CHECKSUM]);
        hasher.update(&self.payload);
        buf.put_u32_le(hasher.finalize());

        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Reads the payload length out of a serialized header.
    pub fn payload_len(header: &[u8]) -> usize {
        u32::from_le_bytes([
            header[OFF_PAYLOAD_LEN],
            header[OFF_PAYLOAD_LEN + 1],
            header[OFF_PAYLOAD_LEN + 2],
            header[OFF_PAYLOAD_LEN + 3],
        ]) as usize
    }

    /// Deserializes a record from a buffer starting at a record boundary.
    pub fn deserialize(lsn: Lsn, data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(corrupted(lsn, "record truncated in header"));
        }
        let payload_len = Self::payload_len(data);
        if data.len() < HEADER_SIZE + payload_len {
            return Err(corrupted(lsn, "record truncated in payload"));
        }
        let stored = u32::from_le_bytes([
            data[OFF_CHECKSUM],
            data[OFF_CHECKSUM + 1],
            data[OFF_CHECKSUM + 2],
            data[OFF_CHECKSUM + 3],
        ]);
        let payload = &data[HEADER_SIZE..HEADER_SIZE + payload_len];
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..OFF_CHECKSUM]);
        hasher.update(payload);
        if hasher.finalize() != stored {
            return Err(corrupted(lsn, "checksum mismatch"));
        }

        let entry_type = LogEntryType::try_from(data[OFF_ENTRY_TYPE]).map_err(|_| {
            corrupted(lsn, &format!("invalid entry type: {}", data[OFF_ENTRY_TYPE]))
        })?;
        Ok(Self {
            entry_type,
            provisional: data[OFF_FLAGS] & FLAG_PROVISIONAL != 0,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

fn corrupted(lsn: Lsn, reason: &str) -> LarchError {
    LarchError::LogCorrupted {
        lsn: lsn.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_parts() {
        let lsn = Lsn::new(3, 0x1234);
        assert_eq!(lsn.file_number(), 3);
        assert_eq!(lsn.file_offset(), 0x1234);
        assert!(!lsn.is_null());
        assert_eq!(lsn.to_string(), "0x3/0x1234");
        assert!(Lsn::NULL.is_null());
        assert_eq!(Lsn::default(), Lsn::NULL);
    }

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn::new(1, 500) < Lsn::new(2, 0));
        assert!(Lsn::new(2, 10) < Lsn::new(2, 11));
    }

    #[test]
    fn test_entry_type_roundtrip() {
        for t in [
            LogEntryType::In,
            LogEntryType::Bin,
            LogEntryType::Din,
            LogEntryType::Dbin,
            LogEntryType::BinDelta,
            LogEntryType::DupBinDelta,
            LogEntryType::Ln,
            LogEntryType::LnTx,
            LogEntryType::DelDupLn,
            LogEntryType::DelDupLnTx,
            LogEntryType::DupCountLn,
            LogEntryType::DupCountLnTx,
            LogEntryType::MapLn,
            LogEntryType::NameLn,
            LogEntryType::InDeleteInfo,
            LogEntryType::InDupDeleteInfo,
        ] {
            assert_eq!(LogEntryType::try_from(t as u8).unwrap(), t);
        }
        assert!(LogEntryType::try_from(99).is_err());
    }

    #[test]
    fn test_entry_type_classes() {
        assert!(LogEntryType::Bin.is_internal_node());
        assert!(!LogEntryType::Bin.is_leaf_node());
        assert!(LogEntryType::DupCountLn.is_leaf_node());
        assert!(!LogEntryType::InDeleteInfo.is_node());
        assert_eq!(LogEntryType::Ln.transactional(), LogEntryType::LnTx);
        assert!(LogEntryType::LnTx.is_transactional());
        assert_eq!(LogEntryType::In.transactional(), LogEntryType::In);
    }

    #[test]
    fn test_record_serialize_deserialize() {
        let record = LogRecord::new(LogEntryType::Bin, true, Bytes::from_static(b"slots"));
        let data = record.serialize().unwrap();
        assert_eq!(data.len(), record.size_on_disk());

        let parsed = LogRecord::deserialize(Lsn::new(1, 16), &data).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_record_checksum_mismatch() {
        let record = LogRecord::new(LogEntryType::Ln, false, Bytes::from_static(b"value"));
        let mut data = record.serialize().unwrap().to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        let err = LogRecord::deserialize(Lsn::new(1, 16), &data).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_record_truncated() {
        let record = LogRecord::new(LogEntryType::In, false, Bytes::from_static(b"abcdef"));
        let data = record.serialize().unwrap();
        assert!(LogRecord::deserialize(Lsn::new(1, 16), &data[..HEADER_SIZE + 2]).is_err());
        assert!(LogRecord::deserialize(Lsn::new(1, 16), &data[..4]).is_err());
    }
}
