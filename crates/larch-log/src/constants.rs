//! Log constants for record format and file layout.

// Record header constants

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Offset of the entry type field in the header.
pub const OFF_ENTRY_TYPE: usize = 0;

/// Offset of the flags field in the header.
pub const OFF_FLAGS: usize = 1;

/// Offset of the payload length field in the header.
pub const OFF_PAYLOAD_LEN: usize = 4;

/// Offset of the checksum field in the header.
pub const OFF_CHECKSUM: usize = 8;

/// Flag bit marking a provisional entry.
pub const FLAG_PROVISIONAL: u8 = 0x1;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

// File constants

/// File header size in bytes. The first record starts here.
pub const FILE_HEADER_SIZE: usize = 16;

/// Magic bytes identifying a log file.
pub const FILE_MAGIC: [u8; 4] = *b"LRCH";

/// Current file format version.
pub const FILE_VERSION: u32 = 1;

/// Suffix of log file names.
pub const FILE_SUFFIX: &str = "jdb";
