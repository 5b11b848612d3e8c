//! Error types for larch.

use thiserror::Error;

/// Result type alias using LarchError.
pub type Result<T> = std::result::Result<T, LarchError>;

/// Errors that can occur in larch operations.
#[derive(Debug, Error)]
pub enum LarchError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Log errors
    #[error("Log file not found: 0x{file_number:x}")]
    LogFileNotFound { file_number: u32 },

    #[error("Log corrupted at LSN {lsn}: {reason}")]
    LogCorrupted { lsn: String, reason: String },

    #[error("Log write failed: {0}")]
    LogWriteFailed(String),

    // Tree errors
    #[error("Inconsistent tree state: {0}")]
    InconsistentState(String),

    #[error("{context}: {source}")]
    Fetch {
        context: String,
        #[source]
        source: Box<LarchError>,
    },

    #[error("Duplicates are not allowed in this database")]
    DuplicatesNotAllowed,

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    // Lock errors
    #[error("Lock timeout on node {node_id}")]
    LockTimeout { node_id: u64 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LarchError {
    /// Returns true if the error indicates a broken tree invariant.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LarchError::InconsistentState(_) | LarchError::LogCorrupted { .. })
    }

    /// Returns true if the error is a missing log file.
    pub fn is_log_file_not_found(&self) -> bool {
        match self {
            LarchError::LogFileNotFound { .. } => true,
            LarchError::Fetch { source, .. } => source.is_log_file_not_found(),
            _ => false,
        }
    }
}
