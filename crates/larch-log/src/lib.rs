//! Append-only log for larch.
//!
//! Every tree node version is written here and addressed by its LSN.
//! Nodes that are not resident in memory are fetched back by LSN.

pub mod constants;
pub mod file_manager;
pub mod manager;
pub mod record;
pub mod tracker;

pub use file_manager::FileLogManager;
pub use manager::{LogManager, MemoryLogManager, SharedLogManager};
pub use record::{LogEntryType, LogRecord, Lsn};
pub use tracker::{FileSummary, UtilizationTracker};
