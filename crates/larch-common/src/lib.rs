//! larch common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all larch components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EnvironmentConfig, MAX_COMPACT_FILE_OFFSET};
pub use error::{LarchError, Result};
pub use types::{compare_keys, compare_with, DatabaseId, KeyComparator, NodeId, Sequence, TxnId};
