//! Configuration structures for larch.

use crate::error::{LarchError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest file offset the compact LSN encoding can hold.
pub const MAX_COMPACT_FILE_OFFSET: u64 = 0xFF_FFFE;

/// Environment-wide tuning for the tree, compressor, evictor and log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Maximum slots per main tree node.
    pub node_max_entries: usize,
    /// Maximum slots per duplicate tree node.
    pub node_max_dup_tree_entries: usize,
    /// Percent of a BIN's slots that may change before a full version is logged.
    pub bin_delta_percent: u32,
    /// Consecutive deltas allowed before a full BIN is logged.
    pub bin_max_deltas: u32,
    /// Remove an empty tree's root during compression.
    pub compressor_purge_root: bool,
    /// Lock timeout used by the compressor, in milliseconds.
    pub compressor_lock_timeout_ms: u64,
    /// Default transactional lock timeout in milliseconds (0 = wait forever).
    pub lock_timeout_ms: u64,
    /// Cache budget for tree nodes, in bytes.
    pub max_memory: u64,
    /// Nodes examined per evictor scan.
    pub evictor_nodes_per_scan: usize,
    /// Allow shared latches on upper internal nodes.
    pub shared_internal_latches: bool,
    /// Bytes per log file before rolling to the next file number.
    pub log_file_max: u64,
    /// Directory for log files. `None` keeps the log in memory.
    pub log_dir: Option<PathBuf>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            node_max_entries: 128,
            node_max_dup_tree_entries: 128,
            bin_delta_percent: 25,
            bin_max_deltas: 10,
            compressor_purge_root: false,
            compressor_lock_timeout_ms: 500,
            lock_timeout_ms: 500,
            max_memory: 64 * 1024 * 1024, // 64 MB
            evictor_nodes_per_scan: 10,
            shared_internal_latches: true,
            log_file_max: 10 * 1024 * 1024, // 10 MB
            log_dir: None,
        }
    }
}

impl EnvironmentConfig {
    /// Checks parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if self.node_max_entries < 2 {
            return Err(invalid("node_max_entries", self.node_max_entries));
        }
        if self.node_max_dup_tree_entries < 2 {
            return Err(invalid(
                "node_max_dup_tree_entries",
                self.node_max_dup_tree_entries,
            ));
        }
        if self.bin_delta_percent > 75 {
            return Err(invalid("bin_delta_percent", self.bin_delta_percent));
        }
        if self.log_file_max == 0 || self.log_file_max > MAX_COMPACT_FILE_OFFSET {
            return Err(invalid("log_file_max", self.log_file_max));
        }
        if self.evictor_nodes_per_scan == 0 {
            return Err(invalid("evictor_nodes_per_scan", self.evictor_nodes_per_scan));
        }
        Ok(())
    }

    /// Small node sizes so tests exercise splits with few keys.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.node_max_entries = max_entries;
        self.node_max_dup_tree_entries = max_entries;
        self
    }
}

fn invalid(name: &str, value: impl ToString) -> LarchError {
    LarchError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_config_defaults() {
        let config = EnvironmentConfig::default();
        assert_eq!(config.node_max_entries, 128);
        assert_eq!(config.node_max_dup_tree_entries, 128);
        assert_eq!(config.bin_delta_percent, 25);
        assert_eq!(config.bin_max_deltas, 10);
        assert!(!config.compressor_purge_root);
        assert!(config.shared_internal_latches);
        assert!(config.log_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_nodes() {
        let config = EnvironmentConfig::default().with_max_entries(1);
        assert!(matches!(
            config.validate(),
            Err(LarchError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_oversized_log_files() {
        let config = EnvironmentConfig {
            log_file_max: MAX_COMPACT_FILE_OFFSET + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = EnvironmentConfig::default().with_max_entries(4);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EnvironmentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node_max_entries, 4);
        assert_eq!(parsed.node_max_dup_tree_entries, 4);
        assert_eq!(parsed.bin_delta_percent, config.bin_delta_percent);
    }
}
