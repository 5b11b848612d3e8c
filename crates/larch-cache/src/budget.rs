//! Memory accounting for resident tree nodes.
//!
//! Nodes compute their own footprint from the overhead constants below and
//! report changes in batches. The budget only keeps the totals; eviction
//! policy lives with the tree.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Fixed overhead of an upper internal node.
pub const IN_FIXED_OVERHEAD: i64 = 472;
/// Fixed overhead of a bottom internal node.
pub const BIN_FIXED_OVERHEAD: i64 = 528;
/// Fixed overhead of a duplicate tree internal node.
pub const DIN_FIXED_OVERHEAD: i64 = 536;
/// Fixed overhead of a duplicate tree bottom internal node.
pub const DBIN_FIXED_OVERHEAD: i64 = 544;
/// Overhead of a leaf node, excluding its data.
pub const LN_OVERHEAD: i64 = 32;
/// Overhead of a duplicate count leaf node.
pub const DUPCOUNTLN_OVERHEAD: i64 = 40;
/// Overhead of a catalog leaf node.
pub const MAPLN_OVERHEAD: i64 = 776;
/// Overhead of an array slot holding a reference.
pub const ARRAY_ITEM_OVERHEAD: i64 = 8;
/// Overhead of a byte array, covering up to 4 bytes of data.
pub const BYTE_ARRAY_OVERHEAD: i64 = 24;
/// Overhead of a boxed 64-bit value.
pub const LONG_OVERHEAD: i64 = 24;
/// Overhead of a separately allocated key.
pub const KEY_OVERHEAD: i64 = 24;
/// Per-item overhead of a list of LSNs.
pub const LONG_LIST_PER_ITEM_OVERHEAD: i64 = 32;

/// Node size changes smaller than this are accumulated locally before being
/// applied to the shared counter.
pub const ACCUMULATED_LIMIT: i64 = 1000;

/// Returns the accounted size of a byte array of `len` bytes.
///
/// The base overhead covers 4 bytes of data; larger arrays grow in 8 byte
/// increments.
pub fn byte_array_size(len: usize) -> i64 {
    let mut size = BYTE_ARRAY_OVERHEAD;
    if len > 4 {
        size += ((len as i64 - 4 + 7) / 8) * 8;
    }
    size
}

/// Shared memory counters for one environment.
#[derive(Debug)]
pub struct MemoryBudget {
    max_memory: AtomicU64,
    tree_memory_usage: AtomicI64,
    lock_memory_usage: AtomicI64,
}

impl MemoryBudget {
    /// Creates a budget with the given cache size in bytes.
    pub fn new(max_memory: u64) -> Self {
        Self {
            max_memory: AtomicU64::new(max_memory),
            tree_memory_usage: AtomicI64::new(0),
            lock_memory_usage: AtomicI64::new(0),
        }
    }

    /// Applies a change in tree node memory.
    pub fn update_tree_memory_usage(&self, delta: i64) {
        self.tree_memory_usage.fetch_add(delta, Ordering::Relaxed);
    }

    /// Applies a change in lock table memory.
    pub fn update_lock_memory_usage(&self, delta: i64) {
        self.lock_memory_usage.fetch_add(delta, Ordering::Relaxed);
    }

    /// Returns the bytes used by resident tree nodes.
    pub fn tree_memory_usage(&self) -> i64 {
        self.tree_memory_usage.load(Ordering::Relaxed)
    }

    /// Returns the bytes used by the lock table.
    pub fn lock_memory_usage(&self) -> i64 {
        self.lock_memory_usage.load(Ordering::Relaxed)
    }

    /// Returns the total accounted usage.
    pub fn cache_memory_usage(&self) -> i64 {
        self.tree_memory_usage() + self.lock_memory_usage()
    }

    /// Returns the configured cache size.
    pub fn max_memory(&self) -> u64 {
        self.max_memory.load(Ordering::Relaxed)
    }

    /// Changes the cache size.
    pub fn set_max_memory(&self, max_memory: u64) {
        self.max_memory.store(max_memory, Ordering::Relaxed);
    }

    /// Returns how many bytes must be freed to get back under budget.
    pub fn bytes_over_budget(&self) -> i64 {
        (self.cache_memory_usage() - self.max_memory() as i64).max(0)
    }

    /// Returns true if usage exceeds the cache size.
    pub fn is_over_budget(&self) -> bool {
        self.bytes_over_budget() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_array_size() {
        assert_eq!(byte_array_size(0), BYTE_ARRAY_OVERHEAD);
        assert_eq!(byte_array_size(4), BYTE_ARRAY_OVERHEAD);
        assert_eq!(byte_array_size(5), BYTE_ARRAY_OVERHEAD + 8);
        assert_eq!(byte_array_size(12), BYTE_ARRAY_OVERHEAD + 8);
        assert_eq!(byte_array_size(13), BYTE_ARRAY_OVERHEAD + 16);
    }

    #[test]
    fn test_usage_tracking() {
        let budget = MemoryBudget::new(1000);
        budget.update_tree_memory_usage(600);
        budget.update_lock_memory_usage(100);
        assert_eq!(budget.cache_memory_usage(), 700);
        assert!(!budget.is_over_budget());

        budget.update_tree_memory_usage(500);
        assert_eq!(budget.bytes_over_budget(), 200);
        assert!(budget.is_over_budget());

        budget.update_tree_memory_usage(-500);
        assert_eq!(budget.tree_memory_usage(), 600);
    }

    #[test]
    fn test_set_max_memory() {
        let budget = MemoryBudget::new(10);
        budget.update_tree_memory_usage(20);
        assert!(budget.is_over_budget());
        budget.set_max_memory(100);
        assert!(!budget.is_over_budget());
    }
}
