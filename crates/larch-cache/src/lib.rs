//! Cache bookkeeping for larch.
//!
//! This crate provides:
//! - Memory budget counters and node overhead constants
//! - The resident node list walked by eviction and subtree removal
//! - A per-environment generation clock for eviction order

mod budget;
mod generation;
mod in_list;

pub use budget::{
    byte_array_size, MemoryBudget, ACCUMULATED_LIMIT, ARRAY_ITEM_OVERHEAD, BIN_FIXED_OVERHEAD,
    BYTE_ARRAY_OVERHEAD, DBIN_FIXED_OVERHEAD, DIN_FIXED_OVERHEAD, DUPCOUNTLN_OVERHEAD,
    IN_FIXED_OVERHEAD, KEY_OVERHEAD, LN_OVERHEAD, LONG_LIST_PER_ITEM_OVERHEAD, LONG_OVERHEAD,
    MAPLN_OVERHEAD,
};
pub use generation::Generation;
pub use in_list::{InList, MajorLatch};
