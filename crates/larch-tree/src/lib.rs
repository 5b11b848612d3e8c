//! Latch-coupled B+Tree for larch.
//!
//! This crate provides:
//! - Upper and bottom tree nodes with packed LSN slot arrays
//! - Duplicate trees nested under a single main tree slot
//! - Searches, inserts with preemptive splits, parent discovery and pruning
//! - Full and delta logging of nodes through the larch log
//! - Record locks, lockers and cursor registration on bottom nodes
//! - The compressor queue and the evictor

mod bin_delta;
mod bin_ref;
mod child_ref;
pub mod codec;
mod compressor;
pub mod constants;
mod cursor;
mod env;
mod evictor;
mod in_node;
mod latch;
mod ln;
mod lsn_array;
mod node;
mod slots;
mod tree;
mod txn;

pub use bin_delta::{BinDelta, DeltaInfo};
pub use bin_ref::BinReference;
pub use child_ref::{ChildReference, ParentInfo};
pub use compressor::{Compressor, CompressorStats};
pub use cursor::{CursorHandle, CursorPosition, TreeCursor};
pub use env::{Database, DatabaseConfig, Environment};
pub use evictor::{Evictor, EvictorStats};
pub use in_node::{generate_level, BinState, DinState, EvictionType, In, InKind, InsertOutcome};
pub use latch::{ExclusiveLatch, NodeGuard, NodeRef, SharedLatch};
pub use ln::{Ln, LnKind};
pub use lsn_array::LsnArray;
pub use node::{NodeKind, Target};
pub use slots::SlotArray;
pub use tree::{BinBoundary, Flow, RetrySignal, SearchResult, SearchType, Tree, TreeLocation, TreeStats};
pub use txn::{LockGrant, LockResult, LockTable, LockType, Locker, WriteLockInfo};
