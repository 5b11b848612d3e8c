//! Identifier types and key comparison shared by all larch crates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Unique identifier of a tree node.
///
/// Ids are assigned from a per-environment sequence and survive
/// serialization, so a node fetched back from the log keeps its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Placeholder for nodes that do not carry an id yet.
    pub const INVALID: NodeId = NodeId(u64::MAX);

    /// Returns true if this id was assigned by a sequence.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a database within an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct DatabaseId(pub u32);

impl DatabaseId {
    /// The catalog database that maps ids to database roots.
    pub const ID_DB: DatabaseId = DatabaseId(0);
    /// The catalog database that maps names to ids.
    pub const NAME_DB: DatabaseId = DatabaseId(1);

    /// Returns true for the two catalog databases.
    pub fn is_catalog(&self) -> bool {
        *self == Self::ID_DB || *self == Self::NAME_DB
    }
}

impl std::fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "db{}", self.0)
    }
}

/// Transaction identifier. Zero is reserved for non-transactional lockers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Id used by lockers that are not transactions.
    pub const NONE: TxnId = TxnId(0);
}

/// Monotonic id source. Node ids and transaction ids each get one.
#[derive(Debug, Default)]
pub struct Sequence {
    next: AtomicU64,
}

impl Sequence {
    /// Creates a sequence starting at `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Returns the next value.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Returns the value the next call would hand out.
    pub fn peek(&self) -> u64 {
        self.next.load(AtomicOrdering::Relaxed)
    }

    /// Bumps the sequence so it never hands out `seen` or anything below it.
    pub fn advance_past(&self, seen: u64) {
        self.next.fetch_max(seen.saturating_add(1), AtomicOrdering::Relaxed);
    }
}

/// User supplied key ordering.
pub type KeyComparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Key comparison using u64 prefix for 8+ byte keys.
/// Falls back to slice comparison for shorter keys or when prefix matches.
#[inline(always)]
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() >= 8 && b.len() >= 8 {
        let a_prefix = u64::from_be_bytes([a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]]);
        let b_prefix = u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        if a_prefix != b_prefix {
            return a_prefix.cmp(&b_prefix);
        }
        if a.len() == 8 && b.len() == 8 {
            return Ordering::Equal;
        }
    }
    a.cmp(b)
}

/// Compares two keys with an optional custom comparator.
#[inline]
pub fn compare_with(comparator: Option<&KeyComparator>, a: &[u8], b: &[u8]) -> Ordering {
    match comparator {
        Some(cmp) => cmp(a, b),
        None => compare_keys(a, b),
    }
}
