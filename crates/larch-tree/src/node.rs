//! Node kinds, slot targets, and fetching nodes back from the log.

use crate::bin_delta::BinDelta;
use crate::codec;
use crate::env::Database;
use crate::in_node::In;
use crate::latch::NodeRef;
use crate::ln::Ln;
use larch_cache::{BIN_FIXED_OVERHEAD, DBIN_FIXED_OVERHEAD, DIN_FIXED_OVERHEAD, IN_FIXED_OVERHEAD};
use larch_common::{LarchError, NodeId, Result};
use larch_log::{LogEntryType, Lsn};
use std::sync::Arc;
use tracing::trace;

/// The four internal node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Upper node of a main tree.
    Internal,
    /// Bottom node of a main tree. Slots hold leaf nodes or duplicate roots.
    Bin,
    /// Upper node of a duplicate tree.
    Din,
    /// Bottom node of a duplicate tree. Slots hold leaf nodes.
    Dbin,
}

impl NodeKind {
    /// Returns true for the two bottom kinds.
    pub fn is_bin(self) -> bool {
        matches!(self, NodeKind::Bin | NodeKind::Dbin)
    }

    /// Returns true for nodes of a duplicate tree.
    pub fn contains_duplicates(self) -> bool {
        matches!(self, NodeKind::Din | NodeKind::Dbin)
    }

    /// Returns true if a node of this kind may sit above a node sought by
    /// a parent search.
    pub fn can_be_ancestor(self, target_contains_duplicates: bool) -> bool {
        match self {
            NodeKind::Internal | NodeKind::Din => true,
            NodeKind::Bin => target_contains_duplicates,
            NodeKind::Dbin => false,
        }
    }

    /// Log entry type of a full version.
    pub fn log_type(self) -> LogEntryType {
        match self {
            NodeKind::Internal => LogEntryType::In,
            NodeKind::Bin => LogEntryType::Bin,
            NodeKind::Din => LogEntryType::Din,
            NodeKind::Dbin => LogEntryType::Dbin,
        }
    }

    /// Log entry type of a delta, for bottom kinds.
    pub fn delta_log_type(self) -> Option<LogEntryType> {
        match self {
            NodeKind::Bin => Some(LogEntryType::BinDelta),
            NodeKind::Dbin => Some(LogEntryType::DupBinDelta),
            _ => None,
        }
    }

    /// Kind stored under a full version log entry type.
    pub fn from_log_type(entry_type: LogEntryType) -> Option<Self> {
        match entry_type {
            LogEntryType::In => Some(NodeKind::Internal),
            LogEntryType::Bin => Some(NodeKind::Bin),
            LogEntryType::Din => Some(NodeKind::Din),
            LogEntryType::Dbin => Some(NodeKind::Dbin),
            _ => None,
        }
    }

    /// Accounted size of the node object itself.
    pub fn fixed_overhead(self) -> i64 {
        match self {
            NodeKind::Internal => IN_FIXED_OVERHEAD,
            NodeKind::Bin => BIN_FIXED_OVERHEAD,
            NodeKind::Din => DIN_FIXED_OVERHEAD,
            NodeKind::Dbin => DBIN_FIXED_OVERHEAD,
        }
    }
}

/// What a slot points at when its child is resident.
#[derive(Debug)]
pub enum Target {
    /// An internal node.
    Node(NodeRef),
    /// A leaf node, owned by the slot.
    Leaf(Box<Ln>),
}

impl Target {
    pub fn node_id(&self) -> NodeId {
        match self {
            Target::Node(node) => node.node_id(),
            Target::Leaf(ln) => ln.node_id(),
        }
    }

    pub fn as_node(&self) -> Option<&NodeRef> {
        match self {
            Target::Node(node) => Some(node),
            Target::Leaf(_) => None,
        }
    }

    pub fn as_ln(&self) -> Option<&Ln> {
        match self {
            Target::Leaf(ln) => Some(ln),
            Target::Node(_) => None,
        }
    }

    pub fn as_ln_mut(&mut self) -> Option<&mut Ln> {
        match self {
            Target::Leaf(ln) => Some(ln),
            Target::Node(_) => None,
        }
    }

    /// Returns true for a duplicate tree root or a duplicate count leaf.
    pub fn contains_duplicates(&self) -> bool {
        match self {
            Target::Node(node) => node.kind().contains_duplicates(),
            Target::Leaf(ln) => ln.contains_duplicates(),
        }
    }

    /// Memory charged to the parent for holding this target. Internal nodes
    /// account for themselves.
    pub fn memory_size_included_by_parent(&self) -> i64 {
        match self {
            Target::Node(_) => 0,
            Target::Leaf(ln) => ln.memory_size_included_by_parent(),
        }
    }

    /// Returns true if eviction may drop this target from its slot.
    pub fn is_evictable(&self) -> bool {
        match self {
            Target::Node(_) => true,
            Target::Leaf(ln) => ln.is_evictable(),
        }
    }
}

/// Reads the node logged at `lsn` and makes it resident.
///
/// Internal nodes are registered in the environment's resident list.
/// Delta entries are merged onto the full version they name.
pub(crate) fn fetch_node(db: &Arc<Database>, lsn: Lsn) -> Result<Target> {
    let record = db.env().log().get(lsn)?;
    trace!(lsn = %lsn, entry_type = ?record.entry_type, "fetching node");

    if let Some(kind) = NodeKind::from_log_type(record.entry_type) {
        let mut node = codec::read_in(db, kind, &record.payload, lsn)?;
        node.post_fetch_init(lsn);
        return Ok(Target::Node(register(node)));
    }

    match record.entry_type {
        LogEntryType::BinDelta | LogEntryType::DupBinDelta => {
            let delta: BinDelta = codec::read_bin_delta(&record.payload, lsn)?;
            let node = delta.reconstruct_bin(db, lsn)?;
            Ok(Target::Node(register(node)))
        }
        t if t.is_leaf_node() => {
            let entry = codec::read_ln(&record.payload, lsn)?;
            db.env().node_ids().advance_past(entry.ln.node_id().0);
            Ok(Target::Leaf(Box::new(entry.ln)))
        }
        other => Err(LarchError::LogCorrupted {
            lsn: lsn.to_string(),
            reason: format!("{:?} entry is not a node", other),
        }),
    }
}

fn register(node: In) -> NodeRef {
    let env = node.env().clone();
    env.node_ids().advance_past(node.node_id().0);
    let node_ref = NodeRef::new(node);
    let mut latch = node_ref.latch();
    env.add_to_in_list(&mut latch, &node_ref);
    node_ref
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classes() {
        assert!(NodeKind::Bin.is_bin());
        assert!(NodeKind::Dbin.is_bin());
        assert!(!NodeKind::Din.is_bin());
        assert!(NodeKind::Din.contains_duplicates());
        assert!(!NodeKind::Internal.contains_duplicates());
    }

    #[test]
    fn test_can_be_ancestor() {
        assert!(NodeKind::Internal.can_be_ancestor(false));
        assert!(NodeKind::Din.can_be_ancestor(false));
        assert!(!NodeKind::Bin.can_be_ancestor(false));
        assert!(NodeKind::Bin.can_be_ancestor(true));
        assert!(!NodeKind::Dbin.can_be_ancestor(true));
    }

    #[test]
    fn test_log_types() {
        for kind in [NodeKind::Internal, NodeKind::Bin, NodeKind::Din, NodeKind::Dbin] {
            assert_eq!(NodeKind::from_log_type(kind.log_type()), Some(kind));
        }
        assert_eq!(NodeKind::Bin.delta_log_type(), Some(LogEntryType::BinDelta));
        assert_eq!(NodeKind::Dbin.delta_log_type(), Some(LogEntryType::DupBinDelta));
        assert_eq!(NodeKind::Internal.delta_log_type(), None);
        assert_eq!(NodeKind::from_log_type(LogEntryType::Ln), None);
    }
}
