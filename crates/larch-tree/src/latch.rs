//! Node handles and latches.
//!
//! Every internal node lives behind an `Arc<RwLock<In>>`. Latch coupling
//! needs to hold a child's latch after the parent's guard is gone, so the
//! guards are the owned `arc_lock` flavor and never borrow from a parent.
//! Bottom nodes and duplicate tree nodes are only ever latched exclusively;
//! upper internal nodes may be latched shared during plain searches.

use crate::in_node::In;
use crate::node::NodeKind;
use larch_common::{LarchError, NodeId, Result};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// An owned exclusive latch on a node.
pub type ExclusiveLatch = ArcRwLockWriteGuard<RawRwLock, In>;

/// An owned shared latch on a node.
pub type SharedLatch = ArcRwLockReadGuard<RawRwLock, In>;

/// Shared handle to a resident internal node.
///
/// The id and kind are copied out of the node at creation so callers can
/// identify a child without latching it.
#[derive(Clone)]
pub struct NodeRef {
    id: NodeId,
    kind: NodeKind,
    shared_ok: bool,
    cell: Arc<RwLock<In>>,
}

impl NodeRef {
    /// Wraps a freshly built node.
    pub fn new(node: In) -> Self {
        let id = node.node_id();
        let kind = node.node_kind();
        let shared_ok = kind == NodeKind::Internal && node.env().config().shared_internal_latches;
        Self {
            id,
            kind,
            shared_ok,
            cell: Arc::new(RwLock::new(node)),
        }
    }

    /// Recovers the handle of a latched node.
    pub fn from_latch(latch: &ExclusiveLatch) -> Self {
        let cell = ArcRwLockWriteGuard::rwlock(latch).clone();
        Self::from_cell(latch.node_id(), latch.node_kind(), latch.shares_latch(), cell)
    }

    fn from_cell(id: NodeId, kind: NodeKind, shared_ok: bool, cell: Arc<RwLock<In>>) -> Self {
        Self {
            id,
            kind,
            shared_ok,
            cell,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Latches the node exclusively.
    pub fn latch(&self) -> ExclusiveLatch {
        self.cell.write_arc()
    }

    /// Latches the node exclusively and optionally bumps its generation.
    pub fn latch_with_generation(&self, update_generation: bool) -> ExclusiveLatch {
        let latch = self.latch();
        if update_generation {
            latch.touch_generation();
        }
        latch
    }

    /// Latches the node shared if its kind allows it, else exclusively.
    pub fn latch_shared(&self, update_generation: bool) -> NodeGuard {
        let guard = if self.shared_ok {
            NodeGuard::Shared(self.cell.read_arc())
        } else {
            NodeGuard::Exclusive(self.cell.write_arc())
        };
        if update_generation {
            guard.touch_generation();
        }
        guard
    }

    /// Latches the node exclusively if it is free right now.
    pub fn latch_no_wait(&self) -> Option<ExclusiveLatch> {
        self.cell.try_write_arc()
    }

    /// Returns true if both handles name the same resident node.
    pub fn same_node(&self, other: &NodeRef) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_node(other)
    }
}

impl Eq for NodeRef {}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A latch held in either mode.
pub enum NodeGuard {
    Shared(SharedLatch),
    Exclusive(ExclusiveLatch),
}

impl NodeGuard {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, NodeGuard::Exclusive(_))
    }

    /// Mutable access, only possible under an exclusive latch.
    pub fn get_mut(&mut self) -> Result<&mut In> {
        match self {
            NodeGuard::Exclusive(latch) => Ok(&mut **latch),
            NodeGuard::Shared(latch) => Err(LarchError::InconsistentState(format!(
                "node {} is latched shared but must be modified",
                latch.node_id()
            ))),
        }
    }

    /// Returns the handle of the latched node.
    pub fn node_ref(&self) -> NodeRef {
        match self {
            NodeGuard::Exclusive(latch) => NodeRef::from_latch(latch),
            NodeGuard::Shared(latch) => {
                let cell = ArcRwLockReadGuard::rwlock(latch).clone();
                NodeRef::from_cell(latch.node_id(), latch.node_kind(), true, cell)
            }
        }
    }

    /// Returns the exclusive latch, failing for a shared one.
    pub fn into_exclusive(self) -> Result<ExclusiveLatch> {
        match self {
            NodeGuard::Exclusive(latch) => Ok(latch),
            NodeGuard::Shared(latch) => Err(LarchError::InconsistentState(format!(
                "node {} is latched shared where an exclusive latch is required",
                latch.node_id()
            ))),
        }
    }
}

impl Deref for NodeGuard {
    type Target = In;

    fn deref(&self) -> &In {
        match self {
            NodeGuard::Shared(latch) => latch,
            NodeGuard::Exclusive(latch) => latch,
        }
    }
}

impl From<ExclusiveLatch> for NodeGuard {
    fn from(latch: ExclusiveLatch) -> Self {
        NodeGuard::Exclusive(latch)
    }
}
