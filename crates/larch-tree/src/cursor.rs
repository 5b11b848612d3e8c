//! Tree cursors.
//!
//! A cursor's position is shared between the cursor and the bottom nodes it
//! is registered with, so splits, inserts and duplicate tree creation can
//! move it while holding only the node latches. A node keeps a handle for
//! every cursor that was ever registered with it; handles whose position has
//! since moved elsewhere are stale and are skipped and pruned lazily.

use crate::latch::{ExclusiveLatch, NodeRef};
use crate::txn::Locker;
use larch_common::NodeId;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CURSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Where a cursor points.
#[derive(Debug, Default, Clone)]
pub struct CursorPosition {
    /// Main tree BIN.
    pub bin: Option<NodeRef>,
    /// Slot in `bin`.
    pub index: usize,
    /// DBIN when positioned inside a duplicate tree.
    pub dup_bin: Option<NodeRef>,
    /// Slot in `dup_bin`.
    pub dup_index: usize,
    /// BIN the cursor is leaving; adjustments of that BIN skip the cursor.
    pub bin_to_be_removed: Option<NodeRef>,
    /// DBIN the cursor is leaving.
    pub dup_bin_to_be_removed: Option<NodeRef>,
}

/// Shared handle to a cursor position, held by bottom nodes.
#[derive(Debug, Clone)]
pub struct CursorHandle {
    id: u64,
    position: Arc<Mutex<CursorPosition>>,
}

impl CursorHandle {
    fn new() -> Self {
        Self {
            id: NEXT_CURSOR_ID.fetch_add(1, Ordering::Relaxed),
            position: Arc::new(Mutex::new(CursorPosition::default())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Locks the position. Never held while latching a node.
    pub fn position(&self) -> MutexGuard<'_, CursorPosition> {
        self.position.lock()
    }

    /// Returns true if the cursor is positioned on `node_id`, as its BIN or,
    /// with `dup` set, as its DBIN.
    pub fn is_on(&self, node_id: NodeId, dup: bool) -> bool {
        let pos = self.position.lock();
        let on = if dup { &pos.dup_bin } else { &pos.bin };
        on.as_ref().is_some_and(|n| n.node_id() == node_id)
    }
}

/// A cursor over one tree, owned by a locker.
pub struct TreeCursor {
    handle: CursorHandle,
    locker: Arc<Locker>,
}

impl TreeCursor {
    pub fn new(locker: Arc<Locker>) -> Self {
        Self {
            handle: CursorHandle::new(),
            locker,
        }
    }

    pub fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    pub fn handle(&self) -> &CursorHandle {
        &self.handle
    }

    pub fn bin(&self) -> Option<NodeRef> {
        self.handle.position().bin.clone()
    }

    pub fn index(&self) -> usize {
        self.handle.position().index
    }

    pub fn dup_bin(&self) -> Option<NodeRef> {
        self.handle.position().dup_bin.clone()
    }

    pub fn dup_index(&self) -> usize {
        self.handle.position().dup_index
    }

    /// Positions the cursor on a slot of a latched BIN, leaving any DBIN.
    pub fn update_bin(&self, bin: &mut ExclusiveLatch, index: usize) {
        let node = NodeRef::from_latch(bin);
        {
            let mut pos = self.handle.position();
            if let Some(dup_bin) = pos.dup_bin.take() {
                pos.dup_bin_to_be_removed = Some(dup_bin);
            }
            pos.dup_index = 0;
            if pos.bin.as_ref() != Some(&node) {
                pos.bin_to_be_removed = pos.bin.take();
                pos.bin = Some(node);
            }
            pos.index = index;
        }
        bin.add_cursor(self.handle.clone());
    }

    /// Positions the cursor on a slot of a latched DBIN.
    pub fn update_dbin(&self, dup_bin: &mut ExclusiveLatch, index: usize) {
        let node = NodeRef::from_latch(dup_bin);
        {
            let mut pos = self.handle.position();
            if pos.dup_bin.as_ref() != Some(&node) {
                pos.dup_bin_to_be_removed = pos.dup_bin.take();
                pos.dup_bin = Some(node);
            }
            pos.dup_index = index;
        }
        dup_bin.add_cursor(self.handle.clone());
    }

    /// Latches the cursor's BIN, following it if a split moves the cursor
    /// while waiting for the latch.
    pub fn latch_bin(&self) -> Option<ExclusiveLatch> {
        loop {
            let bin = self.bin()?;
            let latch = bin.latch();
            if self.bin().as_ref() == Some(&bin) {
                return Some(latch);
            }
        }
    }

    /// Latches the cursor's DBIN.
    pub fn latch_dbin(&self) -> Option<ExclusiveLatch> {
        loop {
            let dup_bin = self.dup_bin()?;
            let latch = dup_bin.latch();
            if self.dup_bin().as_ref() == Some(&dup_bin) {
                return Some(latch);
            }
        }
    }

    /// Unpositions the cursor. Nodes drop its handle lazily.
    pub fn close(&self) {
        *self.handle.position() = CursorPosition::default();
    }
}

impl Drop for TreeCursor {
    fn drop(&mut self) {
        self.close();
    }
}
