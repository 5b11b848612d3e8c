//! Bottom node behavior: registered cursors, compression of deleted slots,
//! leaf eviction.

use super::{In, InKind};
use crate::bin_ref::BinReference;
use crate::cursor::{CursorHandle, CursorPosition};
use crate::latch::{ExclusiveLatch, NodeRef};
use crate::node::{NodeKind, Target};
use crate::txn::{LockType, Locker};
use larch_common::Result;
use larch_log::Lsn;
use tracing::trace;

/// State shared by BINs and DBINs.
#[derive(Debug)]
pub struct BinState {
    pub(super) cursors: Vec<CursorHandle>,
    pub(super) last_delta_version: Lsn,
    pub(super) num_deltas_since_last_full: u32,
    pub(super) prohibit_next_delta: bool,
}

impl Default for BinState {
    fn default() -> Self {
        Self {
            cursors: Vec::new(),
            last_delta_version: Lsn::NULL,
            num_deltas_since_last_full: 0,
            prohibit_next_delta: false,
        }
    }
}

/// What the evictor may do with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionType {
    MayNotEvict,
    /// Only the resident leaves may go.
    MayEvictLns,
    MayEvictNode,
}

/// Slot fields of a cursor position, for the BIN or the DBIN side.
fn side(pos: &mut CursorPosition, dup: bool) -> (&mut Option<NodeRef>, &mut usize, &Option<NodeRef>) {
    if dup {
        (&mut pos.dup_bin, &mut pos.dup_index, &pos.dup_bin_to_be_removed)
    } else {
        (&mut pos.bin, &mut pos.index, &pos.bin_to_be_removed)
    }
}

// ============================================================================
// Cursors
// ============================================================================

impl In {
    pub(crate) fn bin_state(&self) -> Option<&BinState> {
        match &self.kind {
            InKind::Bottom(bin) | InKind::DupBottom { bin, .. } => Some(bin),
            _ => None,
        }
    }

    pub(crate) fn bin_state_mut(&mut self) -> Option<&mut BinState> {
        match &mut self.kind {
            InKind::Bottom(bin) | InKind::DupBottom { bin, .. } => Some(bin),
            _ => None,
        }
    }

    fn is_dup_bottom(&self) -> bool {
        self.node_kind() == NodeKind::Dbin
    }

    /// Registers a cursor positioned on this node. Handles of cursors that
    /// have moved elsewhere are dropped.
    pub fn add_cursor(&mut self, handle: CursorHandle) {
        self.prune_cursors();
        if let Some(bin) = self.bin_state_mut() {
            if !bin.cursors.iter().any(|h| h.id() == handle.id()) {
                bin.cursors.push(handle);
            }
        }
    }

    pub fn remove_cursor(&mut self, handle: &CursorHandle) {
        if let Some(bin) = self.bin_state_mut() {
            bin.cursors.retain(|h| h.id() != handle.id());
        }
    }

    fn prune_cursors(&mut self) {
        let node_id = self.node_id;
        let dup = self.is_dup_bottom();
        if let Some(bin) = self.bin_state_mut() {
            bin.cursors.retain(|h| h.is_on(node_id, dup));
        }
    }

    /// Handles of the cursors currently positioned on this node.
    pub fn cursors(&self) -> Vec<CursorHandle> {
        let dup = self.is_dup_bottom();
        self.bin_state().map_or_else(Vec::new, |bin| {
            bin.cursors
                .iter()
                .filter(|h| h.is_on(self.node_id, dup))
                .cloned()
                .collect()
        })
    }

    pub fn n_cursors(&self) -> usize {
        self.cursors().len()
    }

    /// Moves the cursors on slots `low..high`, which were just moved to
    /// `sibling`, onto the sibling. When `low` is zero the remaining cursors
    /// shift left by the number of moved slots.
    pub fn adjust_cursors(&mut self, sibling: &mut ExclusiveLatch, low: usize, high: usize) {
        if self.bin_state().is_none() {
            return;
        }
        let dup = self.is_dup_bottom();
        let sibling_ref = NodeRef::from_latch(sibling);
        let this_id = self.node_id;
        let delta = high - low;
        let mut moved = Vec::new();

        for handle in self.cursors() {
            let mut pos = handle.position();
            let (node, index, to_be_removed) = side(&mut pos, dup);
            if to_be_removed.as_ref().is_some_and(|n| n.node_id() == this_id) {
                continue;
            }
            if low == 0 {
                if *index < high {
                    *node = Some(sibling_ref.clone());
                    moved.push(handle.clone());
                } else {
                    *index -= delta;
                }
            } else if *index >= low {
                *node = Some(sibling_ref.clone());
                *index -= low;
                moved.push(handle.clone());
            }
        }

        if let Some(bin) = self.bin_state_mut() {
            bin.cursors.retain(|h| !moved.iter().any(|m| m.id() == h.id()));
        }
        for handle in moved {
            sibling.add_cursor(handle);
        }
    }

    /// Shifts cursors at or after a newly inserted slot.
    pub fn adjust_cursors_for_insert(&mut self, insert_index: usize) {
        let dup = self.is_dup_bottom();
        for handle in self.cursors() {
            let mut pos = handle.position();
            let (_, index, _) = side(&mut pos, dup);
            if insert_index <= *index {
                *index += 1;
            }
        }
    }

    /// Moves the cursors on slot `bin_index` into a new duplicate tree,
    /// onto slot `dup_index` of `dup_bin`.
    pub fn adjust_cursors_for_mutation(
        &mut self,
        bin_index: usize,
        dup_bin: &mut ExclusiveLatch,
        dup_index: usize,
        exclude: Option<&CursorHandle>,
    ) {
        let dup_bin_ref = NodeRef::from_latch(dup_bin);
        for handle in self.cursors() {
            if exclude.is_some_and(|e| e.id() == handle.id()) {
                continue;
            }
            let on_slot = {
                let mut pos = handle.position();
                if pos.index == bin_index {
                    pos.dup_bin = Some(dup_bin_ref.clone());
                    pos.dup_index = dup_index;
                    true
                } else {
                    false
                }
            };
            if on_slot {
                dup_bin.add_cursor(handle);
            }
        }
    }

    pub(crate) fn set_prohibit_next_delta(&mut self) {
        if let Some(bin) = self.bin_state_mut() {
            bin.prohibit_next_delta = true;
        }
    }

    /// Compressor queue reference naming this node.
    pub fn create_reference(&self) -> BinReference {
        match &self.kind {
            InKind::DupBottom { dup_key, .. } => BinReference::new_dup(
                self.node_id,
                self.database.id(),
                self.identifier_key.clone(),
                dup_key.clone(),
            ),
            _ => BinReference::new(self.node_id, self.database.id(), self.identifier_key.clone()),
        }
    }
}

// ============================================================================
// Compression
// ============================================================================

impl In {
    /// Removes deleted slots.
    ///
    /// With a reference only the slots it names (or that are flagged
    /// deleted) are examined. A slot goes when its child is gone, when it
    /// is known deleted and no one holds a lock on the child, or when its
    /// leaf is deleted and unlocked. Slots whose locks are held stay, and
    /// the reference is queued again. Returns true if it was requeued.
    ///
    /// Upper nodes and nodes with cursors are left alone.
    pub fn compress(&mut self, mut bin_ref: Option<&mut BinReference>, can_fetch: bool) -> Result<bool> {
        if !self.is_bin() {
            return Ok(false);
        }
        if self.n_cursors() > 0 {
            if let Some(bin_ref) = bin_ref {
                self.env().compressor().add_bin_ref_to_queue(bin_ref.clone());
                return Ok(true);
            }
            return Ok(false);
        }

        let env = self.env().clone();
        let locker = Locker::basic(&env);
        let mut any_locks_denied = false;
        let mut set_new_id_key = false;
        let result = self.compress_slots(
            bin_ref.as_deref_mut(),
            can_fetch,
            &locker,
            &mut any_locks_denied,
            &mut set_new_id_key,
        );
        locker.operation_end()?;
        let removed = result?;

        let mut requeued = false;
        if any_locks_denied {
            if let Some(bin_ref) = bin_ref {
                env.compressor().add_bin_ref_to_queue(bin_ref.clone());
                requeued = true;
            }
        }
        if self.n_entries() != 0 && set_new_id_key {
            self.set_identifier_key(self.key(0).to_vec());
        }
        if self.n_entries() == 0 {
            self.set_generation(0);
        }
        if removed > 0 {
            trace!(node_id = %self.node_id, removed, requeued, "compressed");
        }
        Ok(requeued)
    }

    fn compress_slots(
        &mut self,
        mut bin_ref: Option<&mut BinReference>,
        can_fetch: bool,
        locker: &Locker,
        any_locks_denied: &mut bool,
        set_new_id_key: &mut bool,
    ) -> Result<usize> {
        let mut removed = 0;
        let mut i = 0;
        while i < self.n_entries() {
            let examine = match bin_ref.as_deref() {
                None => true,
                Some(r) => {
                    self.is_entry_pending_deleted(i)
                        || self.is_entry_known_deleted(i)
                        || r.has_deleted_key(self.key(i))
                }
            };
            if !examine {
                i += 1;
                continue;
            }

            // (child node id, deleted flag when the child is a leaf)
            let child = if can_fetch {
                self.fetch_target(i)?
                    .map(|t| (t.node_id(), t.as_ln().map(|ln| ln.is_deleted())))
            } else {
                match self.target(i) {
                    Some(t) => Some((t.node_id(), t.as_ln().map(|ln| ln.is_deleted()))),
                    None => {
                        i += 1;
                        continue;
                    }
                }
            };

            let delete = match child {
                None => true,
                Some((node_id, ln_deleted)) => {
                    if self.is_entry_known_deleted(i) {
                        if locker.non_blocking_lock(node_id, LockType::Read)?.is_denied() {
                            *any_locks_denied = true;
                            i += 1;
                            continue;
                        }
                        true
                    } else if let Some(deleted) = ln_deleted {
                        if locker.non_blocking_lock(node_id, LockType::Read)?.is_denied() {
                            *any_locks_denied = true;
                            i += 1;
                            continue;
                        }
                        deleted
                    } else {
                        false
                    }
                }
            };

            if !delete {
                i += 1;
                continue;
            }

            let key = self.key(i).to_vec();
            if self.compare_keys(&key, &self.identifier_key).is_eq() {
                *set_new_id_key = true;
            }
            if self.database.is_deferred_write() {
                let lsn = self.lsn(i);
                if !lsn.is_null() && self.ln(i).is_some_and(|ln| ln.is_dirty()) {
                    self.env().log().count_obsolete_node(lsn, None, 0);
                }
            }
            self.delete_entry(i);
            removed += 1;
            if let Some(r) = bin_ref.as_deref_mut() {
                r.remove_deleted_key(&key);
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// Eviction
// ============================================================================

impl In {
    /// Drops every evictable resident leaf, logging dirty ones first in a
    /// deferred write database. Nothing happens while cursors are on the
    /// node. Returns the memory released.
    pub fn evict_lns(&mut self) -> Result<i64> {
        if self.n_cursors() > 0 {
            return Ok(0);
        }
        let mut removed = 0;
        for i in 0..self.n_entries() {
            removed += self.evict_internal(i)?;
        }
        Ok(removed)
    }

    /// Drops the leaf of slot `idx` if it is evictable.
    pub fn evict_ln(&mut self, idx: usize) -> Result<i64> {
        self.evict_internal(idx)
    }

    fn evict_internal(&mut self, idx: usize) -> Result<i64> {
        let dirty = match self.target(idx) {
            Some(Target::Leaf(ln)) if !self.is_migrate(idx) && ln.is_evictable() => ln.is_dirty(),
            _ => return Ok(0),
        };
        if dirty && self.database.is_deferred_write() {
            self.log_dirty_ln(idx, true)?;
        }
        let released = self
            .set_target(idx, None)
            .map_or(0, |t| t.memory_size_included_by_parent());
        Ok(released)
    }

    /// Logs the dirty leaf of slot `idx` and stores its new LSN.
    pub(super) fn log_dirty_ln(&mut self, idx: usize, background_io: bool) -> Result<()> {
        let db = self.database.clone();
        let key = self.key(idx).to_vec();
        let obsolete = obsolete_lsn_for_deferred_write(self.lsn(idx));
        let lsn = self.with_ln_mut(idx, |ln| ln.log(&db, &key, None, obsolete, 0, None, background_io, false));
        if let Some(lsn) = lsn {
            self.update_entry_lsn(idx, lsn?);
        }
        Ok(())
    }

    /// Logs every dirty resident leaf. Used before a deferred write
    /// database's bottom node is written.
    pub(super) fn log_dirty_lns(&mut self) -> Result<()> {
        for i in 0..self.n_entries() {
            if self.ln(i).is_some_and(|ln| ln.is_dirty()) {
                self.log_dirty_ln(i, false)?;
            }
        }
        Ok(())
    }

    pub fn has_resident_children(&self) -> bool {
        (0..self.n_entries()).any(|i| matches!(self.target(i), Some(Target::Node(_))))
    }

    pub fn is_eviction_prohibited(&self) -> bool {
        if self.is_bin() {
            self.n_cursors() > 0
        } else {
            self.is_db_root()
                && ((self.database.is_deferred_write() && self.dirty) || self.database.id().is_catalog())
        }
    }

    fn has_pinned_children(&self) -> bool {
        match self.node_kind() {
            NodeKind::Dbin => false,
            _ => self.has_resident_children(),
        }
    }

    /// True if the node may be detached from its parent.
    pub fn is_evictable(&self) -> bool {
        if self.is_eviction_prohibited() || self.has_pinned_children() {
            return false;
        }
        !(0..self.n_entries()).any(|i| self.lsn(i).is_null() && self.target(i).is_none())
    }

    pub fn eviction_type(&self) -> EvictionType {
        if self.is_eviction_prohibited() {
            EvictionType::MayNotEvict
        } else {
            self.child_eviction_type()
        }
    }

    fn child_eviction_type(&self) -> EvictionType {
        if !self.is_bin() {
            return if self.has_resident_children() {
                EvictionType::MayNotEvict
            } else {
                EvictionType::MayEvictNode
            };
        }
        let mut ret = EvictionType::MayEvictNode;
        for i in 0..self.n_entries() {
            match self.target(i) {
                None => {}
                Some(Target::Node(_)) => return EvictionType::MayNotEvict,
                Some(Target::Leaf(ln)) => {
                    if ln.is_evictable() && !self.is_migrate(i) {
                        ret = EvictionType::MayEvictLns;
                    } else {
                        return EvictionType::MayNotEvict;
                    }
                }
            }
        }
        ret
    }
}

/// A deferred write leaf's earlier version may have been logged in any
/// earlier flush, so only its file is known.
fn obsolete_lsn_for_deferred_write(lsn: Lsn) -> Lsn {
    if lsn.is_null() {
        Lsn::NULL
    } else {
        Lsn::new(lsn.file_number(), 0)
    }
}
