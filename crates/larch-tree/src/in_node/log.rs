//! Writing internal nodes to the log.
//!
//! A node is logged in full, or, for a bottom node whose last full version
//! is recent enough, as a delta holding only the slots changed since. A
//! provisional log hands the replaced version to the parent, which counts
//! it obsolete when the parent itself is logged non-provisionally.

use super::In;
use crate::bin_delta::BinDelta;
use crate::codec;
use crate::node::NodeKind;
use larch_cache::LONG_LIST_PER_ITEM_OVERHEAD;
use larch_common::{LarchError, Result};
use larch_log::Lsn;
use tracing::trace;

impl In {
    /// Logs a full version.
    pub fn log(&mut self) -> Result<Lsn> {
        self.log_internal(false, false, false, None)
    }

    /// Logs a full version provisionally on behalf of `parent`.
    pub fn log_provisional(&mut self, parent: Option<&mut In>) -> Result<Lsn> {
        self.log_internal(false, true, false, parent)
    }

    /// Logs the node, allowing a delta for bottom nodes.
    pub fn log_allowing_deltas(&mut self, provisional: bool, parent: Option<&mut In>) -> Result<Lsn> {
        self.log_internal(true, provisional, false, parent)
    }

    /// Logs unless the database defers writes, in which case NULL is
    /// returned and the node stays dirty.
    pub fn optional_log(&mut self) -> Result<Lsn> {
        if self.database.is_deferred_write() {
            return Ok(Lsn::NULL);
        }
        self.log()
    }

    pub fn optional_log_provisional(&mut self, parent: Option<&mut In>) -> Result<Lsn> {
        if self.database.is_deferred_write() {
            return Ok(Lsn::NULL);
        }
        self.log_provisional(parent)
    }

    /// Logs every dirty resident descendant bottom-up, provisionally, and
    /// points this node's slots at the new versions.
    pub fn log_dirty_children(&mut self, allow_deltas: bool) -> Result<()> {
        for i in 0..self.n_entries() {
            let Some(child) = self.child_node(i) else {
                continue;
            };
            let mut child = child.latch();
            if !child.is_dirty() {
                continue;
            }
            child.log_dirty_children(allow_deltas)?;
            let lsn = child.log_internal(allow_deltas, true, true, Some(&mut *self))?;
            self.update_entry_lsn(i, lsn);
        }
        Ok(())
    }

    pub fn last_delta_version(&self) -> Lsn {
        self.bin_state().map_or(Lsn::NULL, |bin| bin.last_delta_version)
    }

    /// Deltas logged since the last full version.
    pub fn num_deltas_since_last_full(&self) -> u32 {
        self.bin_state().map_or(0, |bin| bin.num_deltas_since_last_full)
    }

    /// Restores the delta chain of a node rebuilt from a delta.
    pub(crate) fn set_delta_state(&mut self, last_delta: Lsn, num_deltas: u32) {
        if let Some(bin) = self.bin_state_mut() {
            bin.last_delta_version = last_delta;
            bin.num_deltas_since_last_full = num_deltas;
        }
    }

    pub(crate) fn log_internal(
        &mut self,
        allow_deltas: bool,
        provisional: bool,
        background_io: bool,
        parent: Option<&mut In>,
    ) -> Result<Lsn> {
        match self.node_kind() {
            NodeKind::Bin | NodeKind::Dbin => {
                if self.database.is_deferred_write() {
                    self.log_dirty_lns()?;
                }
                if allow_deltas && self.may_log_delta() {
                    let delta = BinDelta::from_bin(self);
                    if self.delta_small_enough(delta.len()) {
                        return self.log_delta(&delta, background_io);
                    }
                }
                let old_delta = self.last_delta_version();
                let lsn = self.log_full(provisional, background_io, parent, old_delta)?;
                if let Some(bin) = self.bin_state_mut() {
                    bin.last_delta_version = Lsn::NULL;
                    bin.num_deltas_since_last_full = 0;
                    bin.prohibit_next_delta = false;
                }
                Ok(lsn)
            }
            NodeKind::Din => {
                self.log_dirty_dup_count_ln()?;
                self.log_full(provisional, background_io, parent, Lsn::NULL)
            }
            NodeKind::Internal => self.log_full(provisional, background_io, parent, Lsn::NULL),
        }
    }

    fn may_log_delta(&self) -> bool {
        !self.last_full_version.is_null()
            && !self.database.is_deferred_write()
            && self.bin_state().is_some_and(|bin| !bin.prohibit_next_delta)
    }

    fn delta_small_enough(&self, num_deltas: usize) -> bool {
        let max_diffs = self.n_entries() * self.database.bin_delta_percent() as usize / 100;
        let since_full = self
            .bin_state()
            .map_or(u32::MAX, |bin| bin.num_deltas_since_last_full);
        num_deltas <= max_diffs && since_full < self.database.bin_max_deltas()
    }

    fn log_delta(&mut self, delta: &BinDelta, background_io: bool) -> Result<Lsn> {
        let kind = self.node_kind();
        let entry_type = kind.delta_log_type().ok_or_else(|| {
            LarchError::InconsistentState(format!("{:?} node {} cannot log a delta", kind, self.node_id))
        })?;
        let old_delta = self.last_delta_version();
        let lsn = self.env().log().log(
            entry_type,
            codec::write_bin_delta(delta),
            false,
            background_io,
            old_delta,
            0,
        )?;
        if let Some(bin) = self.bin_state_mut() {
            bin.last_delta_version = lsn;
            bin.num_deltas_since_last_full += 1;
            bin.prohibit_next_delta = false;
        }
        self.dirty = false;
        trace!(node_id = %self.node_id, lsn = %lsn, slots = delta.len(), "logged delta");
        Ok(lsn)
    }

    fn log_full(
        &mut self,
        provisional: bool,
        background_io: bool,
        parent: Option<&mut In>,
        old_delta: Lsn,
    ) -> Result<Lsn> {
        let payload = codec::write_in(self);
        let old_lsn = if provisional {
            Lsn::NULL
        } else {
            self.last_full_version
        };
        let lsn = self.env().log().log(
            self.node_kind().log_type(),
            payload,
            provisional,
            background_io,
            old_lsn,
            0,
        )?;

        if provisional {
            if let Some(parent) = parent {
                let last_full = self.last_full_version;
                parent.track_provisional_obsolete(self, last_full, old_delta);
            }
        } else {
            if !old_delta.is_null() {
                self.env()
                    .log()
                    .count_obsolete_node(old_delta, self.node_kind().delta_log_type(), 0);
            }
            self.flush_provisional_obsolete();
        }

        self.last_full_version = lsn;
        self.dirty = false;
        self.clear_slot_dirty_bits();
        Ok(lsn)
    }

    /// Takes over the child's pending obsolete versions and adds up to two
    /// more, to be counted when this node is logged non-provisionally.
    pub(crate) fn track_provisional_obsolete(&mut self, child: &mut In, obsolete1: Lsn, obsolete2: Lsn) {
        let mut mem_delta = 0;
        if !child.provisional_obsolete.is_empty() {
            let moved = std::mem::take(&mut child.provisional_obsolete);
            let child_mem = moved.len() as i64 * LONG_LIST_PER_ITEM_OVERHEAD;
            child.change_memory_size(-child_mem);
            mem_delta += child_mem;
            self.provisional_obsolete.extend(moved);
        }
        for lsn in [obsolete1, obsolete2] {
            if !lsn.is_null() {
                self.provisional_obsolete.push(lsn);
                mem_delta += LONG_LIST_PER_ITEM_OVERHEAD;
            }
        }
        if mem_delta != 0 {
            self.change_memory_size(mem_delta);
        }
    }

    /// Counts the pending obsolete versions now that this node's new
    /// version is durable.
    pub(crate) fn flush_provisional_obsolete(&mut self) {
        if self.provisional_obsolete.is_empty() {
            return;
        }
        let obsolete = std::mem::take(&mut self.provisional_obsolete);
        self.env().log().count_obsolete_nodes(&obsolete);
        self.change_memory_size(-(obsolete.len() as i64 * LONG_LIST_PER_ITEM_OVERHEAD));
    }

    pub fn provisional_obsolete(&self) -> &[Lsn] {
        &self.provisional_obsolete
    }
}
