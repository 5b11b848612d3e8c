//! Checks and bookkeeping for removing whole subtrees.

use super::In;
use crate::latch::NodeRef;
use crate::node::Target;
use larch_cache::MajorLatch;
use larch_common::{LarchError, Result};

impl In {
    /// True if the subtree rooted here holds no live record.
    ///
    /// Bottom nodes ignore known deleted slots but refuse while cursors are
    /// on them. A single remaining child is examined recursively; a leaf
    /// child always makes the subtree undeletable.
    pub fn is_valid_for_delete(&mut self) -> Result<bool> {
        let valid_index = if self.is_bin() {
            let live: Vec<usize> = (0..self.n_entries())
                .filter(|&i| !self.is_entry_known_deleted(i))
                .collect();
            if live.len() > 1 || self.n_cursors() > 0 {
                return Ok(false);
            }
            live.first().copied()
        } else {
            match self.n_entries() {
                0 => None,
                1 => Some(0),
                _ => return Ok(false),
            }
        };

        match valid_index {
            None => Ok(true),
            Some(idx) => self.child_is_valid_for_delete(idx),
        }
    }

    /// True if slot `index` is past the end or its subtree may be removed.
    pub fn validate_subtree_before_delete(&mut self, index: usize) -> Result<bool> {
        if index >= self.n_entries() {
            return Ok(true);
        }
        self.child_is_valid_for_delete(index)
    }

    fn child_is_valid_for_delete(&mut self, idx: usize) -> Result<bool> {
        let child = match self.fetch_target(idx)? {
            None => return Ok(false),
            Some(Target::Leaf(ln)) => return Ok(ln.is_valid_for_delete()),
            Some(Target::Node(node)) => node.clone(),
        };
        let mut child = child.latch();
        child.is_valid_for_delete()
    }

    /// Unregisters every node of a detached subtree and counts its logged
    /// versions obsolete. The caller holds the resident list's major latch.
    pub(crate) fn account_for_subtree_removal(&mut self, in_list: &mut MajorLatch<'_, NodeRef>) -> Result<()> {
        if !self.is_bin() && self.n_entries() > 1 {
            return Err(LarchError::InconsistentState(format!(
                "found non-deletable node {} while removing a subtree, n_entries = {}",
                self.node_id,
                self.n_entries()
            )));
        }

        if in_list
            .remove(self.node_id, self.budgeted_memory_size())
            .is_some()
        {
            self.in_list_resident = false;
        }
        let log = self.env().log().clone();
        if !self.last_full_version.is_null() {
            log.count_obsolete_node(self.last_full_version, Some(self.node_kind().log_type()), 0);
        }
        let last_delta = self.last_delta_version();
        if !last_delta.is_null() {
            log.count_obsolete_node(last_delta, self.node_kind().delta_log_type(), 0);
        }
        self.flush_provisional_obsolete();

        for i in 0..self.n_entries() {
            let child = if self.is_bin() {
                self.child_node(i)
            } else {
                self.fetch_child_node(i)?
            };
            if let Some(child) = child {
                child.latch().account_for_subtree_removal(in_list)?;
            }
        }
        Ok(())
    }
}
