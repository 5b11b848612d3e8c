//! Node splits.
//!
//! A split moves the half of a node that does not hold its identifier key
//! into a new sibling of the same kind and level, and adds the sibling to
//! the parent. Both halves are logged provisionally, then the parent is
//! logged. The caller holds the parent latch, which has room for one more
//! slot, and the latch of the node being split.

use super::In;
use crate::child_ref::ChildReference;
use crate::constants::{EXACT_MATCH, INDEX_MASK};
use crate::latch::{ExclusiveLatch, NodeRef};
use crate::node::Target;
use larch_common::{LarchError, Result};
use tracing::debug;

impl In {
    /// Splits `this`, the child at `child_index` of `parent`, in half.
    pub fn split(
        this: &mut ExclusiveLatch,
        parent: &mut In,
        child_index: usize,
        max_entries: usize,
    ) -> Result<()> {
        Self::split_internal(this, parent, child_index, max_entries, None)
    }

    /// Splits `this` so that a run of ascending (or descending, with
    /// `left_side`) inserts at the edge of the tree leaves full nodes behind.
    /// When `key` falls at the outer edge only one slot moves to the sibling.
    pub fn split_special(
        this: &mut ExclusiveLatch,
        parent: &mut In,
        child_index: usize,
        max_entries: usize,
        key: &[u8],
        left_side: bool,
    ) -> Result<()> {
        let n = this.n_entries();
        let split_index = if this.is_bin() {
            let found = this.find_entry(key, true, false);
            let exact = found >= 0 && found & EXACT_MATCH != 0;
            let index = if found >= 0 { found & INDEX_MASK } else { found };
            if left_side && index < 0 {
                Some(1)
            } else if !left_side && !exact && index == n as i32 - 1 {
                Some(n - 1)
            } else {
                None
            }
        } else {
            let index = this.find_entry(key, false, false);
            if left_side && index == 0 {
                Some(1)
            } else if !left_side && index == n as i32 - 1 {
                Some(n - 1)
            } else {
                None
            }
        };
        Self::split_internal(this, parent, child_index, max_entries, split_index)
    }

    fn split_internal(
        this: &mut ExclusiveLatch,
        parent: &mut In,
        child_index: usize,
        max_entries: usize,
        split_index: Option<usize>,
    ) -> Result<()> {
        let n = this.n_entries();
        if n < 2 {
            return Err(LarchError::InconsistentState(format!(
                "cannot split node {} with {} entries",
                this.node_id, n
            )));
        }
        let id_key = this.identifier_key.clone();
        let id_key_index = this.find_entry(&id_key, false, false);
        let split_index = split_index.unwrap_or(n / 2);

        let (low, high) = if id_key_index < split_index as i32 {
            (split_index, n)
        } else {
            (0, split_index)
        };
        let new_id_key = this.key(low).to_vec();

        let sibling_ref = NodeRef::new(this.create_new_instance(new_id_key.clone(), max_entries, this.level));
        let mut sibling = sibling_ref.latch();

        let mut deleted_ref = None;
        for entry in this.take_entries(low, high) {
            if entry.is_pending_deleted() {
                deleted_ref
                    .get_or_insert_with(|| sibling.create_reference())
                    .add_deleted_key(entry.key().to_vec());
            }
            let (target, key, lsn, state) = entry.into_parts();
            let to = sibling.n_entries();
            sibling.set_entry(to, target, key, lsn, state)?;
        }
        if let Some(bin_ref) = deleted_ref {
            this.env().compressor().add_bin_ref_to_queue(bin_ref);
        }
        this.dirty = true;
        this.adjust_cursors(&mut sibling, low, high);

        let sibling_lsn = sibling.optional_log_provisional(Some(&mut *parent))?;
        let my_lsn = this.optional_log_provisional(Some(&mut *parent))?;
        let this_ref = NodeRef::from_latch(this);

        if low == 0 {
            let sibling_target = Some(Target::Node(sibling_ref.clone()));
            if child_index == 0 {
                parent.update_entry_compare_key(child_index, sibling_target, sibling_lsn, &new_id_key);
            } else {
                parent.update_entry_target_lsn(child_index, sibling_target, sibling_lsn);
            }
            let entry = ChildReference::new(Some(Target::Node(this_ref)), this.key(0).to_vec(), my_lsn);
            if !parent.insert_entry(entry)? {
                return Err(split_insert_failed(parent, this));
            }
        } else {
            let this_target = Some(Target::Node(this_ref));
            if child_index == 0 {
                parent.update_entry_compare_key(child_index, this_target, my_lsn, this.key(0));
            } else {
                parent.update_entry_target_lsn(child_index, this_target, my_lsn);
            }
            let entry = ChildReference::new(Some(Target::Node(sibling_ref.clone())), new_id_key, sibling_lsn);
            if !parent.insert_entry(entry)? {
                return Err(split_insert_failed(parent, this));
            }
        }

        let parent_lsn = parent.optional_log()?;
        // The grandparent's slot still names the parent's previous version.
        parent.dirty = true;

        let current = this.in_memory_size;
        let computed = this.compute_memory_size();
        this.update_memory_size(current, computed);
        let env = this.env().clone();
        env.add_to_in_list(&mut sibling, &sibling_ref);

        debug!(
            parent = %parent.node_id,
            node = %this.node_id,
            sibling = %sibling.node_id,
            parent_lsn = %parent_lsn,
            lsn = %my_lsn,
            sibling_lsn = %sibling_lsn,
            split_index,
            id_key_index,
            child_index,
            "split"
        );
        Ok(())
    }
}

fn split_insert_failed(parent: &In, this: &In) -> LarchError {
    LarchError::InconsistentState(format!(
        "parent {} already holds the key of split node {}",
        parent.node_id, this.node_id
    ))
}
