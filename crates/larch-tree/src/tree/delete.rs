//! Record deletion and removal of emptied subtrees.
//!
//! Deleting a record only marks its slot: the leaf is logged deleted and
//! the slot pending deleted, and the BIN is handed to the compressor once
//! the locker ends. The compressor removes the slots, and when a BIN runs
//! empty it prunes the branch above it with [`Tree::delete`] or
//! [`Tree::delete_dup`].
//!
//! Pruning walks down the path of the emptied node and detaches it below
//! the lowest ancestor with more than one slot. The removal is logged
//! before the latches are released.

use super::insert::{lock_dup_count_ln, lock_latched, CursorLevel, SlotContent};
use super::stats::TreeCounters;
use super::{Flow, RetrySignal, SearchType, Tree};
use crate::child_ref::ChildReference;
use crate::codec::DeleteInfo;
use crate::cursor::TreeCursor;
use crate::in_node::In;
use crate::latch::{ExclusiveLatch, NodeGuard, NodeRef};
use crate::node::Target;
use crate::txn::{LockResult, LockType, Locker};
use larch_common::{compare_with, LarchError, Result};
use larch_log::Lsn;
use tracing::{debug, trace};

/// One latched node on the path to a deletable subtree, and its slot in
/// the node above.
struct LadderStep {
    child: ExclusiveLatch,
    index: usize,
}

/// Descends from `top` along `key` to the bottom node.
///
/// The bottom node must be empty and free of cursors. Returns the path
/// below the lowest node that has more than one slot; its last step is the
/// subtree to detach. An empty path means every node down from `top` has
/// a single slot.
fn search_deletable_sub_tree(top: &mut In, key: &[u8]) -> Result<Flow<Vec<LadderStep>>> {
    let mut ladder: Vec<LadderStep> = Vec::new();
    let mut lowest_multiple = None;
    loop {
        let depth = ladder.len();
        let parent: &mut In = match ladder.last_mut() {
            Some(step) => &mut *step.child,
            None => &mut *top,
        };
        if parent.is_bin() || parent.n_entries() == 0 {
            break;
        }
        if parent.n_entries() > 1 {
            lowest_multiple = Some(depth);
        }
        let index = parent.find_entry(key, false, false).max(0) as usize;
        let child = parent.fetch_required_child(index)?.latch();
        ladder.push(LadderStep { child, index });
    }

    if let Some(bottom) = ladder.last() {
        if bottom.child.is_bin() {
            if bottom.child.n_entries() != 0 {
                return Ok(Flow::Retry(RetrySignal::NodeNotEmpty));
            }
            if bottom.child.n_cursors() > 0 {
                return Ok(Flow::Retry(RetrySignal::CursorsExist));
            }
        }
    }

    match lowest_multiple {
        Some(depth) => ladder.truncate(depth + 1),
        None => ladder.clear(),
    }
    Ok(Flow::Done(ladder))
}

/// Removes the last step of `ladder` from the node above it.
fn detach(top: &mut In, ladder: &mut [LadderStep]) -> Result<()> {
    let Some((last, above)) = ladder.split_last_mut() else {
        return Ok(());
    };
    let parent: &mut In = match above.last_mut() {
        Some(step) => &mut *step.child,
        None => top,
    };
    if !parent.delete_entry(last.index) {
        return Err(LarchError::InconsistentState(format!(
            "slot {} of node {} vanished while detaching node {}",
            last.index,
            parent.node_id(),
            last.child.node_id()
        )));
    }
    Ok(())
}

/// Logs every node above the detached subtree, bottom-up, pointing each
/// parent at its child's new version. Returns the new LSN of `top`.
fn cascade_updates(top: &mut In, ladder: &mut [LadderStep]) -> Result<Lsn> {
    let mut new_lsn = Lsn::NULL;
    for depth in (0..ladder.len()).rev() {
        let index = ladder[depth].index;
        let parent: &mut In = match depth.checked_sub(1) {
            Some(above) => &mut *ladder[above].child,
            None => &mut *top,
        };
        if !new_lsn.is_null() {
            parent.update_entry_lsn(index, new_lsn);
        }
        new_lsn = parent.optional_log()?;
    }
    Ok(new_lsn)
}

impl Tree {
    // ------------------------------------------------------------------------
    // Pruning
    // ------------------------------------------------------------------------

    /// Removes the emptied main tree BIN whose identifier key is `id_key`,
    /// with every ancestor left without slots.
    ///
    /// A tree that would lose its root is only removed when the
    /// environment purges roots.
    pub fn delete(&self, id_key: &[u8]) -> Result<Flow<()>> {
        let mut root_needs_updating = false;
        let subtree: Option<NodeRef>;
        {
            let mut root = self.root.write();
            let Some(root_node) = self.fetch_root(&mut root)? else {
                return Ok(Flow::Done(()));
            };
            let mut root_in = root_node.latch();
            let mut ladder = match search_deletable_sub_tree(&mut root_in, id_key)? {
                Flow::Done(ladder) => ladder,
                Flow::Retry(signal) => return Ok(Flow::Retry(signal)),
            };

            if ladder.is_empty() {
                subtree = if self.database.env().config().compressor_purge_root {
                    self.log_tree_removal(&mut root, &root_node, &mut root_in)?
                } else {
                    None
                };
                root_needs_updating = subtree.is_some();
            } else {
                detach(&mut root_in, &mut ladder)?;
                let lsn = cascade_updates(&mut root_in, &mut ladder)?;
                if root_in.is_db_root() {
                    if let Some(reference) = root.as_mut() {
                        reference.update_lsn_after_optional_log(&self.database, lsn);
                    }
                    root_needs_updating = true;
                }
                subtree = ladder.last().map(|step| NodeRef::from_latch(&step.child));
            }
        }

        let Some(subtree) = subtree else {
            return Ok(Flow::Done(()));
        };
        if root_needs_updating {
            self.optional_modify_db_root()?;
        }
        self.account_for_subtree_removal(&subtree)?;
        Ok(Flow::Done(()))
    }

    /// Drops the whole tree if nothing but empty nodes hangs off the root.
    fn log_tree_removal(
        &self,
        root: &mut Option<ChildReference>,
        root_node: &NodeRef,
        root_in: &mut In,
    ) -> Result<Option<NodeRef>> {
        if root_in.n_entries() > 1 || !root_in.validate_subtree_before_delete(0)? {
            return Ok(None);
        }
        DeleteInfo {
            db_id: self.database.id(),
            deleted_node_id: root_in.node_id(),
            deleted_id_key: root_in.identifier_key().to_vec(),
            dup_key: None,
        }
        .optional_log(&self.database)?;
        *root = None;
        TreeCounters::bump(&self.counters.roots_deleted);
        debug!(db_id = %self.database.id(), root = %root_in.node_id(), "removed tree root");
        Ok(Some(root_node.clone()))
    }

    /// Removes the emptied DBIN whose identifier key is `id_key` from the
    /// duplicate tree of `main_key`. A duplicate tree left without records
    /// is removed from its BIN.
    pub fn delete_dup(&self, id_key: &[u8], main_key: &[u8]) -> Result<Flow<()>> {
        let Some(guard) = self.search(main_key, SearchType::Normal, None, None, false)? else {
            return Ok(Flow::Done(()));
        };
        let mut bin = guard.into_exclusive()?;
        let found = bin.find_entry(main_key, false, true);
        if found < 0 {
            return Ok(Flow::Done(()));
        }
        let subtree = match self.delete_dup_subtree(id_key, &mut bin, found as usize)? {
            Flow::Done(subtree) => subtree,
            Flow::Retry(signal) => return Ok(Flow::Retry(signal)),
        };
        drop(bin);
        if let Some(subtree) = subtree {
            self.account_for_subtree_removal(&subtree)?;
        }
        Ok(Flow::Done(()))
    }

    fn delete_dup_subtree(&self, id_key: &[u8], bin: &mut ExclusiveLatch, index: usize) -> Result<Flow<Option<NodeRef>>> {
        let dup_root_ref = match bin.fetch_target(index)? {
            Some(Target::Node(node)) => node.clone(),
            // The slot holds a single record again.
            _ => return Ok(Flow::Done(None)),
        };
        let mut dup_root = dup_root_ref.latch();

        // A locker on the count leaf may still use the tree.
        let locker = Locker::basic(self.database.env());
        let dcl_id = dup_root.fetch_dup_count_ln()?.node_id();
        if locker.non_blocking_lock(dcl_id, LockType::Read)?.is_denied() {
            return Ok(Flow::Retry(RetrySignal::CursorsExist));
        }

        let mut ladder = match search_deletable_sub_tree(&mut dup_root, id_key)? {
            Flow::Done(ladder) => ladder,
            Flow::Retry(signal) => return Ok(Flow::Retry(signal)),
        };

        if ladder.is_empty() {
            if bin.n_cursors() > 0 {
                return Ok(Flow::Retry(RetrySignal::CursorsExist));
            }
            if !bin.delete_entry(index) {
                return Err(LarchError::InconsistentState(format!(
                    "duplicate tree slot {} of node {} vanished",
                    index,
                    bin.node_id()
                )));
            }
            DeleteInfo {
                db_id: self.database.id(),
                deleted_node_id: dup_root.node_id(),
                deleted_id_key: dup_root.main_tree_key().to_vec(),
                dup_key: dup_root.dup_tree_key().map(<[u8]>::to_vec),
            }
            .optional_log(&self.database)?;
            if bin.n_entries() == 0 {
                self.database
                    .env()
                    .compressor()
                    .add_bin_ref_to_queue(bin.create_reference());
            }
            debug!(bin = %bin.node_id(), dup_root = %dup_root.node_id(), "removed duplicate tree");
            return Ok(Flow::Done(Some(dup_root_ref)));
        }

        detach(&mut dup_root, &mut ladder)?;
        let lsn = cascade_updates(&mut dup_root, &mut ladder)?;
        bin.update_entry_lsn(index, lsn);
        Ok(Flow::Done(ladder.last().map(|step| NodeRef::from_latch(&step.child))))
    }

    /// Unregisters a detached subtree. No node latch may be held.
    fn account_for_subtree_removal(&self, subtree: &NodeRef) -> Result<()> {
        let env = self.database.env();
        let mut in_list = env.in_list().latch_major();
        subtree.latch().account_for_subtree_removal(&mut in_list)?;
        drop(in_list);
        TreeCounters::bump(&self.counters.subtrees_deleted);
        debug!(db_id = %self.database.id(), subtree = %subtree.node_id(), "deleted subtree");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------------

    /// Deletes the record under `key`.
    ///
    /// With `data`, only the record (or duplicate) carrying equal data is
    /// deleted; without, every duplicate of the key goes. Returns how many
    /// records were deleted. The slots are compressed once the cursor's
    /// locker ends.
    pub fn delete_record(&self, key: &[u8], data: Option<&[u8]>, cursor: &TreeCursor) -> Result<usize> {
        let Some(guard) = self.search(key, SearchType::Normal, None, None, true)? else {
            return Ok(0);
        };
        let mut bin = guard.into_exclusive()?;
        let found = bin.find_entry(key, false, true);
        if found < 0 {
            return Ok(0);
        }
        let index = found as usize;
        cursor.update_bin(&mut bin, index);

        match SlotContent::inspect(&mut bin, index)? {
            SlotContent::Empty => Ok(0),
            SlotContent::Leaf { node_id, .. } => {
                let (mut bin, index, lock) =
                    lock_latched(cursor, bin, index, CursorLevel::Bin, node_id, LockType::Write)?;
                if SlotContent::inspect(&mut bin, index)?.is_deleted() {
                    return Ok(0);
                }
                if let Some(data) = data {
                    if !self.leaf_data_equals(&bin, index, data) {
                        return Ok(0);
                    }
                }
                let slot_key = bin.key(index).to_vec();
                self.delete_slot_ln(&mut bin, index, slot_key, None, &lock, cursor.locker())?;
                Ok(1)
            }
            SlotContent::DupTree => match data {
                Some(data) => self.delete_duplicate(bin, index, key, data, cursor),
                None => {
                    drop(bin);
                    let mut deleted = 0;
                    for data in self.get_duplicates(key)? {
                        deleted += self.delete_record(key, Some(&data), cursor)?;
                    }
                    Ok(deleted)
                }
            },
        }
    }

    fn leaf_data_equals(&self, node: &In, index: usize, data: &[u8]) -> bool {
        node.ln(index).and_then(|ln| ln.data()).is_some_and(|current| {
            compare_with(self.database.duplicate_comparator(), current, data).is_eq()
        })
    }

    /// Deletes the duplicate `data` from the duplicate tree at slot `index`.
    fn delete_duplicate(
        &self,
        bin: ExclusiveLatch,
        index: usize,
        key: &[u8],
        data: &[u8],
        cursor: &TreeCursor,
    ) -> Result<usize> {
        let locker = cursor.locker();
        let (bin, _, dup_root, dcl_lock) = lock_dup_count_ln(cursor, bin, index)?;
        drop(bin);

        let Some(guard) = self.search_sub_tree(NodeGuard::from(dup_root), data, SearchType::Normal, None, None, true)?
        else {
            return Ok(0);
        };
        let mut dup_bin = guard.into_exclusive()?;
        let found = dup_bin.find_entry(data, false, true);
        if found < 0 {
            return Ok(0);
        }
        let dup_index = found as usize;
        cursor.update_dbin(&mut dup_bin, dup_index);
        let SlotContent::Leaf { node_id, .. } = SlotContent::inspect(&mut dup_bin, dup_index)? else {
            return Ok(0);
        };
        let (mut dup_bin, dup_index, lock) =
            lock_latched(cursor, dup_bin, dup_index, CursorLevel::DupBin, node_id, LockType::Write)?;
        if SlotContent::inspect(&mut dup_bin, dup_index)?.is_deleted() {
            return Ok(0);
        }
        let slot_key = dup_bin.key(dup_index).to_vec();
        self.delete_slot_ln(&mut dup_bin, dup_index, slot_key, Some(key), &lock, locker)?;
        drop(dup_bin);

        // Latch order is BIN, then the duplicate root.
        let (mut bin, index) = CursorLevel::Bin.relatch(cursor)?;
        let mut dup_root = bin.fetch_required_child(index)?.latch();
        drop(bin);
        let count = dup_root.increment_duplicate_count(&dcl_lock, key, locker, false)?;
        trace!(dup_root = %dup_root.node_id(), count, "deleted duplicate");
        Ok(1)
    }

    /// Logs the leaf at `index` deleted and queues the slot for
    /// compression. The caller holds the leaf's write lock.
    fn delete_slot_ln(
        &self,
        node: &mut In,
        index: usize,
        ln_key: Vec<u8>,
        dup_key: Option<&[u8]>,
        lock: &LockResult<'_>,
        locker: &Locker,
    ) -> Result<()> {
        let old_lsn = node.lsn(index);
        lock.set_abort_lsn(old_lsn, node.is_entry_known_deleted(index));
        let db = self.database.clone();
        let new_lsn = node
            .with_ln_mut(index, |ln| ln.delete(&db, &ln_key, dup_key, old_lsn, locker))
            .ok_or_else(|| {
                LarchError::InconsistentState(format!("slot {} of node {} lost its record", index, node.node_id()))
            })??;
        node.update_entry_lsn(index, new_lsn);
        node.set_pending_deleted(index);

        let mut bin_ref = node.create_reference();
        bin_ref.add_deleted_key(ln_key);
        locker.add_deleted_bin(bin_ref);
        trace!(node_id = %node.node_id(), index, lsn = %new_lsn, "deleted record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::tree;
    use super::*;
    use crate::env::{DatabaseConfig, Environment};
    use crate::ln::Ln;
    use larch_common::EnvironmentConfig;
    use std::sync::Arc;

    fn put(tree: &Tree, key: &[u8], data: &[u8], dups: bool) {
        let env = tree.database().env();
        let cursor = TreeCursor::new(Locker::basic(env));
        assert!(tree.insert(Ln::new(env, data.to_vec()), key, dups, &cursor).unwrap());
        cursor.locker().operation_end().unwrap();
    }

    fn remove(tree: &Tree, key: &[u8], data: Option<&[u8]>) -> usize {
        let cursor = TreeCursor::new(Locker::basic(tree.database().env()));
        let deleted = tree.delete_record(key, data, &cursor).unwrap();
        cursor.locker().operation_end().unwrap();
        deleted
    }

    /// Compresses the first BIN and returns its identifier key.
    fn compress_first_bin(tree: &Tree) -> Vec<u8> {
        let mut bin = tree.get_first_node().unwrap().unwrap().into_exclusive().unwrap();
        assert!(!bin.compress(None, true).unwrap());
        bin.identifier_key().to_vec()
    }

    fn purging_tree(purge_root: bool) -> Arc<Tree> {
        let config = EnvironmentConfig {
            compressor_purge_root: purge_root,
            ..EnvironmentConfig::default().with_max_entries(4)
        };
        Environment::open(config).unwrap().open_tree(DatabaseConfig::new()).unwrap()
    }

    #[test]
    fn test_delete_record_marks_slot() {
        let tree = tree(4, DatabaseConfig::new());
        put(&tree, b"k", b"v", false);
        assert_eq!(remove(&tree, b"k", None), 1);
        assert_eq!(remove(&tree, b"k", None), 0);
        assert_eq!(remove(&tree, b"missing", None), 0);

        let bin = tree.get_first_node().unwrap().unwrap();
        assert!(bin.is_entry_pending_deleted(0));
        assert!(bin.ln(0).unwrap().is_deleted());
        drop(bin);
        assert!(tree.database().env().compressor().exists(tree.get_first_node().unwrap().unwrap().node_id()));
    }

    #[test]
    fn test_delete_record_checks_data() {
        let tree = tree(4, DatabaseConfig::new());
        put(&tree, b"k", b"v", false);
        assert_eq!(remove(&tree, b"k", Some(b"other")), 0);
        assert_eq!(remove(&tree, b"k", Some(b"v")), 1);
    }

    #[test]
    fn test_prune_emptied_bin() {
        let tree = tree(4, DatabaseConfig::new());
        for k in 0..12u8 {
            put(&tree, &[k], &[k], false);
        }
        let first_keys: Vec<Vec<u8>> = {
            let bin = tree.get_first_node().unwrap().unwrap();
            (0..bin.n_entries()).map(|i| bin.key(i).to_vec()).collect()
        };
        assert!(matches!(tree.delete(&first_keys[0]).unwrap(), Flow::Retry(RetrySignal::NodeNotEmpty)));

        for key in &first_keys {
            assert_eq!(remove(&tree, key, None), 1);
        }
        let id_key = compress_first_bin(&tree);
        assert!(tree.delete(&id_key).unwrap().is_done());
        assert_eq!(tree.stats().subtrees_deleted, 1);

        let first = tree.get_first_node().unwrap().unwrap();
        assert!(first.n_entries() > 0);
        assert_ne!(first.key(0), first_keys[0].as_slice());
        drop(first);
        tree.verify().unwrap();
        assert!(tree.validate_in_list().unwrap());
    }

    #[test]
    fn test_prune_waits_for_cursors() {
        let tree = tree(4, DatabaseConfig::new());
        for k in 0..8u8 {
            put(&tree, &[k], &[k], false);
        }
        let keys: Vec<Vec<u8>> = {
            let bin = tree.get_first_node().unwrap().unwrap();
            (0..bin.n_entries()).map(|i| bin.key(i).to_vec()).collect()
        };
        for key in &keys {
            remove(&tree, key, None);
        }
        let id_key = compress_first_bin(&tree);

        let cursor = TreeCursor::new(Locker::basic(tree.database().env()));
        let mut bin = tree.get_first_node().unwrap().unwrap().into_exclusive().unwrap();
        cursor.update_bin(&mut bin, 0);
        drop(bin);
        assert!(matches!(tree.delete(&id_key).unwrap(), Flow::Retry(RetrySignal::CursorsExist)));
        cursor.close();
        assert!(tree.delete(&id_key).unwrap().is_done());
    }

    #[test]
    fn test_root_kept_without_purge() {
        let tree = purging_tree(false);
        put(&tree, b"k", b"v", false);
        remove(&tree, b"k", None);
        let id_key = compress_first_bin(&tree);
        assert!(tree.delete(&id_key).unwrap().is_done());
        assert!(tree.root_exists());
        assert_eq!(tree.stats().roots_deleted, 0);
    }

    #[test]
    fn test_root_purged() {
        let tree = purging_tree(true);
        put(&tree, b"k", b"v", false);
        remove(&tree, b"k", None);
        let id_key = compress_first_bin(&tree);
        let map_before = tree.map_ln_lsn();
        assert!(tree.delete(&id_key).unwrap().is_done());
        assert!(!tree.root_exists());
        assert_eq!(tree.stats().roots_deleted, 1);
        assert!(tree.map_ln_lsn() > map_before);
        assert!(tree.database().env().in_list().is_empty());

        // The tree grows back from nothing.
        put(&tree, b"k", b"w", false);
        assert!(tree.root_exists());
    }

    #[test]
    fn test_delete_duplicates_and_tree() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        put(&tree, b"k", b"a", true);
        put(&tree, b"k", b"b", true);
        put(&tree, b"z", b"z", true);
        assert_eq!(remove(&tree, b"k", None), 2);
        assert!(tree.get_duplicates(b"k").unwrap().is_empty());

        let mut bin = tree.get_first_node().unwrap().unwrap().into_exclusive().unwrap();
        let dup_root = bin.fetch_required_child(0).unwrap();
        drop(bin);
        let mut dup_root = dup_root.latch();
        assert_eq!(dup_root.duplicate_count().unwrap(), 0);
        let mut dup_bin = tree.get_first_dup_node(dup_root).unwrap().unwrap();
        assert!(!dup_bin.compress(None, true).unwrap());
        assert_eq!(dup_bin.n_entries(), 0);
        let id_key = dup_bin.identifier_key().to_vec();
        drop(dup_bin);

        assert!(tree.delete_dup(&id_key, b"k").unwrap().is_done());
        let bin = tree.get_first_node().unwrap().unwrap();
        assert_eq!(bin.n_entries(), 1);
        assert_eq!(bin.key(0), b"z");
        drop(bin);
        assert_eq!(tree.stats().subtrees_deleted, 1);
        assert!(tree.validate_in_list().unwrap());
    }

    #[test]
    fn test_delete_single_duplicate() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        for d in [b"a", b"b", b"c"] {
            put(&tree, b"k", d, true);
        }
        assert_eq!(remove(&tree, b"k", Some(b"b")), 1);
        assert_eq!(remove(&tree, b"k", Some(b"b")), 0);
        assert_eq!(tree.get_duplicates(b"k").unwrap(), vec![b"a".to_vec(), b"c".to_vec()]);
    }
}
