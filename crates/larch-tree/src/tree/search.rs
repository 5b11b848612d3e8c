//! Latch-coupled descent.
//!
//! Plain searches start from the root latched shared when upper nodes allow
//! it. While descending shared, the grandparent stays latched so that a
//! parent can be relatched exclusively to fetch a missing child; at the root
//! that is impossible and the search restarts with the root exclusive.
//!
//! Searches for inserts descend exclusively and split full nodes on the way
//! down. When a full child is met mid-descent the search backs out, and a
//! second pass from the subtree top latches the whole resident path and
//! splits every full node on it before the search is repeated.

use super::stats::TreeCounters;
use super::{Flow, RetrySignal, Tree};
use crate::constants::RELATCH_RETRIES;
use crate::in_node::In;
use crate::latch::{ExclusiveLatch, NodeGuard, NodeRef};
use crate::node::Target;
use larch_common::{LarchError, NodeId, Result};
use larch_log::Lsn;
use tracing::trace;

/// Which child a descent follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    /// The child whose key range holds the search key.
    Normal,
    /// Always the first child.
    Left,
    /// Always the last child.
    Right,
}

impl SearchType {
    fn child_index(self, node: &In, key: &[u8]) -> usize {
        match self {
            SearchType::Normal => node.find_entry(key, false, false).max(0) as usize,
            SearchType::Left => 0,
            SearchType::Right => node.n_entries().saturating_sub(1),
        }
    }
}

/// Whether the bottom node reached by a search is the first or last one of
/// the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinBoundary {
    pub is_last_bin: bool,
    pub is_first_bin: bool,
}

impl Tree {
    // ------------------------------------------------------------------------
    // Plain search
    // ------------------------------------------------------------------------

    /// Descends from the root.
    ///
    /// Returns the bottom node the search ends in, or the parent of the node
    /// named by `target` when one is met on the way. Returns `None` for an
    /// empty tree or when `target` names the root. `Left` and `Right`
    /// searches ignore `key`. The returned node is latched.
    pub fn search(
        &self,
        key: &[u8],
        search_type: SearchType,
        target: Option<NodeId>,
        boundary: Option<&mut BinBoundary>,
        update_generation: bool,
    ) -> Result<Option<NodeGuard>> {
        match self.get_root_in(update_generation)? {
            Some(root) => self.search_sub_tree(root, key, search_type, target, boundary, update_generation),
            None => Ok(None),
        }
    }

    /// Descends from a latched subtree top, which is released on the way.
    ///
    /// A subtree top latched shared that turns out to need a fetch is
    /// replaced by the root latched exclusively, so only pass a shared
    /// latch for the tree root.
    pub fn search_sub_tree(
        &self,
        parent: NodeGuard,
        key: &[u8],
        search_type: SearchType,
        target: Option<NodeId>,
        mut boundary: Option<&mut BinBoundary>,
        update_generation: bool,
    ) -> Result<Option<NodeGuard>> {
        let mut parent = Some(parent);
        for _ in 0..RELATCH_RETRIES {
            let Some(top) = parent.take() else {
                return Ok(None);
            };
            let flow = self.search_sub_tree_internal(
                top,
                key,
                search_type,
                target,
                boundary.as_deref_mut(),
                update_generation,
            )?;
            match flow {
                Flow::Done(found) => return Ok(found),
                Flow::Retry(_) => {
                    TreeCounters::bump(&self.counters.relatches_required);
                    parent = self
                        .get_root_in_latched_exclusive(update_generation)?
                        .map(NodeGuard::from);
                }
            }
        }
        Err(LarchError::InconsistentState(format!(
            "search of database {} did not settle after relatching the root",
            self.database.id()
        )))
    }

    fn search_sub_tree_internal(
        &self,
        mut parent: NodeGuard,
        key: &[u8],
        search_type: SearchType,
        target: Option<NodeId>,
        mut boundary: Option<&mut BinBoundary>,
        update_generation: bool,
    ) -> Result<Flow<Option<NodeGuard>>> {
        if Some(parent.node_id()) == target {
            return Ok(Flow::Done(None));
        }
        if let Some(b) = boundary.as_deref_mut() {
            b.is_last_bin = true;
            b.is_first_bin = true;
        }
        if parent.is_bin() {
            return Ok(Flow::Done(Some(parent)));
        }

        let maintain_grandparents = !parent.is_exclusive();
        let mut grandparent: Option<NodeGuard> = None;

        loop {
            if parent.n_entries() == 0 {
                return Ok(Flow::Done(Some(parent)));
            }
            let mut index = search_type.child_index(&parent, key);

            if !parent.is_exclusive() && parent.target(index).is_none() {
                // Filling in a target is a write.
                let Some(held) = grandparent.take() else {
                    return Ok(Flow::Retry(RetrySignal::RelatchRequired));
                };
                let node = parent.node_ref();
                drop(parent);
                parent = NodeGuard::Exclusive(node.latch());
                drop(held);
                index = search_type.child_index(&parent, key);
            }

            if let Some(b) = boundary.as_deref_mut() {
                if index + 1 != parent.n_entries() {
                    b.is_last_bin = false;
                }
                if index != 0 {
                    b.is_first_bin = false;
                }
            }

            let child = match parent.target(index).and_then(Target::as_node) {
                Some(child) => child.clone(),
                None => parent.get_mut()?.fetch_required_child(index)?,
            };
            drop(grandparent.take());

            let child_latch = if maintain_grandparents {
                child.latch_shared(update_generation)
            } else {
                NodeGuard::Exclusive(child.latch_with_generation(update_generation))
            };

            if Some(child.node_id()) == target {
                drop(child_latch);
                return Ok(Flow::Done(Some(parent)));
            }

            if maintain_grandparents {
                grandparent = Some(parent);
            } else {
                drop(parent);
            }
            parent = child_latch;
            if parent.is_bin() {
                return Ok(Flow::Done(Some(parent)));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Search with splits
    // ------------------------------------------------------------------------

    /// Descends from the root exclusively, splitting full nodes on the path.
    ///
    /// Returns the bottom node for `key` with room for one more slot, or the
    /// parent of `target`. Returns `None` for an empty tree.
    pub fn search_splits_allowed(
        &self,
        key: &[u8],
        target: Option<NodeId>,
        update_generation: bool,
    ) -> Result<Option<ExclusiveLatch>> {
        loop {
            let Some(root) = self.latch_root_for_insert(update_generation)? else {
                return Ok(None);
            };
            match self.search_sub_tree_splits_allowed(root, key, target, update_generation)? {
                Flow::Done((found, _)) => return Ok(found),
                // Another thread used the root's last slot while it was
                // unlatched for the split pass.
                Flow::Retry(_) => continue,
            }
        }
    }

    /// Latches the root node exclusively, splitting it first when full.
    fn latch_root_for_insert(&self, update_generation: bool) -> Result<Option<ExclusiveLatch>> {
        loop {
            {
                let root = self.root.read();
                if !super::root_exists(&root) {
                    return Ok(None);
                }
                if let Some(node) = root.as_ref().and_then(|r| r.resident_node()) {
                    let latch = node.latch_with_generation(update_generation);
                    if !latch.needs_splitting() {
                        return Ok(Some(latch));
                    }
                }
            }

            let mut root = self.root.write();
            let Some(node) = self.fetch_root(&mut root)? else {
                return Ok(None);
            };
            let needs_split = node.latch().needs_splitting();
            if !needs_split {
                return Ok(Some(node.latch_with_generation(update_generation)));
            }
            self.split_root(&mut root)?;
            // The catalog leaf is logged without any latch held.
            drop(root);
            self.optional_modify_db_root()?;
        }
    }

    /// Descends exclusively from `parent`, forcing splits along the way.
    ///
    /// Besides the node found, returns the last full version of `parent`
    /// as of its release, so a caller holding `parent`'s own parent can
    /// notice that a split logged it anew. A retry signal means `parent`
    /// itself must be split first; all latches are released then.
    pub(crate) fn search_sub_tree_splits_allowed(
        &self,
        parent: ExclusiveLatch,
        key: &[u8],
        target: Option<NodeId>,
        update_generation: bool,
    ) -> Result<Flow<(Option<ExclusiveLatch>, Lsn)>> {
        let mut parent = parent;
        loop {
            let top = NodeRef::from_latch(&parent);
            let top_is_db_root = parent.is_db_root();
            match self.search_sub_tree_until_split(parent, key, target, update_generation)? {
                Flow::Done(found) => return Ok(Flow::Done(found)),
                Flow::Retry(_) => match self.force_split(&top, top_is_db_root, key)? {
                    Flow::Done(latch) => parent = latch,
                    Flow::Retry(signal) => return Ok(Flow::Retry(signal)),
                },
            }
        }
    }

    /// Descends exclusively until the bottom, or until a full child is met,
    /// in which case every latch is released and a split is requested.
    fn search_sub_tree_until_split(
        &self,
        parent: ExclusiveLatch,
        key: &[u8],
        target: Option<NodeId>,
        update_generation: bool,
    ) -> Result<Flow<(Option<ExclusiveLatch>, Lsn)>> {
        let top_lsn = parent.last_full_version();
        if Some(parent.node_id()) == target {
            return Ok(Flow::Done((None, top_lsn)));
        }
        let mut parent = parent;
        while !parent.is_bin() {
            if parent.n_entries() == 0 {
                break;
            }
            let index = SearchType::Normal.child_index(&parent, key);
            let child = parent
                .fetch_required_child(index)?
                .latch_with_generation(update_generation);

            if child.needs_splitting() {
                drop(child);
                drop(parent);
                return Ok(Flow::Retry(RetrySignal::SplitRequired));
            }
            if Some(child.node_id()) == target {
                drop(child);
                break;
            }
            parent = child;
        }
        Ok(Flow::Done((Some(parent), top_lsn)))
    }

    /// Splits every full resident node on the path for `key` below `top`.
    ///
    /// The path is latched top-down and kept latched; a node is split into
    /// its parent before the descent continues into whichever half now
    /// holds `key`. New versions are then propagated bottom-up: a node that
    /// received split slots was logged by the split, nodes above it are
    /// logged here. Returns `top` latched.
    fn force_split(&self, top: &NodeRef, top_is_db_root: bool, key: &[u8]) -> Result<Flow<ExclusiveLatch>> {
        // Root latch before root node.
        let mut root = top_is_db_root.then(|| self.root.write());
        let original = top.latch();

        // The top may have filled up, or stopped being a root, while it was
        // unlatched.
        if original.needs_splitting() || !original.is_root() {
            return Ok(Flow::Retry(RetrySignal::SplitRequired));
        }

        let mut ladder: Vec<ExclusiveLatch> = vec![original];
        let mut indices: Vec<usize> = Vec::new();
        let mut split_parents: Vec<bool> = vec![false];
        let mut all_left = true;
        let mut all_right = true;

        loop {
            let Some(parent) = ladder.last_mut() else {
                break;
            };
            if parent.is_bin() || parent.n_entries() == 0 {
                break;
            }
            let mut index = SearchType::Normal.child_index(parent, key);
            let Some(child_ref) = parent.child_node(index) else {
                break;
            };
            let mut child = child_ref.latch();

            if child.needs_splitting() {
                let left = all_left && index == 0;
                let right = all_right && index + 1 == parent.n_entries();
                let max_entries = self.max_entries_for(child.contains_duplicates());
                if left || right {
                    In::split_special(&mut child, parent, index, max_entries, key, left)?;
                } else {
                    In::split(&mut child, parent, index, max_entries)?;
                }
                TreeCounters::bump(&self.counters.splits);
                if let Some(flag) = split_parents.last_mut() {
                    *flag = true;
                }
                if parent.is_db_root() {
                    if let Some(reference) = root.as_mut().and_then(|r| r.as_mut()) {
                        reference.set_lsn(parent.last_full_version());
                    }
                    // The catalog leaf still names the previous version.
                    parent.set_dirty(true);
                }

                // `key` may now belong to the new sibling.
                index = SearchType::Normal.child_index(parent, key);
                match parent.child_node(index) {
                    Some(next) if next.same_node(&child_ref) => {}
                    Some(next) => {
                        drop(child);
                        child = next.latch();
                    }
                    None => {
                        return Err(LarchError::InconsistentState(format!(
                            "slot {} of node {} lost its target during a split",
                            index,
                            parent.node_id()
                        )))
                    }
                }
            }

            all_left &= index == 0;
            all_right &= index + 1 == parent.n_entries();
            indices.push(index);
            split_parents.push(false);
            ladder.push(child);
        }

        let mut propagate = false;
        while ladder.len() > 1 {
            let (Some(mut child), Some(index), Some(was_split_parent)) =
                (ladder.pop(), indices.pop(), split_parents.pop())
            else {
                break;
            };
            let lsn = if propagate {
                child.optional_log()?
            } else if was_split_parent {
                child.last_full_version()
            } else {
                continue;
            };
            drop(child);
            if let Some(parent) = ladder.last_mut() {
                parent.update_entry_lsn(index, lsn);
            }
            propagate = true;
        }

        match ladder.pop() {
            Some(original) => {
                trace!(node_id = %original.node_id(), "forced splits");
                Ok(Flow::Done(original))
            }
            None => Err(LarchError::Internal("split ladder lost its top".into())),
        }
    }

    // ------------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------------

    /// The leftmost bottom node of the main tree, latched.
    pub fn get_first_node(&self) -> Result<Option<NodeGuard>> {
        self.search(&[], SearchType::Left, None, None, true)
    }

    /// The rightmost bottom node of the main tree, latched. Does not enter
    /// a duplicate tree hanging off its last slot.
    pub fn get_last_node(&self) -> Result<Option<NodeGuard>> {
        self.search(&[], SearchType::Right, None, None, true)
    }

    /// The leftmost DBIN of the duplicate tree topped by the latched
    /// `dup_root`.
    pub fn get_first_dup_node(&self, dup_root: ExclusiveLatch) -> Result<Option<ExclusiveLatch>> {
        self.dup_edge(dup_root, SearchType::Left)
    }

    /// The rightmost DBIN of the duplicate tree topped by the latched
    /// `dup_root`.
    pub fn get_last_dup_node(&self, dup_root: ExclusiveLatch) -> Result<Option<ExclusiveLatch>> {
        self.dup_edge(dup_root, SearchType::Right)
    }

    fn dup_edge(&self, dup_root: ExclusiveLatch, search_type: SearchType) -> Result<Option<ExclusiveLatch>> {
        if !dup_root.contains_duplicates() || dup_root.is_bin() {
            return Err(LarchError::IllegalArgument(format!(
                "node {} is not a duplicate tree root",
                dup_root.node_id()
            )));
        }
        self.search_sub_tree(dup_root.into(), &[], search_type, None, None, true)?
            .map(NodeGuard::into_exclusive)
            .transpose()
    }
}
