//! Parent discovery and sideways steps between bottom nodes.
//!
//! A node never latches its parent. To find it, the node is described by
//! its id and keys, released, and the tree is searched again from the root
//! with exclusive latches all the way down.

use super::{Flow, SearchType, Tree};
use crate::constants::{EXACT_MATCH, INDEX_MASK};
use crate::in_node::In;
use crate::latch::{ExclusiveLatch, NodeGuard};
use crate::ln::Ln;
use larch_common::{LarchError, NodeId, Result};
use larch_log::Lsn;
use tracing::trace;

/// Outcome of a parent search.
#[derive(Default)]
pub struct SearchResult {
    /// The parent, latched. Absent when there is none, or when an exact
    /// parent was required and the search only found a potential one.
    pub parent: Option<ExclusiveLatch>,
    /// Slot of `parent` that holds, or would hold, the child.
    pub index: Option<usize>,
    pub exact_parent_found: bool,
    /// The search stopped above a slot whose child is not resident.
    pub child_not_resident: bool,
}

/// The slot of a leaf: its bottom node, latched, and the slot index.
pub struct TreeLocation {
    pub bin: Option<ExclusiveLatch>,
    pub index: usize,
    /// Key of the slot, or the key looked for when no slot matched.
    pub ln_key: Vec<u8>,
    pub child_lsn: Lsn,
}

impl TreeLocation {
    pub fn new() -> Self {
        Self {
            bin: None,
            index: 0,
            ln_key: Vec::new(),
            child_lsn: Lsn::NULL,
        }
    }

    /// Releases the bottom node.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for TreeLocation {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of the node whose parent is sought, taken while it was latched.
struct SoughtNode {
    node_id: NodeId,
    contains_duplicates: bool,
    is_root: bool,
    main_tree_key: Vec<u8>,
    dup_tree_key: Option<Vec<u8>>,
}

impl SoughtNode {
    fn of(node: &In) -> Self {
        Self {
            node_id: node.node_id(),
            contains_duplicates: node.contains_duplicates(),
            is_root: node.is_root(),
            main_tree_key: node.main_tree_key().to_vec(),
            dup_tree_key: node.dup_tree_key().map(<[u8]>::to_vec),
        }
    }
}

/// Ends a parent search at `node`. A potential parent is only kept when
/// `keep` allows it.
fn settle(node: ExclusiveLatch, exact: bool, keep: bool, result: &mut SearchResult) {
    result.exact_parent_found = exact;
    result.parent = (exact || keep).then_some(node);
}

/// One step of a parent search. Returns the child to continue with, or
/// `None` once `result` is settled.
fn find_parent(
    mut node: ExclusiveLatch,
    sought: &SoughtNode,
    require_exact: bool,
    update_generation: bool,
    do_fetch: bool,
    result: &mut SearchResult,
) -> Result<Option<ExclusiveLatch>> {
    if node.node_id() == sought.node_id {
        // Nothing above the sought node is in this subtree.
        result.exact_parent_found = false;
        result.parent = None;
        return Ok(None);
    }
    if node.n_entries() == 0 {
        result.index = None;
        settle(node, false, !require_exact, result);
        return Ok(None);
    }

    let key = node.select_key(&sought.main_tree_key, sought.dup_tree_key.as_deref());
    let found = node.find_entry(key, false, false);
    if found < 0 {
        result.index = None;
        settle(node, false, !require_exact, result);
        return Ok(None);
    }
    let index = found as usize;
    result.index = Some(index);

    let child = if node.is_entry_known_deleted(index) {
        None
    } else if do_fetch {
        match node.fetch_target(index)? {
            Some(target) => Some((target.node_id(), target.as_node().cloned())),
            None => None,
        }
    } else {
        match node.target(index) {
            Some(target) => Some((target.node_id(), target.as_node().cloned())),
            None => {
                result.child_not_resident = true;
                settle(node, false, true, result);
                return Ok(None);
            }
        }
    };
    let Some((child_id, child_node)) = child else {
        // Deleted slot.
        settle(node, false, !require_exact, result);
        return Ok(None);
    };

    if child_id == sought.node_id {
        settle(node, true, true, result);
        return Ok(None);
    }
    let Some(child_node) = child_node.filter(|c| c.kind().can_be_ancestor(sought.contains_duplicates)) else {
        // A bottom node is only a potential parent of a duplicate tree.
        let keep = !require_exact && (!node.is_bin() || sought.contains_duplicates);
        settle(node, false, keep, result);
        return Ok(None);
    };
    if node.is_bin() && sought.contains_duplicates && sought.is_root {
        // A duplicate root can only hang off this BIN.
        settle(node, false, !require_exact, result);
        return Ok(None);
    }
    let child = child_node.latch_with_generation(update_generation);
    drop(node);
    Ok(Some(child))
}

/// Depth-first search of a duplicate tree for the leaf `ln_id`.
fn find_leaf_in_dup_tree(mut node: ExclusiveLatch, ln_id: NodeId) -> Result<Option<(ExclusiveLatch, usize)>> {
    if node.is_bin() {
        for index in 0..node.n_entries() {
            if node.is_entry_known_deleted(index) {
                continue;
            }
            if node.fetch_target(index)?.is_some_and(|t| t.node_id() == ln_id) {
                return Ok(Some((node, index)));
            }
        }
        return Ok(None);
    }
    for index in 0..node.n_entries() {
        let Some(child) = node.fetch_child_node(index)? else {
            continue;
        };
        if let Some(hit) = find_leaf_in_dup_tree(child.latch(), ln_id)? {
            return Ok(Some(hit));
        }
    }
    Ok(None)
}

impl Tree {
    // ------------------------------------------------------------------------
    // Parents of internal nodes
    // ------------------------------------------------------------------------

    /// Finds the parent of the latched `child`, which is released first.
    ///
    /// With `require_exact`, the result only carries a parent whose slot
    /// points at `child`; otherwise the node where the search ended is
    /// returned as a potential parent.
    pub fn get_parent_in_for_child_in(
        &self,
        child: ExclusiveLatch,
        require_exact: bool,
        update_generation: bool,
    ) -> Result<SearchResult> {
        let sought = SoughtNode::of(&child);
        drop(child);
        self.parent_search(&sought, require_exact, update_generation, true)
    }

    /// Finds the exact parent of `child` without fetching anything. Used
    /// by eviction, where every node above a resident node is resident.
    pub(crate) fn get_resident_parent(&self, child: ExclusiveLatch) -> Result<SearchResult> {
        let sought = SoughtNode::of(&child);
        drop(child);
        self.parent_search(&sought, true, false, false)
    }

    fn parent_search(
        &self,
        sought: &SoughtNode,
        require_exact: bool,
        update_generation: bool,
        do_fetch: bool,
    ) -> Result<SearchResult> {
        let mut result = SearchResult::default();
        let mut node = self.get_root_in_latched_exclusive(update_generation)?;
        while let Some(current) = node.take() {
            node = find_parent(current, sought, require_exact, update_generation, do_fetch, &mut result)?;
        }
        trace!(
            node_id = %sought.node_id,
            exact = result.exact_parent_found,
            "parent search"
        );
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Parents of leaves
    // ------------------------------------------------------------------------

    /// Finds the bottom node holding the slot of `ln`, whose record is
    /// `main_key` (and `dup_key` inside a duplicate tree).
    ///
    /// Returns true with `location` set to the slot on a match. Otherwise
    /// `location.bin` is the node where the slot would go, if any, and
    /// `location.ln_key` the key looked for. A count leaf is matched by the
    /// slot of its duplicate tree in the BIN. Deleted slots only match with
    /// `find_deleted_entries`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_parent_bin_for_child_ln(
        &self,
        location: &mut TreeLocation,
        main_key: &[u8],
        dup_key: Option<&[u8]>,
        ln: &Ln,
        splits_allowed: bool,
        find_deleted_entries: bool,
        update_generation: bool,
    ) -> Result<bool> {
        location.reset();
        let found = if splits_allowed {
            self.search_splits_allowed(main_key, None, update_generation)?
        } else {
            self.search(main_key, SearchType::Normal, None, None, update_generation)?
                .map(NodeGuard::into_exclusive)
                .transpose()?
        };
        let Some(mut bin) = found else {
            return Ok(false);
        };

        let Some(index) = slot_match(&bin, main_key, find_deleted_entries) else {
            location.ln_key = main_key.to_vec();
            location.bin = Some(bin);
            return Ok(false);
        };
        location.index = index;
        location.ln_key = main_key.to_vec();

        if !bin.is_entry_known_deleted(index) && self.database.sorted_duplicates() {
            let child = bin.fetch_target(index)?.and_then(|t| t.as_node().cloned());
            if let Some(dup_root) = child.filter(|c| c.kind().contains_duplicates()) {
                if ln.contains_duplicates() {
                    let din = dup_root.latch();
                    location.child_lsn = din.dup_count_ln_ref().map(|r| r.lsn()).unwrap_or(Lsn::NULL);
                    drop(din);
                    location.bin = Some(bin);
                    return Ok(true);
                }
                return match dup_key {
                    Some(dup_key) => self.search_dup_tree_for_dbin(
                        location,
                        bin,
                        dup_root.latch_with_generation(update_generation),
                        dup_key,
                        splits_allowed,
                        find_deleted_entries,
                        update_generation,
                    ),
                    None => {
                        // A deleted leaf has no data to search by.
                        let dup_root = dup_root.latch_with_generation(update_generation);
                        drop(bin);
                        match find_leaf_in_dup_tree(dup_root, ln.node_id())? {
                            Some((dup_bin, dup_index)) => {
                                location.index = dup_index;
                                location.ln_key = dup_bin.key(dup_index).to_vec();
                                location.child_lsn = dup_bin.lsn(dup_index);
                                location.bin = Some(dup_bin);
                                Ok(true)
                            }
                            None => Ok(false),
                        }
                    }
                };
            }
        }

        location.child_lsn = bin.lsn(index);
        location.bin = Some(bin);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn search_dup_tree_for_dbin(
        &self,
        location: &mut TreeLocation,
        mut bin: ExclusiveLatch,
        dup_root: ExclusiveLatch,
        dup_key: &[u8],
        splits_allowed: bool,
        find_deleted_entries: bool,
        update_generation: bool,
    ) -> Result<bool> {
        let index = location.index;
        let found = if splits_allowed {
            let dup_root = self.maybe_split_duplicate_root(&mut bin, index, dup_root)?;
            let previous_lsn = dup_root.last_full_version();
            match self.search_sub_tree_splits_allowed(dup_root, dup_key, None, update_generation)? {
                Flow::Done((found, current_lsn)) => {
                    if current_lsn != previous_lsn {
                        bin.update_entry_lsn(index, current_lsn);
                    }
                    found
                }
                Flow::Retry(_) => {
                    return Err(LarchError::InconsistentState(format!(
                        "duplicate tree in slot {} of node {} did not make room",
                        index,
                        bin.node_id()
                    )))
                }
            }
        } else {
            drop(bin);
            return self.finish_dup_search(
                location,
                self.search_sub_tree(
                    NodeGuard::from(dup_root),
                    dup_key,
                    SearchType::Normal,
                    None,
                    None,
                    update_generation,
                )?
                .map(NodeGuard::into_exclusive)
                .transpose()?,
                dup_key,
                find_deleted_entries,
            );
        };
        drop(bin);
        self.finish_dup_search(location, found, dup_key, find_deleted_entries)
    }

    fn finish_dup_search(
        &self,
        location: &mut TreeLocation,
        found: Option<ExclusiveLatch>,
        dup_key: &[u8],
        find_deleted_entries: bool,
    ) -> Result<bool> {
        location.ln_key = dup_key.to_vec();
        let Some(dup_bin) = found else {
            return Ok(false);
        };
        let matched = slot_match(&dup_bin, dup_key, find_deleted_entries);
        if let Some(index) = matched {
            location.index = index;
            location.child_lsn = dup_bin.lsn(index);
        }
        location.bin = Some(dup_bin);
        Ok(matched.is_some())
    }

    // ------------------------------------------------------------------------
    // Sideways
    // ------------------------------------------------------------------------

    /// The bottom node after the latched `bin`, which is released.
    ///
    /// Within a duplicate tree the walk stops at the tree's last DBIN.
    pub fn get_next_bin(&self, bin: ExclusiveLatch, traverse_within_dup_tree: bool) -> Result<Option<ExclusiveLatch>> {
        self.get_adjacent_bin(bin, traverse_within_dup_tree, true)
    }

    /// The bottom node before the latched `bin`, which is released.
    pub fn get_prev_bin(&self, bin: ExclusiveLatch, traverse_within_dup_tree: bool) -> Result<Option<ExclusiveLatch>> {
        self.get_adjacent_bin(bin, traverse_within_dup_tree, false)
    }

    fn get_adjacent_bin(
        &self,
        bin: ExclusiveLatch,
        traverse_within_dup_tree: bool,
        forward: bool,
    ) -> Result<Option<ExclusiveLatch>> {
        // An edge key stays in whichever half a concurrent split leaves it.
        let edge_key = match bin.n_entries() {
            0 => bin.identifier_key().to_vec(),
            n if forward => bin.key(n - 1).to_vec(),
            _ => bin.key(0).to_vec(),
        };

        let mut next = bin;
        loop {
            if traverse_within_dup_tree && next.is_root() {
                return Ok(None);
            }
            let result = self.get_parent_in_for_child_in(next, true, true)?;
            let Some(mut parent) = result.parent.filter(|_| result.exact_parent_found) else {
                return Ok(None);
            };

            let index = parent.find_entry(&edge_key, false, false);
            let sibling = if forward { index + 1 } else { index - 1 };
            if sibling >= 0 && (sibling as usize) < parent.n_entries() {
                let child = parent
                    .fetch_required_child(sibling as usize)?
                    .latch_with_generation(true);
                drop(parent);
                if child.is_bin() {
                    return Ok(Some(child));
                }
                let search_type = if forward { SearchType::Left } else { SearchType::Right };
                return match self.search_sub_tree(NodeGuard::from(child), &[], search_type, None, None, true)? {
                    Some(found) if found.is_bin() => found.into_exclusive().map(Some),
                    _ => Err(LarchError::InconsistentState(format!(
                        "subtree below slot {} of database {} has no bottom node",
                        sibling,
                        self.database.id()
                    ))),
                };
            }
            next = parent;
        }
    }
}

/// Index of the slot for `key`. Deleted slots count only when asked for.
fn slot_match(node: &In, key: &[u8], find_deleted_entries: bool) -> Option<usize> {
    if find_deleted_entries {
        let found = node.find_entry(key, true, false);
        (found >= 0 && found & EXACT_MATCH != 0).then_some((found & INDEX_MASK) as usize)
    } else {
        let found = node.find_entry(key, false, true);
        (found >= 0).then_some(found as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::tree;
    use super::*;
    use crate::cursor::TreeCursor;
    use crate::env::DatabaseConfig;
    use crate::txn::Locker;

    fn put(tree: &Tree, key: &[u8], data: &[u8], dups: bool) {
        let env = tree.database().env();
        let cursor = TreeCursor::new(Locker::basic(env));
        assert!(tree.insert(Ln::new(env, data.to_vec()), key, dups, &cursor).unwrap());
        cursor.locker().operation_end().unwrap();
    }

    fn filled(n: u8) -> std::sync::Arc<Tree> {
        let tree = tree(4, DatabaseConfig::new());
        for k in 0..n {
            put(&tree, &[k], &[k], false);
        }
        tree
    }

    fn keys_of(node: &In) -> Vec<u8> {
        (0..node.n_entries()).map(|i| node.key(i)[0]).collect()
    }

    #[test]
    fn test_root_has_no_parent() {
        let tree = filled(20);
        let root = tree.get_root_in_latched_exclusive(false).unwrap().unwrap();
        let result = tree.get_parent_in_for_child_in(root, true, false).unwrap();
        assert!(result.parent.is_none());
        assert!(!result.exact_parent_found);
    }

    #[test]
    fn test_exact_parent_of_bin() {
        let tree = filled(20);
        let bin = tree.get_last_node().unwrap().unwrap().into_exclusive().unwrap();
        let bin_id = bin.node_id();
        let result = tree.get_parent_in_for_child_in(bin, true, false).unwrap();
        assert!(result.exact_parent_found);
        let parent = result.parent.unwrap();
        let index = result.index.unwrap();
        assert_eq!(parent.target(index).unwrap().node_id(), bin_id);
        assert!(!parent.is_bin());
    }

    #[test]
    fn test_resident_parent_search() {
        let tree = filled(20);
        let bin = tree.get_first_node().unwrap().unwrap().into_exclusive().unwrap();
        let bin_id = bin.node_id();
        let result = tree.get_resident_parent(bin).unwrap();
        assert!(result.exact_parent_found);
        assert!(!result.child_not_resident);
        assert_eq!(result.parent.unwrap().child_node(result.index.unwrap()).unwrap().node_id(), bin_id);
    }

    #[test]
    fn test_walk_bins_both_ways() {
        let tree = filled(40);
        let mut forward = Vec::new();
        let mut bin = tree.get_first_node().unwrap().unwrap().into_exclusive().ok();
        while let Some(current) = bin {
            forward.extend(keys_of(&current));
            bin = tree.get_next_bin(current, false).unwrap();
        }
        assert_eq!(forward, (0..40).collect::<Vec<u8>>());

        let mut backward = Vec::new();
        let mut bin = tree.get_last_node().unwrap().unwrap().into_exclusive().ok();
        while let Some(current) = bin {
            backward.extend(keys_of(&current).into_iter().rev());
            bin = tree.get_prev_bin(current, false).unwrap();
        }
        assert_eq!(backward, (0..40).rev().collect::<Vec<u8>>());
    }

    #[test]
    fn test_parent_bin_for_leaf() {
        let tree = filled(20);
        let env = tree.database().env();
        let ln = Ln::new(env, vec![7]);
        let mut location = TreeLocation::new();
        assert!(tree
            .get_parent_bin_for_child_ln(&mut location, &[7], None, &ln, false, false, false)
            .unwrap());
        let bin = location.bin.take().unwrap();
        assert_eq!(bin.key(location.index), &[7]);
        assert_eq!(location.child_lsn, bin.lsn(location.index));
        drop(bin);

        assert!(!tree
            .get_parent_bin_for_child_ln(&mut location, &[200], None, &ln, true, false, false)
            .unwrap());
        assert_eq!(location.ln_key, vec![200]);
        assert!(location.bin.is_some());
    }

    #[test]
    fn test_parent_bin_in_duplicate_tree() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        for data in [b"a", b"b", b"c", b"d", b"e", b"f"] {
            put(&tree, b"k", data, true);
        }
        let env = tree.database().env();
        let mut location = TreeLocation::new();
        let ln = Ln::new(env, b"e".to_vec());
        assert!(tree
            .get_parent_bin_for_child_ln(&mut location, b"k", Some(b"e"), &ln, false, false, false)
            .unwrap());
        let dbin = location.bin.take().unwrap();
        assert!(dbin.contains_duplicates() && dbin.is_bin());
        assert_eq!(dbin.key(location.index), b"e");
        drop(dbin);

        let count_ln = Ln::new_dup_count(env, 0);
        assert!(tree
            .get_parent_bin_for_child_ln(&mut location, b"k", None, &count_ln, false, false, false)
            .unwrap());
        let mut bin = location.bin.take().unwrap();
        assert!(!bin.contains_duplicates());
        let din = bin.fetch_required_child(location.index).unwrap().latch();
        assert_eq!(location.child_lsn, din.dup_count_ln_ref().unwrap().lsn());
    }

    #[test]
    fn test_walk_within_duplicate_tree() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        let data: Vec<u8> = (b'a'..=b'p').collect();
        for d in &data {
            put(&tree, b"k", &[*d], true);
        }
        put(&tree, b"z", b"z", true);

        let mut bin = tree.search(b"k", SearchType::Normal, None, None, false).unwrap().unwrap().into_exclusive().unwrap();
        let index = bin.find_entry(b"k", false, true) as usize;
        let dup_root = bin.fetch_required_child(index).unwrap().latch();
        drop(bin);

        let mut seen = Vec::new();
        let mut dbin = tree.get_first_dup_node(dup_root).unwrap();
        while let Some(current) = dbin {
            seen.extend(keys_of(&current));
            dbin = tree.get_next_bin(current, true).unwrap();
        }
        assert_eq!(seen, data);
    }
}
