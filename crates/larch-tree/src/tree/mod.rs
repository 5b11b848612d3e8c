//! The tree of one database.
//!
//! A tree is a root reference guarded by the root latch. Everything that
//! replaces the root node (root splits, creating the first nodes, removing
//! an emptied tree) holds the root latch exclusively; everything else takes
//! it shared just long enough to latch the root node.
//!
//! Latch order is always root latch, then root node, then down the tree.
//! Operations that would have to latch upward instead give up and report a
//! [`RetrySignal`].

mod delete;
mod insert;
mod parent;
mod read;
mod search;
mod split;
mod stats;

pub use parent::{SearchResult, TreeLocation};
pub use search::{BinBoundary, SearchType};
pub use stats::TreeStats;

use crate::child_ref::ChildReference;
use crate::env::Database;
use crate::latch::{ExclusiveLatch, NodeGuard, NodeRef};
use crate::ln::{Ln, LnKind};
use crate::node::Target;
use larch_common::{LarchError, NodeId, Result};
use larch_log::Lsn;
use parking_lot::{Mutex, RwLock};
use stats::TreeCounters;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

// ============================================================================
// Retry signals
// ============================================================================

/// Why an operation gave up and must be retried from further up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySignal {
    /// A node on the path was full; split it before descending again.
    SplitRequired,
    /// A child had to be fetched while its parent was latched shared.
    RelatchRequired,
    /// The subtree to remove gained entries.
    NodeNotEmpty,
    /// Cursors still sit on the subtree to remove.
    CursorsExist,
}

/// Outcome of an operation that may ask its caller to retry.
#[must_use]
#[derive(Debug)]
pub enum Flow<T> {
    Done(T),
    Retry(RetrySignal),
}

impl<T> Flow<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Flow::Done(_))
    }

    /// Returns the value, or `None` on a retry signal.
    pub fn done(self) -> Option<T> {
        match self {
            Flow::Done(value) => Some(value),
            Flow::Retry(_) => None,
        }
    }

    pub fn retry_signal(&self) -> Option<RetrySignal> {
        match self {
            Flow::Done(_) => None,
            Flow::Retry(signal) => Some(*signal),
        }
    }
}

// ============================================================================
// Tree
// ============================================================================

/// Catalog leaf tracking where the root was last logged.
struct MapLnState {
    node_id: NodeId,
    lsn: Lsn,
    logged_size: usize,
}

/// A B+Tree with nested duplicate trees.
pub struct Tree {
    database: Arc<Database>,
    root: RwLock<Option<ChildReference>>,
    map_ln: Mutex<MapLnState>,
    counters: TreeCounters,
}

impl Tree {
    /// Creates an empty tree.
    pub fn new(database: Arc<Database>) -> Self {
        let map_ln_id = database.env().next_node_id();
        Self {
            database,
            root: RwLock::new(None),
            map_ln: Mutex::new(MapLnState {
                node_id: map_ln_id,
                lsn: Lsn::NULL,
                logged_size: 0,
            }),
            counters: TreeCounters::default(),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn stats(&self) -> TreeStats {
        self.counters.snapshot()
    }

    /// Fan-out of main tree or duplicate tree nodes.
    pub(crate) fn max_entries_for(&self, duplicates: bool) -> usize {
        if duplicates {
            self.database.node_max_dup_tree_entries()
        } else {
            self.database.node_max_entries()
        }
    }

    // ------------------------------------------------------------------------
    // Root access
    // ------------------------------------------------------------------------

    /// Returns true if the tree has a root, resident or logged.
    pub fn root_exists(&self) -> bool {
        root_exists(&self.root.read())
    }

    pub fn is_root_resident(&self) -> bool {
        self.root
            .read()
            .as_ref()
            .and_then(ChildReference::resident_node)
            .is_some()
    }

    /// LSN the root was last logged at, NULL for an empty or unlogged tree.
    pub fn root_lsn(&self) -> Lsn {
        self.root.read().as_ref().map_or(Lsn::NULL, ChildReference::lsn)
    }

    /// Runs `f` with the root reference latched exclusively.
    pub fn with_root_latched_exclusive<R>(&self, f: impl FnOnce(&mut Option<ChildReference>) -> R) -> R {
        f(&mut self.root.write())
    }

    /// Runs `f` with the root reference latched shared.
    pub fn with_root_latched_shared<R>(&self, f: impl FnOnce(Option<&ChildReference>) -> R) -> R {
        f(self.root.read().as_ref())
    }

    /// Latches the root node, shared when its kind allows it.
    pub fn get_root_in(&self, update_generation: bool) -> Result<Option<NodeGuard>> {
        {
            let root = self.root.read();
            if let Some(node) = root.as_ref().and_then(ChildReference::resident_node) {
                return Ok(Some(node.latch_shared(update_generation)));
            }
            if !root_exists(&root) {
                return Ok(None);
            }
        }
        // Fetching sets the root's target, which needs the latch exclusive.
        let mut root = self.root.write();
        Ok(self
            .fetch_root(&mut root)?
            .map(|node| node.latch_shared(update_generation)))
    }

    /// Latches the root node exclusively.
    pub fn get_root_in_latched_exclusive(&self, update_generation: bool) -> Result<Option<ExclusiveLatch>> {
        let mut root = self.root.write();
        Ok(self
            .fetch_root(&mut root)?
            .map(|node| node.latch_with_generation(update_generation)))
    }

    /// Makes the root resident. The caller holds the root latch exclusive.
    fn fetch_root(&self, root: &mut Option<ChildReference>) -> Result<Option<NodeRef>> {
        let Some(reference) = root.as_mut() else {
            return Ok(None);
        };
        if reference.target().is_none() && reference.lsn().is_null() {
            return Ok(None);
        }
        match reference.fetch_target(&self.database, None)? {
            Some(Target::Node(node)) => Ok(Some(node.clone())),
            Some(Target::Leaf(_)) => Err(LarchError::InconsistentState(format!(
                "root of database {} is a leaf",
                self.database.id()
            ))),
            None => Ok(None),
        }
    }

    /// Records the root's new LSN in the catalog leaf.
    ///
    /// Catalog and deferred write databases keep the change in memory; it
    /// reaches the log with their next sync.
    pub fn optional_modify_db_root(&self) -> Result<()> {
        if self.database.is_deferred_write() || self.database.id().is_catalog() {
            return Ok(());
        }
        self.modify_db_root()
    }

    fn modify_db_root(&self) -> Result<()> {
        let root_lsn = self.root_lsn();
        let db_id = self.database.id();
        let mut state = self.map_ln.lock();
        let mut map_ln = Ln::with_id(state.node_id, Some(Vec::new()), LnKind::Map { db_id, root_lsn });
        let key = db_id.0.to_be_bytes();
        let lsn = map_ln.log(
            &self.database,
            &key,
            None,
            state.lsn,
            state.logged_size,
            None,
            false,
            false,
        )?;
        state.lsn = lsn;
        state.logged_size = map_ln.last_logged_size();
        trace!(db_id = %db_id, root_lsn = %root_lsn, lsn = %lsn, "modified database root");
        Ok(())
    }

    /// LSN of the last logged catalog leaf for this tree.
    pub fn map_ln_lsn(&self) -> Lsn {
        self.map_ln.lock().lsn
    }

    // ------------------------------------------------------------------------
    // Whole tree maintenance
    // ------------------------------------------------------------------------

    /// Logs every dirty resident node bottom-up, then the root and the
    /// catalog leaf. Deferred write databases reach the log this way.
    pub fn sync(&self) -> Result<()> {
        let mut root = self.root.write();
        let Some(node) = self.fetch_root(&mut root)? else {
            return Ok(());
        };
        let mut latch = node.latch();
        latch.log_dirty_children(true)?;
        if latch.is_dirty() {
            let lsn = latch.log()?;
            if let Some(reference) = root.as_mut() {
                reference.set_lsn(lsn);
            }
        }
        drop(latch);
        drop(root);
        self.modify_db_root()?;
        debug!(db_id = %self.database.id(), root_lsn = %self.root_lsn(), "synced tree");
        Ok(())
    }

    /// Checks key order in every resident node.
    pub fn verify(&self) -> Result<()> {
        let Some(root) = self.get_root_in_latched_exclusive(false)? else {
            return Ok(());
        };
        verify_subtree(root, None, None)
    }

    /// Registers every resident node of this tree that is missing from the
    /// resident list. Returns how many were added.
    pub fn rebuild_in_list(&self) -> Result<usize> {
        let env = self.database.env().clone();
        let mut added = 0;
        self.walk_resident(&mut |node, node_ref| {
            if !env.in_list().contains(node.node_id()) {
                env.add_to_in_list(node, node_ref);
                added += 1;
            }
        })?;
        debug!(db_id = %self.database.id(), added, "rebuilt resident list");
        Ok(added)
    }

    /// Returns true if every resident node of this tree is registered and
    /// every registered node of this database is still reachable.
    pub fn validate_in_list(&self) -> Result<bool> {
        let env = self.database.env().clone();
        let mut reachable = HashSet::new();
        let mut all_registered = true;
        self.walk_resident(&mut |node, _| {
            reachable.insert(node.node_id());
            if !env.in_list().contains(node.node_id()) {
                all_registered = false;
            }
        })?;
        let db_id = self.database.id();
        let orphans = env
            .in_list()
            .snapshot()
            .into_iter()
            .filter(|(id, node)| !reachable.contains(id) && node.latch().database().id() == db_id)
            .count();
        Ok(all_registered && orphans == 0)
    }

    /// Visits every resident node top-down with its latch held.
    fn walk_resident(&self, visit: &mut dyn FnMut(&mut crate::in_node::In, &NodeRef)) -> Result<()> {
        let root = {
            let root = self.root.read();
            root.as_ref().and_then(ChildReference::resident_node).cloned()
        };
        let Some(root) = root else {
            return Ok(());
        };
        walk_node(&root, visit);
        Ok(())
    }
}

fn root_exists(root: &Option<ChildReference>) -> bool {
    root.as_ref()
        .is_some_and(|r| r.target().is_some() || !r.lsn().is_null())
}

fn walk_node(node_ref: &NodeRef, visit: &mut dyn FnMut(&mut crate::in_node::In, &NodeRef)) {
    let mut node = node_ref.latch();
    visit(&mut node, node_ref);
    for i in 0..node.n_entries() {
        if let Some(child) = node.child_node(i) {
            walk_node(&child, visit);
        }
    }
}

fn verify_subtree(node: ExclusiveLatch, min_key: Option<Vec<u8>>, max_key: Option<Vec<u8>>) -> Result<()> {
    node.verify(min_key.as_deref(), max_key.as_deref())?;
    let n = node.n_entries();
    for i in 0..n {
        let Some(child) = node.child_node(i) else {
            continue;
        };
        // Slot 0 stands for everything below slot 1, whatever its key.
        let lower = if i == 0 {
            min_key.clone()
        } else {
            Some(node.key(i).to_vec())
        };
        let upper = if i + 1 < n {
            Some(node.key(i + 1).to_vec())
        } else {
            max_key.clone()
        };
        let child = child.latch();
        // Duplicate trees are ordered by data, not by the main key.
        if child.contains_duplicates() == node.contains_duplicates() {
            verify_subtree(child, lower, upper)?;
        } else {
            verify_subtree(child, None, None)?;
        }
    }
    Ok(())
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("db_id", &self.database.id())
            .field("root_lsn", &self.root_lsn())
            .field("root_resident", &self.is_root_resident())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Tree;
    use crate::env::{DatabaseConfig, Environment};
    use larch_common::EnvironmentConfig;
    use std::sync::Arc;

    pub fn tree(max_entries: usize, config: DatabaseConfig) -> Arc<Tree> {
        let env = Environment::open(EnvironmentConfig::default().with_max_entries(max_entries)).unwrap();
        env.open_tree(config).unwrap()
    }
}
