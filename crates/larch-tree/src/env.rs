//! Environment and database handles.
//!
//! An environment owns everything trees share: the log, the memory budget,
//! the resident node list, the lock table, id sequences, the generation
//! clock and the compressor queue. A database carries the per-tree options
//! every node consults: comparators, fan-out, duplicates and deferred write.

use crate::compressor::Compressor;
use crate::in_node::In;
use crate::latch::NodeRef;
use crate::tree::Tree;
use crate::txn::LockTable;
use larch_cache::{Generation, InList, MemoryBudget};
use larch_common::{DatabaseId, EnvironmentConfig, KeyComparator, NodeId, Result, Sequence};
use larch_log::{FileLogManager, MemoryLogManager, SharedLogManager};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Shared state of all trees in one environment.
pub struct Environment {
    config: EnvironmentConfig,
    log: SharedLogManager,
    budget: Arc<MemoryBudget>,
    in_list: InList<NodeRef>,
    lock_table: LockTable,
    node_ids: Sequence,
    txn_ids: Sequence,
    locker_ids: Sequence,
    db_ids: Sequence,
    generation: Generation,
    compressor: Compressor,
    trees: RwLock<HashMap<DatabaseId, Weak<Tree>>>,
}

impl Environment {
    /// Opens an environment. The log lives in `config.log_dir` when set,
    /// in memory otherwise.
    pub fn open(config: EnvironmentConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let log: SharedLogManager = match &config.log_dir {
            Some(dir) => Arc::new(FileLogManager::open(dir, config.log_file_max)?),
            None => Arc::new(MemoryLogManager::new(config.log_file_max)),
        };
        Self::with_log_manager(config, log)
    }

    /// Opens an environment over an existing log manager.
    pub fn with_log_manager(config: EnvironmentConfig, log: SharedLogManager) -> Result<Arc<Self>> {
        config.validate()?;
        let budget = Arc::new(MemoryBudget::new(config.max_memory));
        let lock_timeout = Duration::from_millis(config.lock_timeout_ms);
        info!(
            node_max_entries = config.node_max_entries,
            node_max_dup_tree_entries = config.node_max_dup_tree_entries,
            max_memory = config.max_memory,
            in_memory_log = config.log_dir.is_none(),
            "opening environment"
        );
        Ok(Arc::new(Self {
            in_list: InList::new(budget.clone()),
            budget,
            log,
            lock_table: LockTable::new(lock_timeout),
            node_ids: Sequence::starting_at(1),
            txn_ids: Sequence::starting_at(1),
            locker_ids: Sequence::starting_at(1),
            db_ids: Sequence::starting_at(DatabaseId::NAME_DB.0 as u64 + 1),
            generation: Generation::new(),
            compressor: Compressor::new(),
            trees: RwLock::new(HashMap::new()),
            config,
        }))
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn log(&self) -> &SharedLogManager {
        &self.log
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    pub fn in_list(&self) -> &InList<NodeRef> {
        &self.in_list
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    pub fn node_ids(&self) -> &Sequence {
        &self.node_ids
    }

    pub fn next_node_id(&self) -> NodeId {
        NodeId(self.node_ids.next())
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.txn_ids.next()
    }

    pub(crate) fn next_locker_id(&self) -> u64 {
        self.locker_ids.next()
    }

    /// Creates a database and its empty tree.
    pub fn open_tree(self: &Arc<Self>, config: DatabaseConfig) -> Result<Arc<Tree>> {
        let id = match config.id {
            Some(id) => {
                self.db_ids.advance_past(id.0 as u64);
                id
            }
            None => DatabaseId(self.db_ids.next() as u32),
        };
        let db = Arc::new(Database::new(id, self.clone(), config));
        let tree = Arc::new(Tree::new(db));
        self.trees.write().insert(id, Arc::downgrade(&tree));
        debug!(db_id = %id, "opened tree");
        Ok(tree)
    }

    /// Returns the open tree of a database.
    pub fn tree(&self, db_id: DatabaseId) -> Option<Arc<Tree>> {
        self.trees.read().get(&db_id).and_then(Weak::upgrade)
    }

    /// Registers a resident node and charges its memory.
    pub(crate) fn add_to_in_list(&self, node: &mut In, node_ref: &NodeRef) {
        node.set_in_list_resident(true);
        self.in_list
            .add(node.node_id(), node_ref.clone(), node.budgeted_memory_size());
    }

    /// Drops a node from the resident list and credits its memory.
    pub(crate) fn remove_from_in_list(&self, node: &mut In) {
        if self
            .in_list
            .remove(node.node_id(), node.budgeted_memory_size())
            .is_some()
        {
            node.set_in_list_resident(false);
        }
    }

    /// Forgets every resident node and queued compression. Resident nodes
    /// hold their database, so this also releases the environment.
    pub fn close(&self) {
        let queued = self.compressor.clear();
        self.in_list.clear();
        self.trees.write().clear();
        info!(queued_bins = queued, "closed environment");
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("resident_nodes", &self.in_list.len())
            .finish()
    }
}

/// Per-database options.
#[derive(Clone, Default)]
pub struct DatabaseConfig {
    /// Fixed id. A fresh id is assigned when unset.
    pub id: Option<DatabaseId>,
    /// Store multiple data items per key in duplicate trees.
    pub sorted_duplicates: bool,
    /// Skip logging until the tree is explicitly written.
    pub deferred_write: bool,
    /// Ordering of main tree keys.
    pub btree_comparator: Option<KeyComparator>,
    /// Ordering of duplicate data items.
    pub duplicate_comparator: Option<KeyComparator>,
    /// Overrides the environment's main tree fan-out.
    pub node_max_entries: Option<usize>,
    /// Overrides the environment's duplicate tree fan-out.
    pub node_max_dup_tree_entries: Option<usize>,
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: DatabaseId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn sorted_duplicates(mut self, enabled: bool) -> Self {
        self.sorted_duplicates = enabled;
        self
    }

    pub fn deferred_write(mut self, enabled: bool) -> Self {
        self.deferred_write = enabled;
        self
    }

    pub fn btree_comparator(mut self, comparator: KeyComparator) -> Self {
        self.btree_comparator = Some(comparator);
        self
    }

    pub fn duplicate_comparator(mut self, comparator: KeyComparator) -> Self {
        self.duplicate_comparator = Some(comparator);
        self
    }

    pub fn node_max_entries(mut self, max_entries: usize) -> Self {
        self.node_max_entries = Some(max_entries);
        self
    }

    pub fn node_max_dup_tree_entries(mut self, max_entries: usize) -> Self {
        self.node_max_dup_tree_entries = Some(max_entries);
        self
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("id", &self.id)
            .field("sorted_duplicates", &self.sorted_duplicates)
            .field("deferred_write", &self.deferred_write)
            .field("btree_comparator", &self.btree_comparator.is_some())
            .field("duplicate_comparator", &self.duplicate_comparator.is_some())
            .field("node_max_entries", &self.node_max_entries)
            .field("node_max_dup_tree_entries", &self.node_max_dup_tree_entries)
            .finish()
    }
}

/// An open database.
pub struct Database {
    id: DatabaseId,
    env: Arc<Environment>,
    config: DatabaseConfig,
    max_main: usize,
    max_dup: usize,
}

impl Database {
    pub(crate) fn new(id: DatabaseId, env: Arc<Environment>, config: DatabaseConfig) -> Self {
        let max_main = config
            .node_max_entries
            .unwrap_or(env.config().node_max_entries);
        let max_dup = config
            .node_max_dup_tree_entries
            .unwrap_or(env.config().node_max_dup_tree_entries);
        Self {
            id,
            env,
            config,
            max_main,
            max_dup,
        }
    }

    pub fn id(&self) -> DatabaseId {
        self.id
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn btree_comparator(&self) -> Option<&KeyComparator> {
        self.config.btree_comparator.as_ref()
    }

    pub fn duplicate_comparator(&self) -> Option<&KeyComparator> {
        self.config.duplicate_comparator.as_ref()
    }

    pub fn sorted_duplicates(&self) -> bool {
        self.config.sorted_duplicates
    }

    pub fn is_deferred_write(&self) -> bool {
        self.config.deferred_write
    }

    pub fn node_max_entries(&self) -> usize {
        self.max_main
    }

    pub fn node_max_dup_tree_entries(&self) -> usize {
        self.max_dup
    }

    pub fn bin_delta_percent(&self) -> u32 {
        self.env.config().bin_delta_percent
    }

    pub fn bin_max_deltas(&self) -> u32 {
        self.env.config().bin_max_deltas
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("max_main", &self.max_main)
            .field("max_dup", &self.max_dup)
            .finish()
    }
}
