//! Internal nodes.
//!
//! One struct serves all four internal node kinds. The shared slot logic
//! (search, insert, delete, LSN and state maintenance, memory accounting,
//! fetching children) lives here; kind specific behavior lives in the
//! submodules and dispatches on `InKind`.

mod bin;
mod dup;
mod log;
mod split;
mod subtree;

pub use bin::{BinState, EvictionType};
pub use dup::DinState;

use crate::child_ref::{fetch_error_msg, ChildReference, ParentInfo};
use crate::constants::{
    DBMAP_LEVEL, DIRTY_BIT, EXACT_MATCH, INDEX_MASK, INSERT_SUCCESS, KNOWN_DELETED_BIT,
    LEVEL_MASK, MAIN_LEVEL, MIGRATE_BIT, PENDING_DELETED_BIT,
};
use crate::env::{Database, Environment};
use crate::latch::NodeRef;
use crate::ln::Ln;
use crate::lsn_array::LsnArray;
use crate::node::{fetch_node, NodeKind, Target};
use crate::slots::SlotArray;
use larch_cache::{byte_array_size, ACCUMULATED_LIMIT, ARRAY_ITEM_OVERHEAD, LONG_LIST_PER_ITEM_OVERHEAD};
use larch_common::{compare_with, DatabaseId, KeyComparator, LarchError, NodeId, Result};
use larch_log::Lsn;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::warn;

/// Kind specific state of an internal node.
#[derive(Debug)]
pub enum InKind {
    Upper,
    Bottom(BinState),
    DupUpper(DinState),
    DupBottom { bin: BinState, dup_key: Vec<u8> },
}

/// Result of `insert_entry1`.
#[derive(Debug)]
pub enum InsertOutcome {
    /// A new slot was created at this index.
    Inserted(usize),
    /// A slot with an equal key exists; the entry is handed back.
    Duplicate { index: usize, entry: ChildReference },
}

impl InsertOutcome {
    /// The index combined with `INSERT_SUCCESS` or `EXACT_MATCH`.
    pub fn flags(&self) -> i32 {
        match self {
            InsertOutcome::Inserted(index) => *index as i32 | INSERT_SUCCESS,
            InsertOutcome::Duplicate { index, .. } => *index as i32 | EXACT_MATCH,
        }
    }
}

/// An internal node.
pub struct In {
    node_id: NodeId,
    database: Arc<Database>,
    level: i32,
    identifier_key: Vec<u8>,
    slots: SlotArray,
    dirty: bool,
    is_root: bool,
    generation: AtomicU64,
    in_list_resident: bool,
    last_full_version: Lsn,
    provisional_obsolete: Vec<Lsn>,
    in_memory_size: i64,
    accumulated_delta: i64,
    kind: InKind,
}

// ============================================================================
// Construction
// ============================================================================

impl In {
    /// Creates an upper node of a main tree.
    pub fn new_in(db: &Arc<Database>, identifier_key: Vec<u8>, capacity: usize, level: i32) -> Self {
        let level = generate_level(db.id(), level);
        Self::build(db, identifier_key, capacity, level, InKind::Upper)
    }

    /// Creates a bottom node of a main tree.
    pub fn new_bin(db: &Arc<Database>, identifier_key: Vec<u8>, capacity: usize, level: i32) -> Self {
        let level = generate_level(db.id(), level);
        Self::build(db, identifier_key, capacity, level, InKind::Bottom(BinState::default()))
    }

    fn build(
        db: &Arc<Database>,
        identifier_key: Vec<u8>,
        capacity: usize,
        level: i32,
        kind: InKind,
    ) -> Self {
        let mut node = Self {
            node_id: db.env().next_node_id(),
            database: db.clone(),
            level,
            identifier_key,
            slots: SlotArray::new(capacity),
            dirty: true,
            is_root: false,
            generation: AtomicU64::new(db.env().generation().next_generation()),
            in_list_resident: false,
            last_full_version: Lsn::NULL,
            provisional_obsolete: Vec::new(),
            in_memory_size: 0,
            accumulated_delta: 0,
            kind,
        };
        node.init_memory_size();
        node
    }

    /// Creates an empty node of the same kind, used as a split sibling.
    pub fn create_new_instance(&self, identifier_key: Vec<u8>, capacity: usize, level: i32) -> Self {
        let kind = match &self.kind {
            InKind::Upper => InKind::Upper,
            InKind::Bottom(_) => InKind::Bottom(BinState::default()),
            InKind::DupUpper(din) => InKind::DupUpper(DinState::new(din.dup_key().to_vec(), None)),
            InKind::DupBottom { dup_key, .. } => InKind::DupBottom {
                bin: BinState::default(),
                dup_key: dup_key.clone(),
            },
        };
        let level = match self.node_kind() {
            NodeKind::Internal | NodeKind::Bin => generate_level(self.database.id(), level),
            NodeKind::Din | NodeKind::Dbin => level,
        };
        Self::build(&self.database, identifier_key, capacity, level, kind)
    }

    /// Rebuilds a node read from the log. The caller finishes it with
    /// `post_fetch_init`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_log(
        db: &Arc<Database>,
        node_id: NodeId,
        level: i32,
        identifier_key: Vec<u8>,
        is_root: bool,
        slots: SlotArray,
        kind: InKind,
    ) -> Self {
        Self {
            node_id,
            database: db.clone(),
            level,
            identifier_key,
            slots,
            dirty: false,
            is_root,
            generation: AtomicU64::new(0),
            in_list_resident: false,
            last_full_version: Lsn::NULL,
            provisional_obsolete: Vec::new(),
            in_memory_size: 0,
            accumulated_delta: 0,
            kind,
        }
    }

    /// Finishes a node read from the log at `lsn`.
    pub fn post_fetch_init(&mut self, lsn: Lsn) {
        self.last_full_version = lsn;
        self.touch_generation();
        self.init_memory_size();
    }
}

/// Encodes the database into a level: catalog id nodes get the map bit,
/// everything else the main bit.
pub fn generate_level(db_id: DatabaseId, level: i32) -> i32 {
    if db_id == DatabaseId::ID_DB {
        level | DBMAP_LEVEL
    } else {
        level | MAIN_LEVEL
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl In {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_kind(&self) -> NodeKind {
        match self.kind {
            InKind::Upper => NodeKind::Internal,
            InKind::Bottom(_) => NodeKind::Bin,
            InKind::DupUpper(_) => NodeKind::Din,
            InKind::DupBottom { .. } => NodeKind::Dbin,
        }
    }

    pub fn kind(&self) -> &InKind {
        &self.kind
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn env(&self) -> &Arc<Environment> {
        self.database.env()
    }

    pub fn is_bin(&self) -> bool {
        self.node_kind().is_bin()
    }

    pub fn contains_duplicates(&self) -> bool {
        self.node_kind().contains_duplicates()
    }

    /// True if plain searches may latch this node shared.
    pub fn shares_latch(&self) -> bool {
        self.node_kind() == NodeKind::Internal && self.env().config().shared_internal_latches
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    /// Height within the tree, without the database bits.
    pub fn masked_level(&self) -> i32 {
        self.level & LEVEL_MASK
    }

    pub fn identifier_key(&self) -> &[u8] {
        &self.identifier_key
    }

    pub fn set_identifier_key(&mut self, key: Vec<u8>) {
        self.identifier_key = key;
        self.dirty = true;
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn set_is_root(&mut self, is_root: bool) {
        self.is_root = is_root;
        self.dirty = true;
    }

    /// True for the root of a main tree. Duplicate tree roots are not
    /// database roots.
    pub fn is_db_root(&self) -> bool {
        self.is_root && !self.contains_duplicates()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn last_full_version(&self) -> Lsn {
        self.last_full_version
    }

    pub fn set_last_full_lsn(&mut self, lsn: Lsn) {
        self.last_full_version = lsn;
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::Relaxed)
    }

    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, AtomicOrdering::Relaxed);
    }

    /// Marks the node as just used.
    pub fn touch_generation(&self) {
        self.set_generation(self.env().generation().next_generation());
    }

    pub fn n_entries(&self) -> usize {
        self.slots.len()
    }

    pub fn max_entries(&self) -> usize {
        self.slots.capacity()
    }

    pub fn needs_splitting(&self) -> bool {
        self.slots.capacity() <= self.slots.len()
    }

    pub fn key(&self, idx: usize) -> &[u8] {
        self.slots.key(idx)
    }

    pub fn lsn(&self, idx: usize) -> Lsn {
        self.slots.lsn(idx)
    }

    pub fn lsn_array(&self) -> &LsnArray {
        self.slots.lsn_array()
    }

    pub fn state(&self, idx: usize) -> u8 {
        self.slots.state(idx)
    }

    pub fn target(&self, idx: usize) -> Option<&Target> {
        self.slots.target(idx)
    }

    pub fn target_mut(&mut self, idx: usize) -> Option<&mut Target> {
        self.slots.target_mut(idx)
    }

    /// Returns the resident internal child of slot `idx`.
    pub fn child_node(&self, idx: usize) -> Option<NodeRef> {
        self.slots.target(idx).and_then(Target::as_node).cloned()
    }

    /// Returns the resident leaf of slot `idx`.
    pub fn ln(&self, idx: usize) -> Option<&Ln> {
        self.slots.target(idx).and_then(Target::as_ln)
    }

    pub(crate) fn set_in_list_resident(&mut self, resident: bool) {
        self.in_list_resident = resident;
    }

    pub fn is_in_list_resident(&self) -> bool {
        self.in_list_resident
    }

    /// Ordering used by this node's keys.
    pub fn key_comparator(&self) -> Option<&KeyComparator> {
        if self.contains_duplicates() {
            self.database.duplicate_comparator()
        } else {
            self.database.btree_comparator()
        }
    }

    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        compare_with(self.key_comparator(), a, b)
    }

    /// Upper nodes treat slot 0 as less than any key.
    fn entry_zero_key_compares_low(&self) -> bool {
        matches!(self.kind, InKind::Upper | InKind::DupUpper(_))
    }

    pub(crate) fn parent_info(&self) -> ParentInfo {
        ParentInfo {
            node_id: self.node_id,
            last_full_version: self.last_full_version,
            dirty: self.dirty,
        }
    }
}

// ============================================================================
// Slot state
// ============================================================================

impl In {
    pub fn is_entry_known_deleted(&self, idx: usize) -> bool {
        self.slots.state(idx) & KNOWN_DELETED_BIT != 0
    }

    pub fn is_entry_pending_deleted(&self, idx: usize) -> bool {
        self.slots.state(idx) & PENDING_DELETED_BIT != 0
    }

    pub fn is_migrate(&self, idx: usize) -> bool {
        self.slots.state(idx) & MIGRATE_BIT != 0
    }

    pub fn is_entry_dirty(&self, idx: usize) -> bool {
        self.slots.state(idx) & DIRTY_BIT != 0
    }

    fn or_state(&mut self, idx: usize, bits: u8) {
        let state = self.slots.state(idx) | bits;
        self.slots.set_state(idx, state);
    }

    fn clear_state(&mut self, idx: usize, bits: u8) {
        let state = self.slots.state(idx) & !bits;
        self.slots.set_state(idx, state);
    }

    /// Marks slot `idx` deleted and committed. Bottom nodes also drop the
    /// resident target.
    pub fn set_known_deleted(&mut self, idx: usize) {
        if self.is_bin() {
            self.set_migrate(idx, false);
            self.set_target(idx, None);
        }
        self.or_state(idx, KNOWN_DELETED_BIT | DIRTY_BIT);
        self.dirty = true;
    }

    /// Marks slot `idx` known deleted but keeps its target resident.
    pub fn set_known_deleted_leave_target(&mut self, idx: usize) {
        self.set_migrate(idx, false);
        self.or_state(idx, KNOWN_DELETED_BIT | DIRTY_BIT);
        self.dirty = true;
    }

    pub fn clear_known_deleted(&mut self, idx: usize) {
        self.clear_state(idx, KNOWN_DELETED_BIT);
        self.or_state(idx, DIRTY_BIT);
        self.dirty = true;
    }

    pub fn set_pending_deleted(&mut self, idx: usize) {
        self.or_state(idx, PENDING_DELETED_BIT | DIRTY_BIT);
        self.dirty = true;
    }

    pub fn clear_pending_deleted(&mut self, idx: usize) {
        self.clear_state(idx, PENDING_DELETED_BIT);
        self.or_state(idx, DIRTY_BIT);
        self.dirty = true;
    }

    pub fn set_migrate(&mut self, idx: usize, migrate: bool) {
        if migrate {
            self.or_state(idx, MIGRATE_BIT);
        } else {
            self.clear_state(idx, MIGRATE_BIT);
        }
    }

    /// Clears the dirty bit of every slot.
    pub(crate) fn clear_slot_dirty_bits(&mut self) {
        for i in 0..self.slots.len() {
            self.clear_state(i, DIRTY_BIT);
        }
    }
}

// ============================================================================
// Slot maintenance
// ============================================================================

impl In {
    /// Binary search for `key`.
    ///
    /// Returns the index of the slot with an equal key, with `EXACT_MATCH`
    /// OR'd in when `indicate_if_duplicate` is set. Without a match, returns
    /// the index of the greatest key below `key` (possibly -1), or -1 when
    /// `exact` is set. With `exact`, a known deleted match counts as absent.
    /// Upper nodes treat slot 0 as lower than every key unless an exact or
    /// duplicate-indicating search is requested.
    pub fn find_entry(&self, key: &[u8], indicate_if_duplicate: bool, exact: bool) -> i32 {
        let mut high = self.slots.len() as i32 - 1;
        let mut low = 0i32;
        let entry_zero_special_compare =
            self.entry_zero_key_compares_low() && !exact && !indicate_if_duplicate;

        while low <= high {
            let middle = (high + low) / 2;
            let s = if middle == 0 && entry_zero_special_compare {
                Ordering::Greater
            } else {
                self.compare_keys(key, self.slots.key(middle as usize))
            };
            match s {
                Ordering::Less => high = middle - 1,
                Ordering::Greater => low = middle + 1,
                Ordering::Equal => {
                    let ret = if indicate_if_duplicate {
                        middle | EXACT_MATCH
                    } else {
                        middle
                    };
                    if exact && self.is_entry_known_deleted((ret & INDEX_MASK) as usize) {
                        return -1;
                    }
                    return ret;
                }
            }
        }

        if exact {
            -1
        } else {
            high
        }
    }

    /// Inserts an entry in key order. Returns false if an equal key exists.
    pub fn insert_entry(&mut self, entry: ChildReference) -> Result<bool> {
        Ok(matches!(self.insert_entry1(entry)?, InsertOutcome::Inserted(_)))
    }

    /// Inserts an entry in key order.
    ///
    /// A full node is compressed first. Cursors at or after the new slot
    /// shift right.
    pub fn insert_entry1(&mut self, entry: ChildReference) -> Result<InsertOutcome> {
        if self.slots.is_full() {
            self.compress(None, true)?;
        }
        if self.slots.is_full() {
            return Err(LarchError::InconsistentState(format!(
                "Node {} should have been split before calling insertEntry",
                self.node_id
            )));
        }

        let found = self.find_entry(entry.key(), true, false);
        if found >= 0 && found & EXACT_MATCH != 0 {
            return Ok(InsertOutcome::Duplicate {
                index: (found & INDEX_MASK) as usize,
                entry,
            });
        }
        let index = (found + 1) as usize;

        let lsn_overhead = self.lsn_overhead();
        let entry_size =
            byte_array_size(entry.key().len()) + entry.target().map_or(0, Target::memory_size_included_by_parent);
        self.slots.insert(index, entry);
        self.adjust_cursors_for_insert(index);
        self.change_memory_size(entry_size + self.lsn_overhead() - lsn_overhead);
        self.dirty = true;
        Ok(InsertOutcome::Inserted(index))
    }

    /// Removes slot `index`, shifting later slots left.
    pub fn delete_entry(&mut self, index: usize) -> bool {
        if index >= self.slots.len() {
            return false;
        }
        let old_size = self.entry_in_memory_size(index);
        self.slots.remove(index);
        self.change_memory_size(-old_size);
        self.dirty = true;
        self.set_prohibit_next_delta();
        true
    }

    /// Removes the slot with key `key`, if present and not known deleted.
    pub fn delete_entry_by_key(&mut self, key: &[u8]) -> bool {
        let index = self.find_entry(key, false, true);
        if index >= 0 {
            self.delete_entry(index as usize)
        } else {
            false
        }
    }

    /// Removes slots `low..high` and returns them, for moving to a sibling.
    pub(crate) fn take_entries(&mut self, low: usize, high: usize) -> Vec<ChildReference> {
        self.slots.remove_range(low, high)
    }

    /// Writes slot `idx`, appending when `idx` is one past the end.
    pub fn set_entry(
        &mut self,
        idx: usize,
        target: Option<Target>,
        key: Vec<u8>,
        lsn: Lsn,
        state: u8,
    ) -> Result<()> {
        let entry = ChildReference::with_state(target, key, lsn, state);
        if idx == self.slots.len() {
            let lsn_overhead = self.lsn_overhead();
            let size = byte_array_size(entry.key().len())
                + entry.target().map_or(0, Target::memory_size_included_by_parent);
            self.slots.push(entry);
            self.change_memory_size(size + self.lsn_overhead() - lsn_overhead);
        } else if idx < self.slots.len() {
            let old_size = self.entry_in_memory_size(idx);
            let (target, key, lsn, state) = entry.into_parts();
            self.slots.set_target(idx, target);
            self.slots.set_key(idx, key);
            self.set_lsn_tracked(idx, lsn);
            self.slots.set_state(idx, state);
            let new_size = self.entry_in_memory_size(idx);
            self.update_memory_size(old_size, new_size);
        } else {
            return Err(LarchError::InconsistentState(format!(
                "setEntry of slot {} past the end of node {} with {} entries",
                idx,
                self.node_id,
                self.slots.len()
            )));
        }
        self.dirty = true;
        Ok(())
    }

    /// Replaces the target of slot `idx`.
    pub fn set_target(&mut self, idx: usize, target: Option<Target>) -> Option<Target> {
        let old = self.slots.set_target(idx, target);
        let old_size = old.as_ref().map_or(0, Target::memory_size_included_by_parent);
        let new_size = self
            .slots
            .target(idx)
            .map_or(0, Target::memory_size_included_by_parent);
        self.update_memory_size(old_size, new_size);
        old
    }

    pub fn set_key(&mut self, idx: usize, key: Vec<u8>) {
        let old_size = byte_array_size(self.slots.key(idx).len());
        let new_size = byte_array_size(key.len());
        self.slots.set_key(idx, key);
        self.or_state(idx, DIRTY_BIT);
        self.update_memory_size(old_size, new_size);
    }

    /// Stores an LSN and marks the slot dirty.
    pub fn set_lsn(&mut self, idx: usize, lsn: Lsn) {
        self.set_lsn_tracked(idx, lsn);
        self.or_state(idx, DIRTY_BIT);
    }

    fn set_lsn_tracked(&mut self, idx: usize, lsn: Lsn) {
        let before = self.lsn_overhead();
        self.slots.set_lsn(idx, lsn);
        let after = self.lsn_overhead();
        if after != before {
            self.change_memory_size(after - before);
        }
    }

    /// False when a deferred write database would lose a real LSN to NULL.
    fn not_overwriting_deferred_write_entry(&self, new_lsn: Lsn) -> bool {
        !(self.database.is_deferred_write() && new_lsn.is_null())
    }

    pub fn update_entry_target(&mut self, idx: usize, target: Option<Target>) {
        self.set_target(idx, target);
        self.dirty = true;
    }

    pub fn update_entry_target_lsn(&mut self, idx: usize, target: Option<Target>, lsn: Lsn) {
        self.set_target(idx, target);
        if self.not_overwriting_deferred_write_entry(lsn) {
            self.set_lsn(idx, lsn);
        }
        self.dirty = true;
    }

    pub fn update_entry_target_lsn_key(
        &mut self,
        idx: usize,
        target: Option<Target>,
        lsn: Lsn,
        key: Vec<u8>,
    ) {
        self.set_target(idx, target);
        if self.not_overwriting_deferred_write_entry(lsn) {
            self.set_lsn(idx, lsn);
        }
        self.set_key(idx, key);
        self.dirty = true;
    }

    pub fn update_entry_lsn(&mut self, idx: usize, lsn: Lsn) {
        if self.not_overwriting_deferred_write_entry(lsn) {
            self.set_lsn(idx, lsn);
        }
        self.dirty = true;
    }

    pub fn update_entry_lsn_state(&mut self, idx: usize, lsn: Lsn, state: u8) {
        if self.not_overwriting_deferred_write_entry(lsn) {
            self.set_lsn(idx, lsn);
        }
        self.slots.set_state(idx, state | DIRTY_BIT);
        self.dirty = true;
    }

    /// Updates slot `idx`, replacing its key only if `key` sorts lower.
    pub fn update_entry_compare_key(
        &mut self,
        idx: usize,
        target: Option<Target>,
        lsn: Lsn,
        key: &[u8],
    ) {
        self.set_target(idx, target);
        if self.compare_keys(key, self.slots.key(idx)) == Ordering::Less {
            self.set_key(idx, key.to_vec());
        }
        if self.not_overwriting_deferred_write_entry(lsn) {
            self.set_lsn(idx, lsn);
        }
        self.dirty = true;
    }

    /// Runs `f` on the resident leaf of slot `idx`, keeping memory
    /// accounting in step with any change to the leaf's data.
    pub fn with_ln_mut<R>(&mut self, idx: usize, f: impl FnOnce(&mut Ln) -> R) -> Option<R> {
        let old_size = self.entry_in_memory_size(idx);
        let result = self.slots.target_mut(idx).and_then(Target::as_ln_mut).map(f);
        let new_size = self.entry_in_memory_size(idx);
        self.update_memory_size(old_size, new_size);
        result
    }

    /// True if `key` falls within the keys of the first and last slot.
    pub fn is_key_in_bounds(&self, key: &[u8]) -> bool {
        let n = self.slots.len();
        if n < 2 {
            return false;
        }
        self.compare_keys(key, self.slots.key(0)) != Ordering::Less
            && self.compare_keys(key, self.slots.key(n - 1)) != Ordering::Greater
    }
}

// ============================================================================
// Fetching children
// ============================================================================

impl In {
    /// Returns the target of slot `idx`, reading it from the log if needed.
    ///
    /// A known deleted slot with a NULL LSN has no target. A NULL LSN
    /// anywhere else means the tree is broken. A missing log file is only
    /// tolerated for a known or pending deleted slot.
    pub fn fetch_target(&mut self, idx: usize) -> Result<Option<&mut Target>> {
        if self.slots.target(idx).is_none() {
            let lsn = self.slots.lsn(idx);
            if lsn.is_null() {
                if !self.is_entry_known_deleted(idx) {
                    return Err(LarchError::InconsistentState(self.fetch_error_msg(
                        idx,
                        "NULL LSN without KnownDeleted",
                    )));
                }
                return Ok(None);
            }
            match fetch_node(&self.database, lsn) {
                Ok(target) => {
                    self.set_target(idx, Some(target));
                }
                Err(e)
                    if e.is_log_file_not_found()
                        && (self.is_entry_known_deleted(idx)
                            || self.is_entry_pending_deleted(idx)) =>
                {
                    warn!(
                        node_id = %self.node_id,
                        index = idx,
                        lsn = %lsn,
                        "log file missing for deleted slot"
                    );
                    return Ok(None);
                }
                Err(e) => {
                    return Err(LarchError::Fetch {
                        context: self.fetch_error_msg(idx, "fetch failed"),
                        source: Box::new(e),
                    })
                }
            }
        }
        Ok(self.slots.target_mut(idx))
    }

    /// Fetches slot `idx` and returns its internal node.
    pub fn fetch_child_node(&mut self, idx: usize) -> Result<Option<NodeRef>> {
        Ok(self.fetch_target(idx)?.and_then(|t| t.as_node().cloned()))
    }

    /// Fetches slot `idx` and returns its leaf.
    pub fn fetch_ln(&mut self, idx: usize) -> Result<Option<&mut Ln>> {
        Ok(self.fetch_target(idx)?.and_then(Target::as_ln_mut))
    }

    /// Fetches an internal child that must exist.
    pub(crate) fn fetch_required_child(&mut self, idx: usize) -> Result<NodeRef> {
        match self.fetch_child_node(idx)? {
            Some(child) => Ok(child),
            None => Err(LarchError::InconsistentState(self.fetch_error_msg(
                idx,
                "expected an internal child",
            ))),
        }
    }

    fn fetch_error_msg(&self, idx: usize, msg: &str) -> String {
        fetch_error_msg(
            msg,
            Some(self.parent_info()),
            Some(idx),
            self.slots.key(idx),
            self.slots.lsn(idx),
            self.slots.state(idx),
        )
    }
}

// ============================================================================
// Memory accounting
// ============================================================================

impl In {
    pub fn in_memory_size(&self) -> i64 {
        self.in_memory_size
    }

    /// Memory already reported to the budget.
    pub fn budgeted_memory_size(&self) -> i64 {
        self.in_memory_size - self.accumulated_delta
    }

    /// Memory of slot `idx`: its key plus any leaf it holds.
    pub fn entry_in_memory_size(&self, idx: usize) -> i64 {
        byte_array_size(self.slots.key(idx).len())
            + self
                .slots
                .target(idx)
                .map_or(0, Target::memory_size_included_by_parent)
    }

    fn lsn_overhead(&self) -> i64 {
        self.slots.lsn_array().memory_overhead(self.slots.capacity())
    }

    fn arrays_overhead(&self) -> i64 {
        let capacity = self.slots.capacity();
        byte_array_size(capacity) + capacity as i64 * 2 * ARRAY_ITEM_OVERHEAD
    }

    /// Recomputes the node's memory from scratch.
    pub fn compute_memory_size(&self) -> i64 {
        let mut size = self.node_kind().fixed_overhead() + self.arrays_overhead() + self.lsn_overhead();
        for i in 0..self.slots.len() {
            size += self.entry_in_memory_size(i);
        }
        size += self.provisional_obsolete.len() as i64 * LONG_LIST_PER_ITEM_OVERHEAD;
        size + self.kind_memory_size()
    }

    pub fn init_memory_size(&mut self) {
        self.in_memory_size = self.compute_memory_size();
        self.accumulated_delta = 0;
    }

    pub fn verify_memory_size(&self) -> bool {
        self.compute_memory_size() == self.in_memory_size
    }

    pub fn update_memory_size(&mut self, old_size: i64, new_size: i64) {
        self.change_memory_size(new_size - old_size);
    }

    /// Applies a change, reporting to the budget once enough accumulates.
    pub fn change_memory_size(&mut self, delta: i64) {
        if delta == 0 {
            return;
        }
        self.in_memory_size += delta;
        if self.in_list_resident {
            self.accumulated_delta += delta;
            if self.accumulated_delta.abs() > ACCUMULATED_LIMIT {
                self.env()
                    .budget()
                    .update_tree_memory_usage(self.accumulated_delta);
                self.accumulated_delta = 0;
            }
        }
    }
}

// ============================================================================
// Keys used by parent searches
// ============================================================================

impl In {
    /// Key under which this node is found in the main tree.
    pub fn main_tree_key(&self) -> &[u8] {
        match &self.kind {
            InKind::Upper | InKind::Bottom(_) => &self.identifier_key,
            InKind::DupUpper(din) => din.dup_key(),
            InKind::DupBottom { dup_key, .. } => dup_key,
        }
    }

    /// Key under which this node is found in its duplicate tree.
    pub fn dup_tree_key(&self) -> Option<&[u8]> {
        if self.contains_duplicates() {
            Some(&self.identifier_key)
        } else {
            None
        }
    }

    /// Picks the key to search this node's slots with.
    pub fn select_key<'a>(&self, main_tree_key: &'a [u8], dup_tree_key: Option<&'a [u8]>) -> &'a [u8] {
        match (self.contains_duplicates(), dup_tree_key) {
            (true, Some(dup)) => dup,
            _ => main_tree_key,
        }
    }

    /// Checks that keys ascend strictly, start at or above `min_key` and
    /// stay below `max_key`.
    pub fn verify(&self, min_key: Option<&[u8]>, max_key: Option<&[u8]>) -> Result<()> {
        let n = self.slots.len();
        if let (Some(min_key), true) = (min_key, n > 0) {
            if self.compare_keys(self.slots.key(0), min_key) == Ordering::Less {
                return Err(LarchError::InconsistentState(format!(
                    "node {} first key is below the lower bound",
                    self.node_id
                )));
            }
        }
        for i in 1..n {
            if self.compare_keys(self.slots.key(i - 1), self.slots.key(i)) != Ordering::Less {
                return Err(LarchError::InconsistentState(format!(
                    "node {} keys out of order at slot {}",
                    self.node_id, i
                )));
            }
        }
        if let (Some(max_key), true) = (max_key, n > 0) {
            if self.compare_keys(self.slots.key(n - 1), max_key) != Ordering::Less {
                return Err(LarchError::InconsistentState(format!(
                    "node {} last key is not below the upper bound",
                    self.node_id
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for In {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&[u8]> = self.slots.keys().collect();
        f.debug_struct("In")
            .field("node_id", &self.node_id)
            .field("kind", &self.node_kind())
            .field("level", &format_args!("0x{:x}", self.level))
            .field("is_root", &self.is_root)
            .field("dirty", &self.dirty)
            .field("keys", &keys)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::env::{Database, DatabaseConfig, Environment};
    use larch_common::{DatabaseId, EnvironmentConfig};
    use std::sync::Arc;

    pub fn database(max_entries: usize, config: DatabaseConfig) -> Arc<Database> {
        let env = Environment::open(EnvironmentConfig::default().with_max_entries(max_entries)).unwrap();
        Arc::new(Database::new(DatabaseId(7), env, config))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::database;
    use super::*;
    use crate::constants::BIN_LEVEL;
    use crate::env::DatabaseConfig;

    fn bin_with(db: &Arc<Database>, keys: &[&[u8]]) -> In {
        let mut bin = In::new_bin(db, keys[0].to_vec(), 8, 1);
        for (i, key) in keys.iter().enumerate() {
            let entry = ChildReference::new(None, key.to_vec(), Lsn::new(1, 100 + i as u32));
            assert!(bin.insert_entry(entry).unwrap());
        }
        bin
    }

    #[test]
    fn test_levels() {
        let db = database(8, DatabaseConfig::new());
        let bin = In::new_bin(&db, b"a".to_vec(), 8, 1);
        assert_eq!(bin.level(), BIN_LEVEL);
        assert_eq!(bin.masked_level(), 1);
        assert_eq!(generate_level(DatabaseId::ID_DB, 2), 2 | DBMAP_LEVEL);
        assert_eq!(generate_level(DatabaseId(9), 2), 2 | MAIN_LEVEL);
    }

    #[test]
    fn test_insert_keeps_slots_sorted() {
        let db = database(8, DatabaseConfig::new());
        let bin = bin_with(&db, &[b"m", b"c", b"x", b"a"]);
        let keys: Vec<&[u8]> = (0..bin.n_entries()).map(|i| bin.key(i)).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"c"[..], &b"m"[..], &b"x"[..]]);
        assert!(bin.verify(None, None).is_ok());
        assert!(bin.verify(None, Some(b"x")).is_err());
        assert!(bin.verify(None, Some(b"y")).is_ok());
        assert!(bin.verify(Some(b"a"), None).is_ok());
        assert!(bin.verify(Some(b"b"), Some(b"y")).is_err());
    }

    #[test]
    fn test_insert_duplicate_hands_entry_back() {
        let db = database(8, DatabaseConfig::new());
        let mut bin = bin_with(&db, &[b"a", b"b"]);
        let outcome = bin
            .insert_entry1(ChildReference::new(None, b"b".to_vec(), Lsn::new(2, 0)))
            .unwrap();
        assert_eq!(outcome.flags(), 1 | EXACT_MATCH);
        match outcome {
            InsertOutcome::Duplicate { index, entry } => {
                assert_eq!(index, 1);
                assert_eq!(entry.lsn(), Lsn::new(2, 0));
            }
            InsertOutcome::Inserted(_) => panic!("expected duplicate"),
        }
        assert_eq!(bin.n_entries(), 2);
    }

    #[test]
    fn test_find_entry_bottom_node() {
        let db = database(8, DatabaseConfig::new());
        let mut bin = bin_with(&db, &[b"b", b"d", b"f"]);
        assert_eq!(bin.find_entry(b"d", false, false), 1);
        assert_eq!(bin.find_entry(b"d", true, false), 1 | EXACT_MATCH);
        assert_eq!(bin.find_entry(b"e", true, false), 1);
        assert_eq!(bin.find_entry(b"a", false, false), -1);
        assert_eq!(bin.find_entry(b"z", false, false), 2);
        assert_eq!(bin.find_entry(b"e", false, true), -1);
        bin.set_known_deleted(1);
        assert_eq!(bin.find_entry(b"d", false, true), -1);
        assert_eq!(bin.find_entry(b"d", false, false), 1);
    }

    #[test]
    fn test_find_entry_upper_node_slot_zero_low() {
        let db = database(8, DatabaseConfig::new());
        let mut node = In::new_in(&db, b"m".to_vec(), 8, 2);
        for key in [b"m", b"p", b"t"] {
            node.insert_entry(ChildReference::new(None, key.to_vec(), Lsn::new(1, 1)))
                .unwrap();
        }
        // Slot 0 covers every key below slot 1.
        assert_eq!(node.find_entry(b"a", false, false), 0);
        assert_eq!(node.find_entry(b"q", false, false), 1);
        assert_eq!(node.find_entry(b"a", true, false), -1);
        assert_eq!(node.find_entry(b"a", false, true), -1);
    }

    #[test]
    fn test_insert_into_full_node_fails() {
        let db = database(2, DatabaseConfig::new());
        let mut node = In::new_in(&db, b"a".to_vec(), 2, 2);
        node.insert_entry(ChildReference::new(None, b"a".to_vec(), Lsn::new(1, 1)))
            .unwrap();
        node.insert_entry(ChildReference::new(None, b"b".to_vec(), Lsn::new(1, 2)))
            .unwrap();
        assert!(node.needs_splitting());
        let err = node
            .insert_entry(ChildReference::new(None, b"c".to_vec(), Lsn::new(1, 3)))
            .unwrap_err();
        assert!(err.to_string().contains("should have been split"));
    }

    #[test]
    fn test_delete_entry() {
        let db = database(8, DatabaseConfig::new());
        let mut bin = bin_with(&db, &[b"a", b"b", b"c"]);
        assert!(!bin.delete_entry(3));
        assert!(bin.delete_entry(1));
        assert_eq!(bin.n_entries(), 2);
        assert_eq!(bin.key(1), b"c");
        assert_eq!(bin.lsn(1), Lsn::new(1, 102));
        assert!(bin.delete_entry_by_key(b"a"));
        assert!(!bin.delete_entry_by_key(b"a"));
        assert!(bin.verify_memory_size());
    }

    #[test]
    fn test_is_key_in_bounds() {
        let db = database(8, DatabaseConfig::new());
        let one = bin_with(&db, &[b"c"]);
        assert!(!one.is_key_in_bounds(b"c"));
        let bin = bin_with(&db, &[b"c", b"g"]);
        assert!(bin.is_key_in_bounds(b"c"));
        assert!(bin.is_key_in_bounds(b"e"));
        assert!(bin.is_key_in_bounds(b"g"));
        assert!(!bin.is_key_in_bounds(b"a"));
        assert!(!bin.is_key_in_bounds(b"h"));
    }

    #[test]
    fn test_state_bits_mark_dirty() {
        let db = database(8, DatabaseConfig::new());
        let mut bin = bin_with(&db, &[b"a"]);
        bin.set_dirty(false);
        bin.set_pending_deleted(0);
        assert!(bin.is_entry_pending_deleted(0));
        assert!(bin.is_dirty());
        bin.clear_pending_deleted(0);
        assert!(!bin.is_entry_pending_deleted(0));
        bin.set_migrate(0, true);
        assert!(bin.is_migrate(0));
        bin.set_known_deleted(0);
        assert!(bin.is_entry_known_deleted(0));
        assert!(!bin.is_migrate(0));
        bin.clear_known_deleted(0);
        assert!(!bin.is_entry_known_deleted(0));
    }

    #[test]
    fn test_update_entry_compare_key() {
        let db = database(8, DatabaseConfig::new());
        let mut node = In::new_in(&db, b"m".to_vec(), 8, 2);
        node.insert_entry(ChildReference::new(None, b"m".to_vec(), Lsn::new(1, 1)))
            .unwrap();
        node.update_entry_compare_key(0, None, Lsn::new(1, 9), b"p");
        assert_eq!(node.key(0), b"m");
        node.update_entry_compare_key(0, None, Lsn::new(1, 10), b"c");
        assert_eq!(node.key(0), b"c");
        assert_eq!(node.lsn(0), Lsn::new(1, 10));
    }

    #[test]
    fn test_deferred_write_keeps_real_lsn() {
        let db = database(8, DatabaseConfig::new().deferred_write(true));
        let mut bin = bin_with(&db, &[b"a"]);
        bin.update_entry_lsn(0, Lsn::NULL);
        assert_eq!(bin.lsn(0), Lsn::new(1, 100));
    }

    #[test]
    fn test_fetch_null_lsn() {
        let db = database(8, DatabaseConfig::new());
        let mut bin = In::new_bin(&db, b"a".to_vec(), 8, 1);
        bin.insert_entry(ChildReference::new(None, b"a".to_vec(), Lsn::NULL))
            .unwrap();
        let err = bin.fetch_target(0).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("NULL LSN without KnownDeleted"));
        bin.set_known_deleted(0);
        assert!(bin.fetch_target(0).unwrap().is_none());
    }

    #[test]
    fn test_memory_tracks_lsn_mutation() {
        let db = database(8, DatabaseConfig::new());
        let mut bin = bin_with(&db, &[b"a", b"b"]);
        assert!(bin.lsn_array().is_compact());
        bin.update_entry_lsn(1, Lsn::new(500, 10));
        assert!(!bin.lsn_array().is_compact());
        assert_eq!(bin.lsn(0), Lsn::new(1, 100));
        assert_eq!(bin.lsn(1), Lsn::new(500, 10));
        assert!(bin.verify_memory_size());
    }
}
