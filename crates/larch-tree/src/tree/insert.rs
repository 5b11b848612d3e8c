//! Record insertion.
//!
//! A record goes into the BIN for its key. When the key already has a live
//! record and the database allows duplicates, the slot is turned into a
//! duplicate tree, or the record goes into the existing one. Leaf locks are
//! taken without waiting while a latch is held; on a conflict the latch is
//! released for the wait and the cursor leads back to the slot.

use super::stats::TreeCounters;
use super::{Flow, Tree};
use crate::child_ref::ChildReference;
use crate::constants::{DBIN_LEVEL, DIN_ROOT_LEVEL};
use crate::cursor::TreeCursor;
use crate::in_node::{In, InsertOutcome};
use crate::latch::{ExclusiveLatch, NodeRef};
use crate::ln::Ln;
use crate::node::Target;
use crate::txn::{LockGrant, LockResult, LockType, Locker};
use larch_common::{compare_with, LarchError, NodeId, Result};
use larch_log::Lsn;
use std::cmp::Ordering;
use tracing::{debug, trace};

/// Which of the cursor's two positions a latch belongs to.
#[derive(Clone, Copy)]
pub(super) enum CursorLevel {
    Bin,
    DupBin,
}

impl CursorLevel {
    pub(super) fn relatch(self, cursor: &TreeCursor) -> Result<(ExclusiveLatch, usize)> {
        let latched = match self {
            CursorLevel::Bin => cursor.latch_bin().map(|b| (b, cursor.index())),
            CursorLevel::DupBin => cursor.latch_dbin().map(|b| (b, cursor.dup_index())),
        };
        latched.ok_or_else(|| LarchError::InconsistentState("cursor lost its position while waiting for a lock".into()))
    }
}

/// What a matching slot currently holds.
pub(super) enum SlotContent {
    /// Nothing resident and nothing to fetch: a deleted record.
    Empty,
    Leaf { node_id: NodeId, deleted: bool },
    DupTree,
}

impl SlotContent {
    pub(super) fn inspect(node: &mut In, index: usize) -> Result<Self> {
        let known_deleted = node.is_entry_known_deleted(index);
        Ok(match node.fetch_target(index)? {
            None => SlotContent::Empty,
            Some(Target::Node(_)) => SlotContent::DupTree,
            Some(Target::Leaf(ln)) => SlotContent::Leaf {
                node_id: ln.node_id(),
                deleted: known_deleted || ln.is_deleted(),
            },
        })
    }

    pub(super) fn is_deleted(&self) -> bool {
        match self {
            SlotContent::Empty => true,
            SlotContent::Leaf { deleted, .. } => *deleted,
            SlotContent::DupTree => false,
        }
    }
}

/// Locks `node_id` while `node` is latched, waiting without the latch when
/// another locker holds it. Returns the node relatched and the slot index.
pub(super) fn lock_latched<'c>(
    cursor: &'c TreeCursor,
    node: ExclusiveLatch,
    index: usize,
    level: CursorLevel,
    node_id: NodeId,
    lock_type: LockType,
) -> Result<(ExclusiveLatch, usize, LockResult<'c>)> {
    let locker = cursor.locker();
    let result = locker.non_blocking_lock(node_id, lock_type)?;
    if !result.is_denied() {
        return Ok((node, index, result));
    }
    drop(result);
    drop(node);
    let result = locker.lock(node_id, lock_type)?;
    let (node, index) = level.relatch(cursor)?;
    Ok((node, index, result))
}

/// Latches the duplicate root under slot `index` of `bin` and write locks
/// its count leaf, waiting without latches on a conflict. Returns the BIN
/// and slot index (relatched if needed), the root and the lock.
pub(super) fn lock_dup_count_ln<'c>(
    cursor: &'c TreeCursor,
    bin: ExclusiveLatch,
    index: usize,
) -> Result<(ExclusiveLatch, usize, ExclusiveLatch, LockResult<'c>)> {
    let locker = cursor.locker();
    let (mut bin, mut index) = (bin, index);
    let mut dup_root = bin.fetch_required_child(index)?.latch();
    let dcl_id = dup_root.fetch_dup_count_ln()?.node_id();
    let mut dcl_lock = locker.non_blocking_lock(dcl_id, LockType::Write)?;
    if dcl_lock.is_denied() {
        drop(dcl_lock);
        drop(dup_root);
        drop(bin);
        dcl_lock = locker.lock(dcl_id, LockType::Write)?;
        (bin, index) = CursorLevel::Bin.relatch(cursor)?;
        dup_root = bin.fetch_required_child(index)?.latch();
    }
    Ok((bin, index, dup_root, dcl_lock))
}

impl Tree {
    /// Inserts `ln` under `key`.
    ///
    /// Returns false when the key (or, in a duplicate tree, the key and data
    /// pair) already holds a live record. A slot whose record is deleted is
    /// reused. On success the cursor is positioned on the new record.
    pub fn insert(&self, ln: Ln, key: &[u8], allow_duplicates: bool, cursor: &TreeCursor) -> Result<bool> {
        if allow_duplicates && !self.database.sorted_duplicates() {
            return Err(LarchError::DuplicatesNotAllowed);
        }
        let locker = cursor.locker();
        // A new leaf is never locked by anyone else.
        let ln_lock = locker.lock(ln.node_id(), LockType::Write)?;
        let mut bin = self.find_bin_for_insert(key, cursor)?;
        let entry = ChildReference::new(Some(Target::Leaf(Box::new(ln))), key.to_vec(), Lsn::NULL);

        match bin.insert_entry1(entry)? {
            InsertOutcome::Inserted(index) => {
                cursor.update_bin(&mut bin, index);
                self.log_inserted_ln(&mut bin, index, key, locker)?;
                ln_lock.set_abort_lsn_created(Lsn::NULL, true);
                TreeCounters::bump(&self.counters.inserts);
                trace!(bin = %bin.node_id(), index, "inserted record");
                Ok(true)
            }
            InsertOutcome::Duplicate { index, entry } => {
                cursor.update_bin(&mut bin, index);
                let ln = take_leaf(entry)?;
                self.insert_at_existing_slot(bin, index, ln, key, allow_duplicates, cursor, &ln_lock)
            }
        }
    }

    /// Returns the BIN for `key`, latched, with room for one more slot.
    /// Creates the first nodes of an empty tree.
    pub(crate) fn find_bin_for_insert(&self, key: &[u8], cursor: &TreeCursor) -> Result<ExclusiveLatch> {
        if let Some(bin) = cursor.latch_bin() {
            if !bin.needs_splitting() && bin.is_key_in_bounds(key) {
                return Ok(bin);
            }
        }
        loop {
            if !self.root_exists() {
                let created = {
                    let mut root = self.root.write();
                    if super::root_exists(&root) {
                        false
                    } else {
                        self.create_first_nodes(&mut root, key)?;
                        true
                    }
                };
                if created {
                    self.optional_modify_db_root()?;
                }
                continue;
            }
            if let Some(bin) = self.search_splits_allowed(key, None, true)? {
                if !bin.is_bin() {
                    return Err(LarchError::InconsistentState(format!(
                        "insert search ended at non-bottom node {}",
                        bin.node_id()
                    )));
                }
                return Ok(bin);
            }
        }
    }

    /// Creates a root IN over one empty BIN.
    fn create_first_nodes(&self, root: &mut Option<ChildReference>, key: &[u8]) -> Result<()> {
        let env = self.database.env();
        let max_entries = self.database.node_max_entries();

        let bin_ref = NodeRef::new(In::new_bin(&self.database, key.to_vec(), max_entries, 1));
        let mut bin = bin_ref.latch();
        let bin_lsn = bin.optional_log_provisional(None)?;

        let root_ref = NodeRef::new(In::new_in(&self.database, key.to_vec(), max_entries, 2));
        let mut root_in = root_ref.latch();
        root_in.set_is_root(true);
        root_in.insert_entry(ChildReference::new(
            Some(Target::Node(bin_ref.clone())),
            key.to_vec(),
            bin_lsn,
        ))?;
        let root_lsn = root_in.optional_log()?;
        // The catalog leaf names the root, so the root counts as dirty until
        // the next checkpoint.
        root_in.set_dirty(true);
        *root = Some(ChildReference::new(
            Some(Target::Node(root_ref.clone())),
            Vec::new(),
            root_lsn,
        ));
        env.add_to_in_list(&mut bin, &bin_ref);
        env.add_to_in_list(&mut root_in, &root_ref);
        debug!(db_id = %self.database.id(), root = %root_in.node_id(), "created first nodes");
        Ok(())
    }

    /// Logs the leaf just inserted at `index` and records its LSN.
    fn log_inserted_ln(&self, node: &mut In, index: usize, key: &[u8], locker: &Locker) -> Result<()> {
        let logged = node
            .with_ln_mut(index, |ln| ln.optional_log(&self.database, key, Lsn::NULL, 0, Some(locker)))
            .ok_or_else(|| LarchError::InconsistentState(format!("slot {} lost its new leaf", index)))?;
        match logged {
            Ok(lsn) => {
                node.update_entry_lsn(index, lsn);
                Ok(())
            }
            Err(e) => {
                // Without a logged version the slot cannot be fetched.
                if !self.database.is_deferred_write() {
                    node.set_known_deleted(index);
                }
                Err(e)
            }
        }
    }

    /// Puts `ln` into slot `index`, whose record is deleted, and logs it.
    #[allow(clippy::too_many_arguments)]
    fn reuse_deleted_slot(
        &self,
        node: &mut In,
        index: usize,
        mut ln: Ln,
        slot_key: Vec<u8>,
        key: &[u8],
        existing_lock: Option<&LockResult<'_>>,
        ln_lock: &LockResult<'_>,
        locker: &Locker,
    ) -> Result<()> {
        let (abort_lsn, abort_known_deleted) = existing_lock
            .filter(|lock| lock.grant() == LockGrant::Existing)
            .and_then(|lock| locker.write_lock_info(lock.node_id()))
            .map_or((node.lsn(index), true), |info| {
                (info.abort_lsn, info.abort_known_deleted)
            });
        ln_lock.set_abort_lsn(abort_lsn, abort_known_deleted);
        let new_lsn = ln.optional_log(&self.database, key, Lsn::NULL, 0, Some(locker))?;
        node.update_entry_target_lsn_key(index, Some(Target::Leaf(Box::new(ln))), new_lsn, slot_key);
        node.clear_known_deleted(index);
        node.clear_pending_deleted(index);
        TreeCounters::bump(&self.counters.inserts);
        trace!(node_id = %node.node_id(), index, "reused deleted slot");
        Ok(())
    }

    /// Handles an insert whose key matched slot `index` of `bin`.
    #[allow(clippy::too_many_arguments)]
    fn insert_at_existing_slot(
        &self,
        bin: ExclusiveLatch,
        index: usize,
        ln: Ln,
        key: &[u8],
        allow_duplicates: bool,
        cursor: &TreeCursor,
        ln_lock: &LockResult<'_>,
    ) -> Result<bool> {
        let locker = cursor.locker();
        let (mut bin, mut index) = (bin, index);
        let mut current_lock = None;
        let mut content = SlotContent::inspect(&mut bin, index)?;
        if let SlotContent::Leaf { node_id, .. } = content {
            let (latched, relatched_index, lock) =
                lock_latched(cursor, bin, index, CursorLevel::Bin, node_id, LockType::Write)?;
            (bin, index) = (latched, relatched_index);
            current_lock = Some(lock);
            // The slot may have changed while the latch was released.
            content = SlotContent::inspect(&mut bin, index)?;
        }
        if content.is_deleted() {
            self.reuse_deleted_slot(&mut bin, index, ln, key.to_vec(), key, current_lock.as_ref(), ln_lock, locker)?;
            return Ok(true);
        }
        self.insert_duplicate(bin, index, ln, key, allow_duplicates, cursor, ln_lock)
    }

    // ------------------------------------------------------------------------
    // Duplicates
    // ------------------------------------------------------------------------

    /// Inserts `new_ln` as a duplicate of the live record at `index`.
    #[allow(clippy::too_many_arguments)]
    fn insert_duplicate(
        &self,
        bin: ExclusiveLatch,
        index: usize,
        new_ln: Ln,
        key: &[u8],
        allow_duplicates: bool,
        cursor: &TreeCursor,
        ln_lock: &LockResult<'_>,
    ) -> Result<bool> {
        let mut bin = bin;
        let has_dup_tree = matches!(bin.fetch_target(index)?, Some(Target::Node(_)));
        if !has_dup_tree {
            if !allow_duplicates {
                return Ok(false);
            }
            return self.create_duplicate_tree(&mut bin, index, key, new_ln, cursor, ln_lock);
        }
        self.insert_into_dup_tree(bin, index, new_ln, key, allow_duplicates, cursor, ln_lock)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_into_dup_tree(
        &self,
        bin: ExclusiveLatch,
        index: usize,
        new_ln: Ln,
        key: &[u8],
        allow_duplicates: bool,
        cursor: &TreeCursor,
        ln_lock: &LockResult<'_>,
    ) -> Result<bool> {
        let locker = cursor.locker();
        // The count leaf is locked before any record of the tree is logged.
        let (mut bin, index, mut dup_root, dcl_lock) = lock_dup_count_ln(cursor, bin, index)?;
        if !allow_duplicates && dup_root.duplicate_count()? > 0 {
            return Ok(false);
        }

        let dup_root = self.maybe_split_duplicate_root(&mut bin, index, dup_root)?;
        let new_data = new_ln.data().unwrap_or_default().to_vec();
        let previous_lsn = dup_root.last_full_version();
        let (mut dup_bin, current_lsn) =
            match self.search_sub_tree_splits_allowed(dup_root, &new_data, None, true)? {
                Flow::Done((Some(dup_bin), lsn)) => (dup_bin, lsn),
                Flow::Done((None, _)) | Flow::Retry(_) => {
                    return Err(LarchError::InconsistentState(format!(
                        "no room found in duplicate tree of slot {} in node {}",
                        index,
                        bin.node_id()
                    )))
                }
            };
        if current_lsn != previous_lsn {
            bin.update_entry_lsn(index, current_lsn);
        }
        drop(bin);

        let entry = ChildReference::new(Some(Target::Leaf(Box::new(new_ln))), new_data.clone(), Lsn::NULL);
        let inserted = match dup_bin.insert_entry1(entry)? {
            InsertOutcome::Inserted(dup_index) => {
                cursor.update_dbin(&mut dup_bin, dup_index);
                self.log_inserted_ln(&mut dup_bin, dup_index, key, locker)?;
                ln_lock.set_abort_lsn_created(Lsn::NULL, true);
                TreeCounters::bump(&self.counters.inserts);
                true
            }
            InsertOutcome::Duplicate { index: dup_index, entry } => {
                cursor.update_dbin(&mut dup_bin, dup_index);
                let ln = take_leaf(entry)?;
                let mut current_lock = None;
                let mut dup_index = dup_index;
                let mut content = SlotContent::inspect(&mut dup_bin, dup_index)?;
                if let SlotContent::Leaf { node_id, .. } = content {
                    let (latched, relatched_index, lock) =
                        lock_latched(cursor, dup_bin, dup_index, CursorLevel::DupBin, node_id, LockType::Write)?;
                    (dup_bin, dup_index) = (latched, relatched_index);
                    current_lock = Some(lock);
                    content = SlotContent::inspect(&mut dup_bin, dup_index)?;
                }
                let deleted = content.is_deleted();
                if deleted {
                    self.reuse_deleted_slot(
                        &mut dup_bin,
                        dup_index,
                        ln,
                        new_data,
                        key,
                        current_lock.as_ref(),
                        ln_lock,
                        locker,
                    )?;
                }
                deleted
            }
        };
        drop(dup_bin);

        if inserted {
            // Latch order is BIN, then the duplicate root.
            let (mut bin, index) = CursorLevel::Bin.relatch(cursor)?;
            let mut dup_root = bin.fetch_required_child(index)?.latch();
            drop(bin);
            let count = dup_root.increment_duplicate_count(&dcl_lock, key, locker, true)?;
            trace!(dup_root = %dup_root.node_id(), count, "inserted duplicate");
        }
        Ok(inserted)
    }

    /// Splits a full duplicate tree root under a new root one level up.
    /// Returns whichever node is now the root, latched.
    pub(super) fn maybe_split_duplicate_root(
        &self,
        bin: &mut ExclusiveLatch,
        index: usize,
        dup_root: ExclusiveLatch,
    ) -> Result<ExclusiveLatch> {
        let mut current = dup_root;
        if !current.needs_splitting() {
            return Ok(current);
        }
        let max_entries = self.database.node_max_dup_tree_entries();
        let id_key = current.key(0).to_vec();
        let dup_key = current.dup_key().unwrap_or_default().to_vec();
        let Some(dcl_ref) = current.take_dup_count_ln_ref()? else {
            return Err(LarchError::InconsistentState(format!(
                "duplicate tree root {} has no count leaf",
                current.node_id()
            )));
        };

        let new_root_ref = NodeRef::new(In::new_din(
            &self.database,
            id_key.clone(),
            max_entries,
            dup_key,
            dcl_ref,
            current.level() + 1,
        ));
        let mut new_root = new_root_ref.latch();
        new_root.set_is_root(true);
        current.set_is_root(false);

        let logged = current
            .optional_log_provisional(Some(&mut *new_root))
            .and_then(|current_lsn| {
                new_root.insert_entry(ChildReference::new(
                    Some(Target::Node(NodeRef::from_latch(&current))),
                    id_key,
                    current_lsn,
                ))?;
                new_root.optional_log()
            });
        let log_lsn = match logged {
            Ok(lsn) => lsn,
            Err(e) => {
                current.set_is_root(true);
                if let Some(dcl_ref) = new_root.take_dup_count_ln_ref()? {
                    current.set_dup_count_ln(dcl_ref)?;
                }
                return Err(e);
            }
        };
        self.database.env().add_to_in_list(&mut new_root, &new_root_ref);
        bin.update_entry_target_lsn(index, Some(Target::Node(new_root_ref.clone())), log_lsn);

        In::split(&mut current, &mut new_root, 0, max_entries)?;
        bin.update_entry_lsn(index, new_root.last_full_version());
        TreeCounters::bump(&self.counters.splits);
        debug!(
            old_root = %current.node_id(),
            new_root = %new_root.node_id(),
            "split duplicate tree root"
        );
        Ok(new_root)
    }

    /// Replaces the live record at `index` with a duplicate tree holding it
    /// and `new_ln`. Returns false if both carry equal data.
    #[allow(clippy::too_many_arguments)]
    fn create_duplicate_tree(
        &self,
        bin: &mut ExclusiveLatch,
        index: usize,
        key: &[u8],
        new_ln: Ln,
        cursor: &TreeCursor,
        ln_lock: &LockResult<'_>,
    ) -> Result<bool> {
        let env = self.database.env();
        let locker = cursor.locker();
        let known_deleted = bin.is_entry_known_deleted(index);
        let existing_lsn = bin.lsn(index);
        let existing_state = bin.state(index);
        let (existing_data, existing_id, existing_deleted) = match bin.fetch_ln(index)? {
            Some(ln) => (ln.data().unwrap_or_default().to_vec(), ln.node_id(), ln.is_deleted()),
            None => {
                return Err(LarchError::InconsistentState(format!(
                    "slot {} of node {} has no record to duplicate",
                    index,
                    bin.node_id()
                )))
            }
        };
        let new_data = new_ln.data().unwrap_or_default().to_vec();
        if compare_with(self.database.duplicate_comparator(), &new_data, &existing_data) == Ordering::Equal {
            return Ok(false);
        }
        ln_lock.set_abort_lsn_created(Lsn::NULL, true);

        // The count a rollback returns to: a record created or deleted by
        // this locker does not count.
        let starting_count = if locker.created_node(existing_id)
            || known_deleted
            || existing_deleted
            || locker
                .write_lock_info(existing_id)
                .is_some_and(|info| info.abort_known_deleted)
        {
            0
        } else {
            1
        };

        let max_entries = self.database.node_max_dup_tree_entries();
        let mut dcl = Ln::new_dup_count(env, starting_count);
        let first_dcl_lsn = dcl.optional_log_provisional(&self.database, key, Lsn::NULL, 0)?;
        let first_dcl = (first_dcl_lsn, dcl.last_logged_size(), dcl.node_id());

        let dup_root_ref = NodeRef::new(In::new_din(
            &self.database,
            existing_data.clone(),
            max_entries,
            key.to_vec(),
            ChildReference::new(Some(Target::Leaf(Box::new(dcl))), key.to_vec(), first_dcl_lsn),
            DIN_ROOT_LEVEL,
        ));
        let mut dup_root = dup_root_ref.latch();
        dup_root.set_is_root(true);

        let dup_bin_ref = NodeRef::new(In::new_dbin(
            &self.database,
            existing_data.clone(),
            max_entries,
            key.to_vec(),
            DBIN_LEVEL,
        ));
        let mut dup_bin = dup_bin_ref.latch();
        let existing = bin.set_target(index, None);
        let filled = dup_bin
            .insert_entry(ChildReference::with_state(
                existing,
                existing_data.clone(),
                existing_lsn,
                existing_state,
            ))
            .and_then(|_| {
                self.fill_duplicate_tree(
                    (&mut dup_root, &dup_root_ref),
                    (&mut dup_bin, &dup_bin_ref),
                    key,
                    existing_data.clone(),
                    new_ln,
                    first_dcl,
                    locker,
                )
            });
        let (dup_index, dup_root_lsn) = match filled {
            Ok(done) => done,
            Err(err) => {
                // Put the record back and forget the half-built tree.
                let found = dup_bin.find_entry(&existing_data, false, true);
                if found >= 0 {
                    let existing = dup_bin.set_target(found as usize, None);
                    bin.set_target(index, existing);
                }
                env.remove_from_in_list(&mut dup_bin);
                env.remove_from_in_list(&mut dup_root);
                return Err(err);
            }
        };

        cursor.update_dbin(&mut dup_bin, dup_index);
        // Other cursors on the old record follow it into the DBIN.
        bin.adjust_cursors_for_mutation(index, &mut dup_bin, dup_index ^ 1, Some(cursor.handle()));
        drop(dup_bin);

        bin.update_entry_target_lsn(index, Some(Target::Node(dup_root_ref.clone())), dup_root_lsn);
        bin.set_migrate(index, false);
        TreeCounters::bump(&self.counters.duplicate_trees_created);
        TreeCounters::bump(&self.counters.inserts);
        debug!(bin = %bin.node_id(), index, dup_root = %dup_root.node_id(), "created duplicate tree");
        Ok(true)
    }

    /// Logs a new duplicate tree holding the existing record, then adds
    /// `new_ln` to it. Returns the new record's DBIN slot and the root LSN.
    #[allow(clippy::too_many_arguments)]
    fn fill_duplicate_tree(
        &self,
        (dup_root, dup_root_ref): (&mut ExclusiveLatch, &NodeRef),
        (dup_bin, dup_bin_ref): (&mut ExclusiveLatch, &NodeRef),
        key: &[u8],
        existing_data: Vec<u8>,
        mut new_ln: Ln,
        (first_dcl_lsn, first_dcl_size, dcl_id): (Lsn, usize, NodeId),
        locker: &Locker,
    ) -> Result<(usize, Lsn)> {
        let env = self.database.env();
        let dup_bin_lsn = dup_bin.optional_log_provisional(Some(&mut **dup_root))?;
        env.add_to_in_list(dup_bin, dup_bin_ref);
        dup_root.set_entry(0, Some(Target::Node(dup_bin_ref.clone())), existing_data, dup_bin_lsn, 0)?;
        let dup_root_lsn = dup_root.optional_log()?;
        env.add_to_in_list(dup_root, dup_root_ref);

        // The count leaf is new, so its lock is granted at once.
        let dcl_lock = locker.lock(dcl_id, LockType::Write)?;
        dcl_lock.set_abort_lsn(first_dcl_lsn, false);
        let dcl_lsn = {
            let dcl = dup_root.fetch_dup_count_ln()?;
            dcl.set_dup_count(2)?;
            dcl.optional_log(&self.database, key, first_dcl_lsn, first_dcl_size, Some(locker))?
        };
        dup_root.update_dup_count_ln_ref(dcl_lsn)?;

        let new_data = new_ln.data().unwrap_or_default().to_vec();
        let new_lsn = new_ln.optional_log(&self.database, key, Lsn::NULL, 0, Some(locker))?;
        match dup_bin.insert_entry1(ChildReference::new(Some(Target::Leaf(Box::new(new_ln))), new_data, new_lsn))? {
            InsertOutcome::Inserted(dup_index) => Ok((dup_index, dup_root_lsn)),
            InsertOutcome::Duplicate { .. } => Err(LarchError::InconsistentState(format!(
                "new duplicate tree {} already holds the inserted data",
                dup_root.node_id()
            ))),
        }
    }
}

fn take_leaf(entry: ChildReference) -> Result<Ln> {
    match entry.into_parts().0 {
        Some(Target::Leaf(ln)) => Ok(*ln),
        _ => Err(LarchError::Internal("insert entry lost its leaf".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::tree;
    use super::super::SearchType;
    use super::*;
    use crate::constants::{EXACT_MATCH, INDEX_MASK};
    use crate::env::DatabaseConfig;
    use crate::env::Environment;
    use crate::txn::Locker;
    use bytes::Bytes;
    use larch_common::EnvironmentConfig;
    use larch_log::{LogEntryType, LogManager, LogRecord, MemoryLogManager, UtilizationTracker};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn put(tree: &Tree, key: &[u8], data: &[u8], dups: bool) -> bool {
        let env = tree.database().env();
        let cursor = TreeCursor::new(Locker::basic(env));
        let inserted = tree.insert(Ln::new(env, data.to_vec()), key, dups, &cursor).unwrap();
        cursor.locker().operation_end().unwrap();
        inserted
    }

    fn bin_keys(node: &In) -> Vec<u8> {
        (0..node.n_entries()).map(|i| node.key(i)[0]).collect()
    }

    fn dup_count(tree: &Tree, key: &[u8]) -> i32 {
        let guard = tree.search(key, SearchType::Normal, None, None, false).unwrap().unwrap();
        let mut bin = guard.into_exclusive().unwrap();
        let found = bin.find_entry(key, true, true);
        assert!(found >= 0);
        let child = bin.fetch_required_child((found & INDEX_MASK) as usize).unwrap();
        drop(bin);
        let mut din = child.latch();
        din.duplicate_count().unwrap()
    }

    #[test]
    fn test_scrambled_inserts_split_once() {
        let tree = tree(4, DatabaseConfig::new());
        for k in [5u8, 3, 8, 1, 9, 2, 7] {
            assert!(put(&tree, &[k], &[k], false));
        }
        let stats = tree.stats();
        assert_eq!(stats.splits, 1);
        assert_eq!(stats.root_splits, 0);

        let first = tree.get_first_node().unwrap().unwrap();
        assert_eq!(bin_keys(&first), vec![1, 2, 3]);
        drop(first);
        let last = tree.get_last_node().unwrap().unwrap();
        assert_eq!(bin_keys(&last), vec![5, 7, 8, 9]);
        drop(last);

        let bin = tree.search(&[6], SearchType::Normal, None, None, false).unwrap().unwrap();
        assert_eq!(bin_keys(&bin), vec![5, 7, 8, 9]);
        assert_eq!(bin.find_entry(&[6], true, true), -1);
        assert_eq!(bin.find_entry(&[6], true, false) & EXACT_MATCH, 0);
        drop(bin);
        tree.verify().unwrap();

        // The first nodes are a root IN over one BIN, so the root only
        // splits once it holds more BINs than fit.
        let mut k = 10u8;
        while tree.stats().root_splits == 0 {
            assert!(put(&tree, &[k], &[k], false));
            k += 1;
        }
        assert_eq!(tree.stats().root_splits, 1);
        assert!(k < 40);
        tree.verify().unwrap();
    }

    #[test]
    fn test_existing_key_is_rejected() {
        let tree = tree(4, DatabaseConfig::new());
        assert!(put(&tree, b"k", b"one", false));
        assert!(!put(&tree, b"k", b"two", false));
        assert_eq!(tree.stats().inserts, 1);
    }

    #[test]
    fn test_duplicates_need_sorted_database() {
        let tree = tree(4, DatabaseConfig::new());
        let env = tree.database().env();
        let cursor = TreeCursor::new(Locker::basic(env));
        let err = tree.insert(Ln::new(env, b"a".to_vec()), b"k", true, &cursor).unwrap_err();
        assert!(matches!(err, LarchError::DuplicatesNotAllowed));
    }

    #[test]
    fn test_duplicate_lifecycle() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        assert!(put(&tree, &[42], b"a", true));
        assert!(put(&tree, &[42], b"b", true));
        assert!(!put(&tree, &[42], b"a", true));
        assert_eq!(dup_count(&tree, &[42]), 2);
        let stats = tree.stats();
        assert_eq!(stats.duplicate_trees_created, 1);
        assert_eq!(stats.inserts, 2);
        tree.verify().unwrap();
    }

    #[test]
    fn test_equal_data_does_not_create_dup_tree() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        assert!(put(&tree, b"k", b"same", true));
        assert!(!put(&tree, b"k", b"same", true));
        assert_eq!(tree.stats().duplicate_trees_created, 0);
    }

    #[test]
    fn test_duplicate_tree_grows() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        for d in 0..30u8 {
            assert!(put(&tree, b"k", &[d], true));
        }
        assert_eq!(dup_count(&tree, b"k"), 30);
        assert!(tree.stats().splits > 0);
        tree.verify().unwrap();
        assert!(tree.validate_in_list().unwrap());
    }

    #[test]
    fn test_no_overwrite_into_dup_tree() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        assert!(put(&tree, b"k", b"a", true));
        assert!(put(&tree, b"k", b"b", true));
        assert!(!put(&tree, b"k", b"c", false));
        assert_eq!(dup_count(&tree, b"k"), 2);
    }

    #[test]
    fn test_cursor_lands_on_new_record() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        let env = tree.database().env();
        let cursor = TreeCursor::new(Locker::basic(env));
        assert!(tree.insert(Ln::new(env, b"x".to_vec()), b"k", true, &cursor).unwrap());
        let bin = cursor.latch_bin().unwrap();
        assert_eq!(bin.key(cursor.index()), b"k");
        drop(bin);
        assert!(tree.insert(Ln::new(env, b"y".to_vec()), b"k", true, &cursor).unwrap());
        let dup_bin = cursor.latch_dbin().unwrap();
        assert_eq!(dup_bin.key(cursor.dup_index()), b"y");
    }

    #[test]
    fn test_deferred_write_insert_leaves_null_lsn() {
        let tree = tree(4, DatabaseConfig::new().deferred_write(true));
        assert!(put(&tree, b"k", b"v", false));
        let bin = tree.search(b"k", SearchType::Normal, None, None, false).unwrap().unwrap();
        assert!(bin.lsn(0).is_null());
        assert!(!bin.is_entry_known_deleted(0));
    }

    /// Fails every DIN write while `fail` is set.
    struct FailingDinLog {
        inner: MemoryLogManager,
        fail: AtomicBool,
    }

    impl LogManager for FailingDinLog {
        fn log(
            &self,
            entry_type: LogEntryType,
            payload: Bytes,
            provisional: bool,
            background_io: bool,
            old_lsn: Lsn,
            old_size: usize,
        ) -> Result<Lsn> {
            if entry_type == LogEntryType::Din && self.fail.load(AtomicOrdering::Relaxed) {
                return Err(LarchError::LogWriteFailed("din write refused".into()));
            }
            self.inner.log(entry_type, payload, provisional, background_io, old_lsn, old_size)
        }

        fn get(&self, lsn: Lsn) -> Result<LogRecord> {
            self.inner.get(lsn)
        }

        fn tracker(&self) -> &UtilizationTracker {
            self.inner.tracker()
        }

        fn end_of_log(&self) -> Lsn {
            self.inner.end_of_log()
        }
    }

    #[test]
    fn test_failed_duplicate_tree_restores_record() {
        let config = EnvironmentConfig::default().with_max_entries(4);
        let log = Arc::new(FailingDinLog {
            inner: MemoryLogManager::new(config.log_file_max),
            fail: AtomicBool::new(false),
        });
        let env = Environment::with_log_manager(config, log.clone()).unwrap();
        let tree = env.open_tree(DatabaseConfig::new().sorted_duplicates(true)).unwrap();
        assert!(put(&tree, b"k", b"a", true));
        let resident = env.in_list().len();

        log.fail.store(true, AtomicOrdering::Relaxed);
        let cursor = TreeCursor::new(Locker::basic(&env));
        let err = tree.insert(Ln::new(&env, b"b".to_vec()), b"k", true, &cursor).unwrap_err();
        assert!(matches!(err, LarchError::LogWriteFailed(_)));
        cursor.locker().operation_end().unwrap();

        assert_eq!(env.in_list().len(), resident);
        assert_eq!(tree.stats().duplicate_trees_created, 0);
        assert_eq!(tree.get(b"k").unwrap(), Some(b"a".to_vec()));
        assert!(tree.validate_in_list().unwrap());
        tree.verify().unwrap();

        log.fail.store(false, AtomicOrdering::Relaxed);
        assert!(put(&tree, b"k", b"b", true));
        assert_eq!(tree.get_duplicates(b"k").unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(env.in_list().len(), resident + 2);
    }

    #[test]
    fn test_equal_duplicate_records_no_abort_lsn() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        let env = tree.database().env();
        assert!(put(&tree, b"k", b"a", true));

        let locker = Locker::transactional(env);
        let cursor = TreeCursor::new(locker.clone());
        let ln = Ln::new(env, b"a".to_vec());
        let ln_id = ln.node_id();
        assert!(!tree.insert(ln, b"k", true, &cursor).unwrap());

        let info = locker.write_lock_info(ln_id).unwrap();
        assert!(info.never_locked);
        assert!(!locker.created_node(ln_id));
        assert_eq!(tree.stats().duplicate_trees_created, 0);
        locker.commit().unwrap();
    }
}
