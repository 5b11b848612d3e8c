//! Duplicate tree nodes.
//!
//! A DIN roots the duplicate tree of one main tree key and carries the
//! reference to that tree's duplicate count leaf. A DBIN is the bottom node
//! of a duplicate tree. Both remember the main tree key (`dup_key`) and
//! order their slots by the duplicate comparator.

use super::{BinState, In, InKind};
use crate::child_ref::ChildReference;
use crate::env::Database;
use crate::ln::Ln;
use crate::node::Target;
use crate::txn::{LockResult, Locker};
use larch_cache::byte_array_size;
use larch_common::{LarchError, Result};
use larch_log::Lsn;
use std::sync::Arc;

/// DIN specific state.
#[derive(Debug)]
pub struct DinState {
    dup_key: Vec<u8>,
    dup_count_ln_ref: Option<ChildReference>,
}

impl DinState {
    pub fn new(dup_key: Vec<u8>, dup_count_ln_ref: Option<ChildReference>) -> Self {
        Self {
            dup_key,
            dup_count_ln_ref,
        }
    }

    pub fn dup_key(&self) -> &[u8] {
        &self.dup_key
    }

    pub fn dup_count_ln_ref(&self) -> Option<&ChildReference> {
        self.dup_count_ln_ref.as_ref()
    }
}

impl In {
    /// Creates a duplicate tree upper node for main tree key `dup_key`.
    pub fn new_din(
        db: &Arc<Database>,
        identifier_key: Vec<u8>,
        capacity: usize,
        dup_key: Vec<u8>,
        dup_count_ln_ref: ChildReference,
        level: i32,
    ) -> Self {
        let kind = InKind::DupUpper(DinState::new(dup_key, Some(dup_count_ln_ref)));
        Self::build(db, identifier_key, capacity, level, kind)
    }

    /// Creates a duplicate tree bottom node for main tree key `dup_key`.
    pub fn new_dbin(
        db: &Arc<Database>,
        identifier_key: Vec<u8>,
        capacity: usize,
        dup_key: Vec<u8>,
        level: i32,
    ) -> Self {
        let kind = InKind::DupBottom {
            bin: BinState::default(),
            dup_key,
        };
        Self::build(db, identifier_key, capacity, level, kind)
    }

    /// Main tree key of a duplicate tree node.
    pub fn dup_key(&self) -> Option<&[u8]> {
        match &self.kind {
            InKind::DupUpper(din) => Some(&din.dup_key),
            InKind::DupBottom { dup_key, .. } => Some(dup_key),
            _ => None,
        }
    }

    fn din(&self) -> Result<&DinState> {
        match &self.kind {
            InKind::DupUpper(din) => Ok(din),
            _ => Err(self.not_a_din()),
        }
    }

    fn din_mut(&mut self) -> Result<&mut DinState> {
        let err = self.not_a_din();
        match &mut self.kind {
            InKind::DupUpper(din) => Ok(din),
            _ => Err(err),
        }
    }

    fn not_a_din(&self) -> LarchError {
        LarchError::InconsistentState(format!("node {} is not a duplicate tree root", self.node_id))
    }

    pub fn dup_count_ln_ref(&self) -> Option<&ChildReference> {
        self.din().ok().and_then(DinState::dup_count_ln_ref)
    }

    /// Replaces the duplicate count reference.
    pub fn set_dup_count_ln(&mut self, reference: ChildReference) -> Result<()> {
        let old_size = self.kind_memory_size();
        self.din_mut()?.dup_count_ln_ref = Some(reference);
        let new_size = self.kind_memory_size();
        self.update_memory_size(old_size, new_size);
        self.dirty = true;
        Ok(())
    }

    /// Removes the duplicate count reference, for handing it to a new root.
    pub fn take_dup_count_ln_ref(&mut self) -> Result<Option<ChildReference>> {
        let old_size = self.kind_memory_size();
        let reference = self.din_mut()?.dup_count_ln_ref.take();
        let new_size = self.kind_memory_size();
        self.update_memory_size(old_size, new_size);
        self.dirty = true;
        Ok(reference)
    }

    /// Points the duplicate count reference at a newly logged version.
    pub fn update_dup_count_ln_ref(&mut self, lsn: Lsn) -> Result<()> {
        let db = self.database.clone();
        let reference = self
            .din_mut()?
            .dup_count_ln_ref
            .as_mut()
            .ok_or_else(|| LarchError::InconsistentState("duplicate tree root without count".into()))?;
        reference.update_lsn_after_optional_log(&db, lsn);
        self.dirty = true;
        Ok(())
    }

    /// Makes `ln` the resident duplicate count leaf.
    pub fn update_dup_count_ln(&mut self, ln: Ln) -> Result<()> {
        let old_size = self.kind_memory_size();
        if let Some(reference) = self.din_mut()?.dup_count_ln_ref.as_mut() {
            reference.set_target(Some(Target::Leaf(Box::new(ln))));
        }
        let new_size = self.kind_memory_size();
        self.update_memory_size(old_size, new_size);
        Ok(())
    }

    /// Returns the duplicate count leaf, reading it from the log if needed.
    pub fn fetch_dup_count_ln(&mut self) -> Result<&mut Ln> {
        self.with_dup_count_ln(|ln, _, _| Ok(ln.dup_count()))?;
        let node_id = self.node_id;
        self.din_mut()?
            .dup_count_ln_ref
            .as_mut()
            .and_then(|r| r.target_mut())
            .and_then(Target::as_ln_mut)
            .ok_or_else(|| {
                LarchError::InconsistentState(format!("duplicate count of {} is missing", node_id))
            })
    }

    /// Runs `f` on the fetched duplicate count leaf together with its
    /// reference's LSN and known deleted state.
    fn with_dup_count_ln<R>(&mut self, f: impl FnOnce(&mut Ln, Lsn, bool) -> Result<R>) -> Result<R> {
        let db = self.database.clone();
        let parent = self.parent_info();
        let old_size = self.kind_memory_size();
        let node_id = self.node_id;
        let result = {
            let reference = self.din_mut()?.dup_count_ln_ref.as_mut().ok_or_else(|| {
                LarchError::InconsistentState(format!("duplicate tree root {} has no count", node_id))
            })?;
            let lsn = reference.lsn();
            let known_deleted = reference.is_known_deleted();
            match reference.fetch_ln(&db, Some(parent))? {
                Some(ln) => f(ln, lsn, known_deleted),
                None => Err(LarchError::InconsistentState(format!(
                    "duplicate count of {} is missing",
                    node_id
                ))),
            }
        };
        let new_size = self.kind_memory_size();
        self.update_memory_size(old_size, new_size);
        result
    }

    /// Number of records in this duplicate tree.
    pub fn duplicate_count(&mut self) -> Result<i32> {
        self.with_dup_count_ln(|ln, _, _| Ok(ln.dup_count()))
    }

    /// Adjusts the duplicate count by one and logs the count leaf.
    ///
    /// The caller holds the write lock on the count leaf; its current
    /// version becomes the abort version.
    pub fn increment_duplicate_count(
        &mut self,
        lock_result: &LockResult<'_>,
        key: &[u8],
        locker: &Locker,
        increment: bool,
    ) -> Result<i32> {
        let db = self.database.clone();
        let (count, new_lsn) = self.with_dup_count_ln(|ln, old_lsn, known_deleted| {
            lock_result.set_abort_lsn(old_lsn, known_deleted);
            let count = if increment {
                ln.increment_dup_count()?
            } else {
                ln.decrement_dup_count()?
            };
            let old_size = ln.last_logged_size();
            let new_lsn = ln.optional_log(&db, key, old_lsn, old_size, Some(locker))?;
            Ok((count, new_lsn))
        })?;
        self.update_dup_count_ln_ref(new_lsn)?;
        Ok(count)
    }

    /// Logs the duplicate count leaf if it changed since it was last logged.
    pub(super) fn log_dirty_dup_count_ln(&mut self) -> Result<()> {
        let db = self.database.clone();
        let Some(din) = (match &mut self.kind {
            InKind::DupUpper(din) => Some(din),
            _ => None,
        }) else {
            return Ok(());
        };
        let key = din.dup_key.clone();
        let Some(reference) = din.dup_count_ln_ref.as_mut() else {
            return Ok(());
        };
        let old_lsn = reference.lsn();
        let Some(ln) = reference.target_mut().and_then(Target::as_ln_mut) else {
            return Ok(());
        };
        if !ln.is_dirty() {
            return Ok(());
        }
        let old_size = ln.last_logged_size();
        let lsn = ln.log(&db, &key, None, old_lsn, old_size, None, false, false)?;
        reference.set_lsn(lsn);
        Ok(())
    }

    /// Memory held by kind specific state.
    pub(super) fn kind_memory_size(&self) -> i64 {
        match &self.kind {
            InKind::Upper | InKind::Bottom(_) => 0,
            InKind::DupUpper(din) => {
                byte_array_size(din.dup_key.len())
                    + din.dup_count_ln_ref.as_ref().map_or(0, |r| {
                        byte_array_size(r.key().len())
                            + r.target().map_or(0, Target::memory_size_included_by_parent)
                    })
            }
            InKind::DupBottom { dup_key, .. } => byte_array_size(dup_key.len()),
        }
    }
}
