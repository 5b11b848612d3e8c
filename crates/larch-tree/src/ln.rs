//! Leaf nodes.
//!
//! A leaf holds one record's data. A leaf with no data is deleted. Besides
//! ordinary records there are duplicate count leaves, which sit beside a
//! duplicate tree root, and the catalog leaves that map databases.

use crate::codec::{self, AbortInfo};
use crate::env::{Database, Environment};
use crate::txn::Locker;
use larch_cache::{byte_array_size, DUPCOUNTLN_OVERHEAD, LN_OVERHEAD, MAPLN_OVERHEAD};
use larch_common::{DatabaseId, LarchError, NodeId, Result};
use larch_log::constants::HEADER_SIZE;
use larch_log::{LogEntryType, Lsn};

/// What a leaf represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LnKind {
    /// An ordinary record.
    Data,
    /// Number of live records in a duplicate tree.
    DupCount { count: i32 },
    /// Catalog record holding a database's root LSN.
    Map { db_id: DatabaseId, root_lsn: Lsn },
    /// Catalog record mapping a name (the leaf's data) to a database id.
    Name { db_id: DatabaseId },
}

/// A leaf node.
#[derive(Debug, Clone)]
pub struct Ln {
    node_id: NodeId,
    data: Option<Vec<u8>>,
    dirty: bool,
    last_logged_size: usize,
    kind: LnKind,
}

impl Ln {
    /// Creates a record leaf with a fresh node id.
    pub fn new(env: &Environment, data: impl Into<Vec<u8>>) -> Self {
        Self::with_id(env.next_node_id(), Some(data.into()), LnKind::Data)
    }

    /// Creates a duplicate count leaf.
    pub fn new_dup_count(env: &Environment, count: i32) -> Self {
        Self::with_id(
            env.next_node_id(),
            Some(Vec::new()),
            LnKind::DupCount { count },
        )
    }

    /// Creates a catalog leaf recording `root_lsn` for `db_id`.
    pub fn new_map(env: &Environment, db_id: DatabaseId, root_lsn: Lsn) -> Self {
        Self::with_id(
            env.next_node_id(),
            Some(Vec::new()),
            LnKind::Map { db_id, root_lsn },
        )
    }

    /// Creates a catalog leaf mapping `name` to `db_id`.
    pub fn new_name(env: &Environment, name: &[u8], db_id: DatabaseId) -> Self {
        Self::with_id(env.next_node_id(), Some(name.to_vec()), LnKind::Name { db_id })
    }

    pub(crate) fn with_id(node_id: NodeId, data: Option<Vec<u8>>, kind: LnKind) -> Self {
        Self {
            node_id,
            data,
            dirty: true,
            last_logged_size: 0,
            kind,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn kind(&self) -> &LnKind {
        &self.kind
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Returns true once the record has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.data.is_none()
    }

    pub fn make_deleted(&mut self) {
        self.data = None;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Size of the most recent log entry for this leaf, header included.
    pub fn last_logged_size(&self) -> usize {
        self.last_logged_size
    }

    /// Marks a leaf read from a log entry of `logged_size` bytes as clean.
    pub(crate) fn post_fetch_init(&mut self, logged_size: usize) {
        self.last_logged_size = logged_size;
        self.dirty = false;
    }

    /// Returns true for a duplicate count leaf.
    pub fn contains_duplicates(&self) -> bool {
        matches!(self.kind, LnKind::DupCount { .. })
    }

    /// Catalog leaves stay resident while their database is open.
    pub fn is_evictable(&self) -> bool {
        !matches!(self.kind, LnKind::Map { .. })
    }

    /// A leaf is never a deletable subtree.
    pub fn is_valid_for_delete(&self) -> bool {
        false
    }

    /// Returns the duplicate count, or 0 for other leaves.
    pub fn dup_count(&self) -> i32 {
        match self.kind {
            LnKind::DupCount { count } => count,
            _ => 0,
        }
    }

    pub fn set_dup_count(&mut self, value: i32) -> Result<()> {
        match &mut self.kind {
            LnKind::DupCount { count } => {
                *count = value;
                self.dirty = true;
                Ok(())
            }
            _ => Err(LarchError::InconsistentState(format!(
                "leaf {} is not a duplicate count leaf",
                self.node_id
            ))),
        }
    }

    pub fn increment_dup_count(&mut self) -> Result<i32> {
        let count = self.dup_count() + 1;
        self.set_dup_count(count)?;
        Ok(count)
    }

    pub fn decrement_dup_count(&mut self) -> Result<i32> {
        let count = self.dup_count() - 1;
        if count < 0 {
            return Err(LarchError::InconsistentState(format!(
                "duplicate count of leaf {} went negative",
                self.node_id
            )));
        }
        self.set_dup_count(count)?;
        Ok(count)
    }

    /// Memory charged to the slot holding this leaf.
    pub fn memory_size_included_by_parent(&self) -> i64 {
        match self.kind {
            LnKind::DupCount { .. } => DUPCOUNTLN_OVERHEAD,
            LnKind::Map { .. } => MAPLN_OVERHEAD,
            LnKind::Data | LnKind::Name { .. } => {
                LN_OVERHEAD + self.data.as_ref().map_or(0, |d| byte_array_size(d.len()))
            }
        }
    }

    /// Deletes the record and logs the deletion.
    ///
    /// For a duplicate the leaf is logged as a deleted duplicate carrying
    /// the main tree key, except in a deferred write database where it was
    /// never logged at all.
    pub fn delete(
        &mut self,
        db: &Database,
        ln_key: &[u8],
        dup_key: Option<&[u8]>,
        old_lsn: Lsn,
        locker: &Locker,
    ) -> Result<Lsn> {
        self.make_deleted();
        self.set_dirty();
        let old_size = self.last_logged_size;

        match dup_key {
            Some(dup_key) => {
                if db.is_deferred_write() && old_lsn.is_null() {
                    self.clear_dirty();
                    return Ok(Lsn::NULL);
                }
                self.log(
                    db,
                    ln_key,
                    Some(dup_key),
                    old_lsn,
                    old_size,
                    Some(locker),
                    false,
                    false,
                )
            }
            None => self.optional_log(db, ln_key, old_lsn, old_size, Some(locker)),
        }
    }

    /// Replaces the record's data and logs the new version.
    pub fn modify(
        &mut self,
        new_data: Vec<u8>,
        db: &Database,
        key: &[u8],
        old_lsn: Lsn,
        locker: &Locker,
    ) -> Result<Lsn> {
        self.data = Some(new_data);
        self.set_dirty();
        let old_size = self.last_logged_size;
        self.optional_log(db, key, old_lsn, old_size, Some(locker))
    }

    /// Logs the leaf unless the database defers writes.
    pub fn optional_log(
        &mut self,
        db: &Database,
        key: &[u8],
        old_lsn: Lsn,
        old_size: usize,
        locker: Option<&Locker>,
    ) -> Result<Lsn> {
        if db.is_deferred_write() {
            return Ok(Lsn::NULL);
        }
        self.log(db, key, None, old_lsn, old_size, locker, false, false)
    }

    /// Logs the leaf provisionally unless the database defers writes.
    pub fn optional_log_provisional(
        &mut self,
        db: &Database,
        key: &[u8],
        old_lsn: Lsn,
        old_size: usize,
    ) -> Result<Lsn> {
        if db.is_deferred_write() {
            return Ok(Lsn::NULL);
        }
        self.log(db, key, None, old_lsn, old_size, None, false, true)
    }

    /// Writes the leaf to the log.
    ///
    /// A transactional locker makes the entry transactional and records the
    /// abort LSN. The version named by the abort LSN is still needed for
    /// rollback, so it is not counted obsolete here.
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &mut self,
        db: &Database,
        key: &[u8],
        del_dup_key: Option<&[u8]>,
        old_lsn: Lsn,
        old_size: usize,
        locker: Option<&Locker>,
        background_io: bool,
        provisional: bool,
    ) -> Result<Lsn> {
        let mut entry_type = self.log_type(del_dup_key.is_some());
        let mut obsolete_lsn = old_lsn;
        let mut abort = None;

        if let Some(locker) = locker.filter(|l| l.is_transactional()) {
            entry_type = entry_type.transactional();
            let (abort_lsn, abort_known_deleted) = locker
                .write_lock_info(self.node_id)
                .map_or((Lsn::NULL, false), |info| {
                    (info.abort_lsn, info.abort_known_deleted)
                });
            if !old_lsn.is_null() && old_lsn == abort_lsn {
                locker.set_abort_log_size(self.node_id, old_size);
                obsolete_lsn = Lsn::NULL;
            }
            abort = Some(AbortInfo {
                txn_id: locker.txn_id(),
                abort_lsn,
                abort_known_deleted,
            });
        }

        let payload = codec::write_ln(db.id(), key, del_dup_key, abort.as_ref(), self);
        let size = HEADER_SIZE + payload.len();
        let lsn = db.env().log().log(
            entry_type,
            payload,
            provisional,
            background_io,
            obsolete_lsn,
            old_size,
        )?;
        self.last_logged_size = size;
        self.clear_dirty();
        Ok(lsn)
    }

    fn log_type(&self, deleted_duplicate: bool) -> LogEntryType {
        match self.kind {
            LnKind::Data if deleted_duplicate => LogEntryType::DelDupLn,
            LnKind::Data => LogEntryType::Ln,
            LnKind::DupCount { .. } => LogEntryType::DupCountLn,
            LnKind::Map { .. } => LogEntryType::MapLn,
            LnKind::Name { .. } => LogEntryType::NameLn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted_means_no_data() {
        let mut ln = Ln::with_id(NodeId(1), Some(b"v".to_vec()), LnKind::Data);
        assert!(!ln.is_deleted());
        assert!(ln.is_dirty());
        ln.make_deleted();
        assert!(ln.is_deleted());
        assert_eq!(ln.data(), None);
    }

    #[test]
    fn test_dup_count() {
        let mut ln = Ln::with_id(NodeId(2), Some(Vec::new()), LnKind::DupCount { count: 1 });
        assert!(ln.contains_duplicates());
        ln.clear_dirty();
        assert_eq!(ln.increment_dup_count().unwrap(), 2);
        assert!(ln.is_dirty());
        assert_eq!(ln.decrement_dup_count().unwrap(), 1);
        assert_eq!(ln.decrement_dup_count().unwrap(), 0);
        assert!(ln.decrement_dup_count().is_err());
    }

    #[test]
    fn test_dup_count_rejected_on_data_leaf() {
        let mut ln = Ln::with_id(NodeId(3), Some(b"x".to_vec()), LnKind::Data);
        assert!(ln.set_dup_count(4).is_err());
        assert_eq!(ln.dup_count(), 0);
    }

    #[test]
    fn test_memory_size() {
        let ln = Ln::with_id(NodeId(4), Some(vec![0u8; 20]), LnKind::Data);
        assert_eq!(ln.memory_size_included_by_parent(), LN_OVERHEAD + byte_array_size(20));
        let dcl = Ln::with_id(NodeId(5), Some(Vec::new()), LnKind::DupCount { count: 0 });
        assert_eq!(dcl.memory_size_included_by_parent(), DUPCOUNTLN_OVERHEAD);
    }

    #[test]
    fn test_log_types() {
        let ln = Ln::with_id(NodeId(6), None, LnKind::Data);
        assert_eq!(ln.log_type(false), LogEntryType::Ln);
        assert_eq!(ln.log_type(true), LogEntryType::DelDupLn);
        let map = Ln::with_id(
            NodeId(7),
            None,
            LnKind::Map {
                db_id: DatabaseId(3),
                root_lsn: Lsn::NULL,
            },
        );
        assert_eq!(map.log_type(false), LogEntryType::MapLn);
        assert!(!map.is_evictable());
        assert!(!map.is_valid_for_delete());
    }
}
