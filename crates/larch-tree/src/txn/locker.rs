//! Lockers: the owners of record locks.
//!
//! A basic locker holds locks for one operation. A transactional locker
//! also remembers, per write-locked leaf, the LSN and deleted state to
//! restore on abort, and hands the BINs it deleted from to the compressor
//! when it commits.

use super::lock::{LockGrant, LockType};
use crate::bin_ref::BinReference;
use crate::env::Environment;
use larch_common::{NodeId, Result, TxnId};
use larch_log::Lsn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Rollback information for a write-locked leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteLockInfo {
    /// LSN of the version that existed before this locker wrote.
    pub abort_lsn: Lsn,
    /// Whether that version was known deleted.
    pub abort_known_deleted: bool,
    /// Logged size of the abort version.
    pub abort_log_size: usize,
    /// The leaf was created by this locker.
    pub created_this_txn: bool,
    /// No abort LSN has been recorded yet.
    pub never_locked: bool,
}

impl Default for WriteLockInfo {
    fn default() -> Self {
        Self {
            abort_lsn: Lsn::NULL,
            abort_known_deleted: false,
            abort_log_size: 0,
            created_this_txn: false,
            never_locked: true,
        }
    }
}

#[derive(Default)]
struct LockerState {
    held: HashMap<NodeId, LockType>,
    write_info: HashMap<NodeId, WriteLockInfo>,
    deleted_bins: Vec<BinReference>,
}

/// Owner of record locks.
pub struct Locker {
    id: u64,
    txn_id: TxnId,
    transactional: bool,
    env: Arc<Environment>,
    state: Mutex<LockerState>,
}

impl Locker {
    /// Creates a non-transactional locker.
    pub fn basic(env: &Arc<Environment>) -> Arc<Self> {
        Arc::new(Self::build(env, TxnId::NONE, false))
    }

    /// Creates a transactional locker with a fresh transaction id.
    pub fn transactional(env: &Arc<Environment>) -> Arc<Self> {
        let txn_id = TxnId(env.next_txn_id());
        Arc::new(Self::build(env, txn_id, true))
    }

    fn build(env: &Arc<Environment>, txn_id: TxnId, transactional: bool) -> Self {
        Self {
            id: env.next_locker_id(),
            txn_id,
            transactional,
            env: env.clone(),
            state: Mutex::new(LockerState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Locks a leaf, waiting for conflicting owners.
    pub fn lock(&self, node_id: NodeId, lock_type: LockType) -> Result<LockResult<'_>> {
        self.lock_internal(node_id, lock_type, false)
    }

    /// Locks a leaf or returns a `Denied` result without waiting.
    pub fn non_blocking_lock(&self, node_id: NodeId, lock_type: LockType) -> Result<LockResult<'_>> {
        self.lock_internal(node_id, lock_type, true)
    }

    fn lock_internal(
        &self,
        node_id: NodeId,
        lock_type: LockType,
        non_blocking: bool,
    ) -> Result<LockResult<'_>> {
        let grant = self
            .env
            .lock_table()
            .lock(node_id, self.id, lock_type, non_blocking)?;
        if grant != LockGrant::Denied {
            let mut state = self.state.lock();
            let held = state.held.entry(node_id).or_insert(lock_type);
            if lock_type == LockType::Write {
                *held = LockType::Write;
                if self.transactional {
                    state.write_info.entry(node_id).or_default();
                }
            }
        }
        Ok(LockResult {
            grant,
            node_id,
            locker: self,
        })
    }

    /// Returns the rollback information for a write-locked leaf.
    pub fn write_lock_info(&self, node_id: NodeId) -> Option<WriteLockInfo> {
        self.state.lock().write_info.get(&node_id).copied()
    }

    pub fn set_abort_log_size(&self, node_id: NodeId, size: usize) {
        if let Some(info) = self.state.lock().write_info.get_mut(&node_id) {
            info.abort_log_size = size;
        }
    }

    /// Returns true if this locker created the leaf.
    pub fn created_node(&self, node_id: NodeId) -> bool {
        self.state
            .lock()
            .write_info
            .get(&node_id)
            .is_some_and(|info| info.created_this_txn)
    }

    /// Returns true if the locker holds any lock on `node_id`.
    pub fn holds_lock(&self, node_id: NodeId) -> bool {
        self.state.lock().held.contains_key(&node_id)
    }

    /// Releases one lock early.
    pub fn release_lock(&self, node_id: NodeId) -> bool {
        let held = self.state.lock().held.remove(&node_id).is_some();
        held && self.env.lock_table().release(node_id, self.id)
    }

    /// Remembers a BIN slot this locker deleted so it is compressed once the
    /// deletion is final.
    pub fn add_deleted_bin(&self, bin_ref: BinReference) {
        let mut state = self.state.lock();
        match state
            .deleted_bins
            .iter_mut()
            .find(|r| r.node_id() == bin_ref.node_id())
        {
            Some(existing) => existing.merge(bin_ref),
            None => state.deleted_bins.push(bin_ref),
        }
    }

    /// Ends an operation. Basic lockers release everything; transactional
    /// lockers keep their locks until commit.
    pub fn operation_end(&self) -> Result<()> {
        if !self.transactional {
            self.finish()?;
        }
        Ok(())
    }

    /// Makes this locker's deletions final and releases its locks.
    ///
    /// Abort versions are no longer needed, so they are counted obsolete.
    pub fn commit(&self) -> Result<()> {
        let obsolete: Vec<(Lsn, usize)> = self
            .state
            .lock()
            .write_info
            .values()
            .filter(|info| !info.abort_lsn.is_null())
            .map(|info| (info.abort_lsn, info.abort_log_size))
            .collect();
        for (lsn, size) in &obsolete {
            self.env.log().count_obsolete_node(*lsn, None, *size);
        }
        debug!(txn_id = self.txn_id.0, obsolete = obsolete.len(), "commit");
        self.finish()
    }

    fn finish(&self) -> Result<()> {
        let (held, deleted_bins) = {
            let mut state = self.state.lock();
            state.write_info.clear();
            (
                std::mem::take(&mut state.held),
                std::mem::take(&mut state.deleted_bins),
            )
        };
        for node_id in held.keys() {
            self.env.lock_table().release(*node_id, self.id);
        }
        let compressor = self.env.compressor();
        for bin_ref in deleted_bins {
            compressor.add_bin_ref_to_queue(bin_ref);
        }
        Ok(())
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        let held = std::mem::take(&mut self.state.get_mut().held);
        for node_id in held.keys() {
            self.env.lock_table().release(*node_id, self.id);
        }
    }
}

/// A granted (or denied) lock and access to its rollback information.
pub struct LockResult<'a> {
    grant: LockGrant,
    node_id: NodeId,
    locker: &'a Locker,
}

impl LockResult<'_> {
    pub fn grant(&self) -> LockGrant {
        self.grant
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_denied(&self) -> bool {
        self.grant == LockGrant::Denied
    }

    /// Records the version to restore on abort. Only the first write by a
    /// locker records it.
    pub fn set_abort_lsn(&self, abort_lsn: Lsn, abort_known_deleted: bool) {
        self.set_abort_lsn_internal(abort_lsn, abort_known_deleted, false);
    }

    /// Records the abort version of a leaf this locker just created.
    pub fn set_abort_lsn_created(&self, abort_lsn: Lsn, abort_known_deleted: bool) {
        self.set_abort_lsn_internal(abort_lsn, abort_known_deleted, true);
    }

    fn set_abort_lsn_internal(&self, abort_lsn: Lsn, abort_known_deleted: bool, created: bool) {
        let mut state = self.locker.state.lock();
        if let Some(info) = state.write_info.get_mut(&self.node_id) {
            if info.never_locked {
                if !abort_lsn.is_null() {
                    info.abort_lsn = abort_lsn;
                    info.abort_known_deleted = abort_known_deleted;
                }
                info.created_this_txn = created;
                info.never_locked = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larch_common::EnvironmentConfig;

    fn env() -> Arc<Environment> {
        Environment::open(EnvironmentConfig::default()).unwrap()
    }

    #[test]
    fn test_basic_locker_releases_on_operation_end() {
        let env = env();
        let locker = Locker::basic(&env);
        let result = locker.lock(NodeId(10), LockType::Write).unwrap();
        assert_eq!(result.grant(), LockGrant::New);
        assert!(locker.write_lock_info(NodeId(10)).is_none());
        locker.operation_end().unwrap();
        assert_eq!(env.lock_table().n_owners(NodeId(10)), 0);
    }

    #[test]
    fn test_abort_lsn_recorded_once() {
        let env = env();
        let txn = Locker::transactional(&env);
        let result = txn.lock(NodeId(11), LockType::Write).unwrap();
        result.set_abort_lsn(Lsn::new(1, 64), true);
        result.set_abort_lsn(Lsn::new(2, 64), false);
        let info = txn.write_lock_info(NodeId(11)).unwrap();
        assert_eq!(info.abort_lsn, Lsn::new(1, 64));
        assert!(info.abort_known_deleted);
        assert!(!info.never_locked);
        assert!(!txn.created_node(NodeId(11)));
    }

    #[test]
    fn test_created_node() {
        let env = env();
        let txn = Locker::transactional(&env);
        let result = txn.lock(NodeId(12), LockType::Write).unwrap();
        result.set_abort_lsn_created(Lsn::NULL, true);
        assert!(txn.created_node(NodeId(12)));
        assert!(txn.write_lock_info(NodeId(12)).unwrap().abort_lsn.is_null());
    }

    #[test]
    fn test_transactional_locks_held_until_commit() {
        let env = env();
        let txn = Locker::transactional(&env);
        txn.lock(NodeId(13), LockType::Write).unwrap();
        txn.operation_end().unwrap();
        assert!(txn.holds_lock(NodeId(13)));

        let other = Locker::basic(&env);
        let denied = other.non_blocking_lock(NodeId(13), LockType::Read).unwrap();
        assert!(denied.is_denied());
        assert!(!other.holds_lock(NodeId(13)));

        txn.commit().unwrap();
        assert!(!txn.holds_lock(NodeId(13)));
        assert_eq!(env.lock_table().n_locks(), 0);
    }

    #[test]
    fn test_drop_releases_locks() {
        let env = env();
        {
            let locker = Locker::basic(&env);
            locker.lock(NodeId(14), LockType::Read).unwrap();
        }
        assert_eq!(env.lock_table().n_owners(NodeId(14)), 0);
    }
}
