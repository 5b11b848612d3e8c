//! Record lock table.
//!
//! Leaf node ids are the lockable resources. Read locks are shared, write
//! locks are exclusive. A locker that asks for a lock it already holds gets
//! `Existing`; a sole reader asking for write is promoted.

use larch_common::{LarchError, NodeId, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Requested lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    Write,
}

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    /// The lock was newly granted.
    New,
    /// The locker already held the lock in a sufficient mode.
    Existing,
    /// A read lock held by the locker was upgraded to write.
    Promotion,
    /// A non-blocking request conflicted with another owner.
    Denied,
}

#[derive(Debug, Default)]
struct LockEntry {
    owners: Vec<(u64, LockType)>,
}

impl LockEntry {
    fn held_by(&self, locker_id: u64) -> Option<LockType> {
        self.owners
            .iter()
            .find(|(id, _)| *id == locker_id)
            .map(|(_, t)| *t)
    }

    fn conflicts(&self, locker_id: u64, lock_type: LockType) -> bool {
        self.owners.iter().any(|(id, held)| {
            *id != locker_id && (lock_type == LockType::Write || *held == LockType::Write)
        })
    }
}

/// The lock table of one environment.
pub struct LockTable {
    locks: Mutex<HashMap<NodeId, LockEntry>>,
    released: Condvar,
    timeout: Duration,
}

impl LockTable {
    /// Creates a table. A zero timeout waits forever.
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Requests a lock on `node_id` for `locker_id`.
    ///
    /// Non-blocking requests return `Denied` on conflict. Blocking requests
    /// wait up to the table's timeout and then fail with `LockTimeout`.
    pub fn lock(
        &self,
        node_id: NodeId,
        locker_id: u64,
        lock_type: LockType,
        non_blocking: bool,
    ) -> Result<LockGrant> {
        let deadline = (!self.timeout.is_zero()).then(|| Instant::now() + self.timeout);
        let mut locks = self.locks.lock();
        loop {
            let entry = locks.entry(node_id).or_default();
            let held = entry.held_by(locker_id);
            if held == Some(LockType::Write) || held == Some(lock_type) {
                return Ok(LockGrant::Existing);
            }
            if !entry.conflicts(locker_id, lock_type) {
                let grant = match held {
                    Some(_) => {
                        for owner in entry.owners.iter_mut() {
                            if owner.0 == locker_id {
                                owner.1 = lock_type;
                            }
                        }
                        LockGrant::Promotion
                    }
                    None => {
                        entry.owners.push((locker_id, lock_type));
                        LockGrant::New
                    }
                };
                trace!(node_id = %node_id, locker_id, ?lock_type, ?grant, "lock granted");
                return Ok(grant);
            }
            if entry.owners.is_empty() {
                locks.remove(&node_id);
            }
            if non_blocking {
                return Ok(LockGrant::Denied);
            }
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut locks, deadline).timed_out() {
                        return Err(LarchError::LockTimeout { node_id: node_id.0 });
                    }
                }
                None => self.released.wait(&mut locks),
            }
        }
    }

    /// Releases the lock `locker_id` holds on `node_id`.
    pub fn release(&self, node_id: NodeId, locker_id: u64) -> bool {
        let mut locks = self.locks.lock();
        let Some(entry) = locks.get_mut(&node_id) else {
            return false;
        };
        let before = entry.owners.len();
        entry.owners.retain(|(id, _)| *id != locker_id);
        let released = entry.owners.len() != before;
        if entry.owners.is_empty() {
            locks.remove(&node_id);
        }
        drop(locks);
        if released {
            self.released.notify_all();
        }
        released
    }

    /// Number of owners of the lock on `node_id`.
    pub fn n_owners(&self, node_id: NodeId) -> usize {
        self.locks
            .lock()
            .get(&node_id)
            .map_or(0, |entry| entry.owners.len())
    }

    /// Number of locked resources.
    pub fn n_locks(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn table() -> LockTable {
        LockTable::new(Duration::from_millis(50))
    }

    #[test]
    fn test_read_locks_share() {
        let t = table();
        assert_eq!(t.lock(NodeId(1), 1, LockType::Read, true).unwrap(), LockGrant::New);
        assert_eq!(t.lock(NodeId(1), 2, LockType::Read, true).unwrap(), LockGrant::New);
        assert_eq!(t.n_owners(NodeId(1)), 2);
        assert_eq!(t.lock(NodeId(1), 3, LockType::Write, true).unwrap(), LockGrant::Denied);
    }

    #[test]
    fn test_existing_and_promotion() {
        let t = table();
        assert_eq!(t.lock(NodeId(1), 1, LockType::Read, false).unwrap(), LockGrant::New);
        assert_eq!(t.lock(NodeId(1), 1, LockType::Read, false).unwrap(), LockGrant::Existing);
        assert_eq!(
            t.lock(NodeId(1), 1, LockType::Write, false).unwrap(),
            LockGrant::Promotion
        );
        assert_eq!(t.lock(NodeId(1), 1, LockType::Read, false).unwrap(), LockGrant::Existing);
    }

    #[test]
    fn test_write_conflict_times_out() {
        let t = table();
        t.lock(NodeId(7), 1, LockType::Write, false).unwrap();
        let err = t.lock(NodeId(7), 2, LockType::Read, false).unwrap_err();
        assert!(matches!(err, LarchError::LockTimeout { node_id: 7 }));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let t = Arc::new(LockTable::new(Duration::from_secs(5)));
        t.lock(NodeId(3), 1, LockType::Write, false).unwrap();
        let waiter = {
            let t = t.clone();
            thread::spawn(move || t.lock(NodeId(3), 2, LockType::Write, false))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(t.release(NodeId(3), 1));
        assert_eq!(waiter.join().unwrap().unwrap(), LockGrant::New);
        assert_eq!(t.n_owners(NodeId(3)), 1);
    }

    #[test]
    fn test_release_unknown() {
        let t = table();
        assert!(!t.release(NodeId(9), 1));
        assert_eq!(t.n_locks(), 0);
    }
}
