//! Registry of every resident internal node in an environment.
//!
//! The evictor and subtree removal walk this list. It is guarded by a
//! major latch; nodes added while the major latch is busy (including by the
//! thread holding it) are parked under a minor latch and merged in when the
//! major latch is released.

use crate::budget::MemoryBudget;
use larch_common::NodeId;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// The resident node list.
pub struct InList<N> {
    major: Mutex<BTreeMap<NodeId, N>>,
    minor: Mutex<BTreeMap<NodeId, N>>,
    budget: Arc<MemoryBudget>,
}

impl<N: Clone> InList<N> {
    /// Creates an empty list charging node memory to `budget`.
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            major: Mutex::new(BTreeMap::new()),
            minor: Mutex::new(BTreeMap::new()),
            budget,
        }
    }

    /// Adds a node and charges its memory size to the budget.
    ///
    /// Never blocks on the major latch, so it is safe to call while holding
    /// it or while a scan holds it.
    pub fn add(&self, id: NodeId, node: N, memory_size: i64) {
        self.budget.update_tree_memory_usage(memory_size);
        match self.major.try_lock() {
            Some(mut major) => {
                major.insert(id, node);
                self.dump_added(&mut major);
            }
            None => {
                self.minor.lock().insert(id, node);
                if let Some(mut major) = self.major.try_lock() {
                    self.dump_added(&mut major);
                }
            }
        }
    }

    /// Removes a node and credits `memory_size` back to the budget.
    pub fn remove(&self, id: NodeId, memory_size: i64) -> Option<N> {
        let mut latched = self.latch_major();
        latched.remove(id, memory_size)
    }

    /// Returns true if the node is registered.
    pub fn contains(&self, id: NodeId) -> bool {
        if self.minor.lock().contains_key(&id) {
            return true;
        }
        self.major.lock().contains_key(&id)
    }

    /// Returns the number of registered nodes.
    pub fn len(&self) -> usize {
        let latched = self.latch_major();
        latched.len()
    }

    /// Returns true if no node is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the registered nodes in node id order.
    pub fn snapshot(&self) -> Vec<(NodeId, N)> {
        let latched = self.latch_major();
        latched.iter().map(|(id, n)| (*id, n.clone())).collect()
    }

    /// Removes every node and resets the tree memory charged by them.
    pub fn clear(&self) {
        let mut major = self.major.lock();
        self.minor.lock().clear();
        let removed = major.len();
        major.clear();
        drop(major);
        debug!(removed, "cleared resident node list");
        let usage = self.budget.tree_memory_usage();
        self.budget.update_tree_memory_usage(-usage);
    }

    /// Acquires the major latch for a bulk operation.
    pub fn latch_major(&self) -> MajorLatch<'_, N> {
        let mut major = self.major.lock();
        self.dump_added(&mut major);
        MajorLatch {
            list: self,
            major,
        }
    }

    fn dump_added(&self, major: &mut BTreeMap<NodeId, N>) {
        let mut minor = self.minor.lock();
        if !minor.is_empty() {
            major.append(&mut minor);
        }
    }
}

/// Holds the major latch. Nodes parked by concurrent adds are merged in on
/// release.
pub struct MajorLatch<'a, N: Clone> {
    list: &'a InList<N>,
    major: MutexGuard<'a, BTreeMap<NodeId, N>>,
}

impl<N: Clone> MajorLatch<'_, N> {
    /// Iterates the nodes present when the latch was taken.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &N)> {
        self.major.iter()
    }

    /// Returns the number of registered nodes.
    pub fn len(&self) -> usize {
        self.major.len() + self.list.minor.lock().len()
    }

    /// Returns true if no node is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a node.
    pub fn get(&self, id: NodeId) -> Option<&N> {
        self.major.get(&id)
    }

    /// Removes a node while the latch is held.
    pub fn remove(&mut self, id: NodeId, memory_size: i64) -> Option<N> {
        let removed = match self.major.remove(&id) {
            Some(n) => Some(n),
            None => {
                let mut minor = self.list.minor.lock();
                let n = minor.remove(&id);
                if !minor.is_empty() {
                    self.major.append(&mut minor);
                }
                n
            }
        };
        if removed.is_some() {
            self.list.budget.update_tree_memory_usage(-memory_size);
        }
        removed
    }
}

impl<N: Clone> Drop for MajorLatch<'_, N> {
    fn drop(&mut self) {
        self.list.dump_added(&mut self.major);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> (Arc<MemoryBudget>, InList<u32>) {
        let budget = Arc::new(MemoryBudget::new(1 << 20));
        let list = InList::new(Arc::clone(&budget));
        (budget, list)
    }

    #[test]
    fn test_add_remove() {
        let (budget, list) = list();
        list.add(NodeId(1), 10, 100);
        list.add(NodeId(2), 20, 50);
        assert_eq!(list.len(), 2);
        assert!(list.contains(NodeId(1)));
        assert_eq!(budget.tree_memory_usage(), 150);

        assert_eq!(list.remove(NodeId(1), 100), Some(10));
        assert!(!list.contains(NodeId(1)));
        assert_eq!(budget.tree_memory_usage(), 50);
        assert_eq!(list.remove(NodeId(1), 100), None);
        assert_eq!(budget.tree_memory_usage(), 50);
    }

    #[test]
    fn test_add_while_major_latched() {
        let (_budget, list) = list();
        list.add(NodeId(1), 1, 0);
        {
            let latched = list.latch_major();
            list.add(NodeId(2), 2, 0);
            assert!(latched.get(NodeId(2)).is_none());
            assert_eq!(latched.len(), 2);
        }
        let snapshot = list.snapshot();
        assert_eq!(snapshot, vec![(NodeId(1), 1), (NodeId(2), 2)]);
    }

    #[test]
    fn test_remove_parked_node() {
        let (_budget, list) = list();
        let mut latched = list.latch_major();
        list.add(NodeId(9), 9, 0);
        assert_eq!(latched.remove(NodeId(9), 0), Some(9));
        drop(latched);
        assert!(list.is_empty());
    }

    #[test]
    fn test_clear_resets_budget() {
        let (budget, list) = list();
        list.add(NodeId(1), 1, 300);
        list.add(NodeId(2), 2, 300);
        list.clear();
        assert!(list.is_empty());
        assert_eq!(budget.tree_memory_usage(), 0);
    }
}
