//! Parallel slot arrays of an internal node.

use crate::child_ref::ChildReference;
use crate::lsn_array::LsnArray;
use crate::node::Target;
use larch_log::Lsn;

/// Keys, targets, LSNs and state bytes of a node's slots.
///
/// The arrays always hold exactly `len()` entries; `capacity` is the
/// node's maximum fan-out and only matters for memory accounting and
/// the full check.
#[derive(Debug)]
pub struct SlotArray {
    keys: Vec<Vec<u8>>,
    targets: Vec<Option<Target>>,
    lsns: LsnArray,
    states: Vec<u8>,
    capacity: usize,
}

impl SlotArray {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            targets: Vec::with_capacity(capacity),
            lsns: LsnArray::new(),
            states: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuilds slots read from the log. Targets start out non-resident.
    pub fn from_parts(capacity: usize, keys: Vec<Vec<u8>>, lsns: LsnArray, states: Vec<u8>) -> Self {
        let targets = keys.iter().map(|_| None).collect();
        Self {
            keys,
            targets,
            lsns,
            states,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.keys.len() >= self.capacity
    }

    pub fn key(&self, idx: usize) -> &[u8] {
        &self.keys[idx]
    }

    pub fn set_key(&mut self, idx: usize, key: Vec<u8>) {
        self.keys[idx] = key;
    }

    pub fn target(&self, idx: usize) -> Option<&Target> {
        self.targets[idx].as_ref()
    }

    pub fn target_mut(&mut self, idx: usize) -> Option<&mut Target> {
        self.targets[idx].as_mut()
    }

    /// Replaces the target and returns the previous one.
    pub fn set_target(&mut self, idx: usize, target: Option<Target>) -> Option<Target> {
        std::mem::replace(&mut self.targets[idx], target)
    }

    pub fn lsn(&self, idx: usize) -> Lsn {
        self.lsns.get(idx)
    }

    pub fn set_lsn(&mut self, idx: usize, lsn: Lsn) {
        self.lsns.set(idx, lsn);
    }

    pub fn lsn_array(&self) -> &LsnArray {
        &self.lsns
    }

    pub fn state(&self, idx: usize) -> u8 {
        self.states[idx]
    }

    pub fn set_state(&mut self, idx: usize, state: u8) {
        self.states[idx] = state;
    }

    /// Opens slot `idx` and fills it, shifting later slots right.
    pub fn insert(&mut self, idx: usize, entry: ChildReference) {
        let (target, key, lsn, state) = entry.into_parts();
        self.keys.insert(idx, key);
        self.targets.insert(idx, target);
        self.lsns.insert(idx, lsn);
        self.states.insert(idx, state);
    }

    /// Appends a slot.
    pub fn push(&mut self, entry: ChildReference) {
        let idx = self.len();
        self.insert(idx, entry);
    }

    /// Removes slot `idx`, shifting later slots left.
    pub fn remove(&mut self, idx: usize) -> ChildReference {
        let key = self.keys.remove(idx);
        let target = self.targets.remove(idx);
        let lsn = self.lsns.remove(idx);
        let state = self.states.remove(idx);
        ChildReference::with_state(target, key, lsn, state)
    }

    /// Removes slots `low..high` and returns them in order.
    pub fn remove_range(&mut self, low: usize, high: usize) -> Vec<ChildReference> {
        (low..high).map(|_| self.remove(low)).collect()
    }

    /// Iterates over the slot keys.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.keys.iter().map(|k| k.as_slice())
    }
}
