//! Queued references to bottom nodes awaiting compression.

use larch_common::{DatabaseId, NodeId};
use std::collections::BTreeSet;

/// Names a BIN (or DBIN) and the keys of its slots that were deleted.
///
/// A reference outlives any latch, so the node is found again by searching
/// for `id_key` (and `dup_key` for a DBIN) and checking `node_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinReference {
    node_id: NodeId,
    db_id: DatabaseId,
    id_key: Vec<u8>,
    dup_key: Option<Vec<u8>>,
    deleted_keys: BTreeSet<Vec<u8>>,
}

impl BinReference {
    /// Reference to a main tree BIN.
    pub fn new(node_id: NodeId, db_id: DatabaseId, id_key: Vec<u8>) -> Self {
        Self {
            node_id,
            db_id,
            id_key,
            dup_key: None,
            deleted_keys: BTreeSet::new(),
        }
    }

    /// Reference to a DBIN under the main tree key `dup_key`.
    pub fn new_dup(node_id: NodeId, db_id: DatabaseId, id_key: Vec<u8>, dup_key: Vec<u8>) -> Self {
        Self {
            dup_key: Some(dup_key),
            ..Self::new(node_id, db_id, id_key)
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn db_id(&self) -> DatabaseId {
        self.db_id
    }

    pub fn id_key(&self) -> &[u8] {
        &self.id_key
    }

    /// Main tree key of a DBIN reference.
    pub fn dup_key(&self) -> Option<&[u8]> {
        self.dup_key.as_deref()
    }

    pub fn add_deleted_key(&mut self, key: Vec<u8>) {
        self.deleted_keys.insert(key);
    }

    pub fn has_deleted_key(&self, key: &[u8]) -> bool {
        self.deleted_keys.contains(key)
    }

    pub fn remove_deleted_key(&mut self, key: &[u8]) -> bool {
        self.deleted_keys.remove(key)
    }

    pub fn deleted_keys_exist(&self) -> bool {
        !self.deleted_keys.is_empty()
    }

    pub fn deleted_keys(&self) -> impl Iterator<Item = &[u8]> {
        self.deleted_keys.iter().map(|k| k.as_slice())
    }

    /// Takes the remaining deleted keys.
    pub fn take_deleted_keys(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.deleted_keys).into_iter().collect()
    }

    /// Folds another reference to the same node into this one.
    pub fn merge(&mut self, other: BinReference) {
        self.deleted_keys.extend(other.deleted_keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted_keys() {
        let mut r = BinReference::new(NodeId(4), DatabaseId(2), b"m".to_vec());
        assert!(!r.deleted_keys_exist());
        r.add_deleted_key(b"q".to_vec());
        r.add_deleted_key(b"b".to_vec());
        r.add_deleted_key(b"q".to_vec());
        assert!(r.has_deleted_key(b"q"));
        let keys: Vec<&[u8]> = r.deleted_keys().collect();
        assert_eq!(keys, vec![&b"b"[..], &b"q"[..]]);
        assert!(r.remove_deleted_key(b"b"));
        assert!(!r.remove_deleted_key(b"b"));
        assert_eq!(r.take_deleted_keys(), vec![b"q".to_vec()]);
        assert!(!r.deleted_keys_exist());
    }

    #[test]
    fn test_merge_and_dup() {
        let mut a = BinReference::new_dup(NodeId(5), DatabaseId(2), b"d1".to_vec(), b"k".to_vec());
        let mut b = a.clone();
        a.add_deleted_key(b"d1".to_vec());
        b.add_deleted_key(b"d2".to_vec());
        a.merge(b);
        assert_eq!(a.deleted_keys().count(), 2);
        assert_eq!(a.dup_key(), Some(&b"k"[..]));
        assert_eq!(a.id_key(), b"d1");
    }
}
