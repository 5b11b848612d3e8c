//! Point reads.
//!
//! Reads take no record locks and see the latest version of a record,
//! committed or not. Deleted records are skipped.

use super::{SearchType, Tree};
use crate::latch::ExclusiveLatch;
use crate::ln::Ln;
use crate::node::Target;
use larch_common::Result;

fn live_data(ln: &Ln) -> Option<Vec<u8>> {
    if ln.is_deleted() {
        None
    } else {
        ln.data().map(<[u8]>::to_vec)
    }
}

/// Visits the live leaves of a duplicate tree in order until `visit`
/// returns false. Returns false if the walk was stopped.
fn walk_dup_tree(mut node: ExclusiveLatch, visit: &mut dyn FnMut(Vec<u8>) -> bool) -> Result<bool> {
    for index in 0..node.n_entries() {
        if node.is_entry_known_deleted(index) {
            continue;
        }
        if node.is_bin() {
            let data = node.fetch_ln(index)?.and_then(|ln| live_data(ln));
            if let Some(data) = data {
                if !visit(data) {
                    return Ok(false);
                }
            }
        } else if let Some(child) = node.fetch_child_node(index)? {
            if !walk_dup_tree(child.latch(), visit)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

impl Tree {
    /// Returns the data stored under `key`; for a duplicate tree, its first
    /// live duplicate.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut first = None;
        self.visit_record(key, &mut |data| {
            first = Some(data);
            false
        })?;
        Ok(first)
    }

    /// Returns every live data item stored under `key`, in duplicate order.
    pub fn get_duplicates(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut all = Vec::new();
        self.visit_record(key, &mut |data| {
            all.push(data);
            true
        })?;
        Ok(all)
    }

    fn visit_record(&self, key: &[u8], visit: &mut dyn FnMut(Vec<u8>) -> bool) -> Result<()> {
        let Some(found) = self.search(key, SearchType::Normal, None, None, true)? else {
            return Ok(());
        };
        let mut bin = found.into_exclusive()?;
        let index = bin.find_entry(key, false, true);
        if index < 0 {
            return Ok(());
        }
        let dup_root = match bin.fetch_target(index as usize)? {
            None => return Ok(()),
            Some(Target::Leaf(ln)) => {
                if let Some(data) = live_data(ln) {
                    visit(data);
                }
                return Ok(());
            }
            Some(Target::Node(dup_root)) => dup_root.clone(),
        };
        let dup_root = dup_root.latch();
        drop(bin);
        walk_dup_tree(dup_root, visit)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::tree;
    use super::*;
    use crate::cursor::TreeCursor;
    use crate::env::DatabaseConfig;
    use crate::txn::Locker;

    fn put(tree: &Tree, key: &[u8], data: &[u8], dups: bool) {
        let env = tree.database().env();
        let cursor = TreeCursor::new(Locker::basic(env));
        assert!(tree.insert(Ln::new(env, data.to_vec()), key, dups, &cursor).unwrap());
        cursor.locker().operation_end().unwrap();
    }

    #[test]
    fn test_get_plain_records() {
        let tree = tree(4, DatabaseConfig::new());
        assert_eq!(tree.get(b"a").unwrap(), None);
        for k in 0..12u8 {
            put(&tree, &[k], &[k, k], false);
        }
        assert_eq!(tree.get(&[5]).unwrap(), Some(vec![5, 5]));
        assert_eq!(tree.get(&[50]).unwrap(), None);
        assert_eq!(tree.get_duplicates(&[11]).unwrap(), vec![vec![11, 11]]);
    }

    #[test]
    fn test_get_from_duplicate_tree() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        for data in [b"m", b"c", b"x", b"a", b"q", b"f"] {
            put(&tree, b"k", data, true);
        }
        assert_eq!(tree.get(b"k").unwrap(), Some(b"a".to_vec()));
        let all: Vec<Vec<u8>> = [b"a", b"c", b"f", b"m", b"q", b"x"].iter().map(|d| d.to_vec()).collect();
        assert_eq!(tree.get_duplicates(b"k").unwrap(), all);
    }

    #[test]
    fn test_deleted_records_are_skipped() {
        let tree = tree(4, DatabaseConfig::new().sorted_duplicates(true));
        put(&tree, b"k", b"a", true);
        put(&tree, b"k", b"b", true);
        put(&tree, b"j", b"j", true);
        let env = tree.database().env();
        let cursor = TreeCursor::new(Locker::basic(env));
        assert_eq!(tree.delete_record(b"k", Some(b"a"), &cursor).unwrap(), 1);
        assert_eq!(tree.delete_record(b"j", None, &cursor).unwrap(), 1);
        cursor.locker().operation_end().unwrap();

        assert_eq!(tree.get(b"k").unwrap(), Some(b"b".to_vec()));
        assert_eq!(tree.get(b"j").unwrap(), None);
        assert!(tree.get_duplicates(b"j").unwrap().is_empty());
    }
}
