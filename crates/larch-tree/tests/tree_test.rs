//! Tree integration tests
//!
//! End-to-end coverage of the tree through its public surface:
//! - Slot ordering under random insert sets
//! - Split completeness and resident list accounting
//! - Compact and expanded LSN arrays through the node codec
//! - Cursor positions across splits
//! - Compressor passes, root purging and duplicate tree lifecycles
//! - Eviction against an on-disk log
//! - Stats serialization

mod common;

use common::{all_keys, compress_all, open, put, remove, small_config};
use larch_common::EnvironmentConfig;
use larch_log::Lsn;
use larch_tree::{codec, ChildReference, DatabaseConfig, Evictor, In, Ln, Locker, NodeKind, TreeCursor};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::BTreeSet;
use tempfile::tempdir;

// =============================================================================
// Slot Ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_bins_hold_sorted_unique_keys(
        keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..5), 1..160)
    ) {
        let (_env, tree) = open(small_config(4), DatabaseConfig::new());
        let mut expected = BTreeSet::new();
        for key in &keys {
            let fresh = expected.insert(key.clone());
            prop_assert_eq!(put(&tree, key, key, false), fresh);
        }

        let walked = all_keys(&tree);
        prop_assert_eq!(walked, expected.into_iter().collect::<Vec<_>>());
        prop_assert!(tree.verify().is_ok());
    }
}

// =============================================================================
// Splits
// =============================================================================

#[test]
fn test_shuffled_inserts_are_all_found() {
    let (env, tree) = open(small_config(4), DatabaseConfig::new());
    let mut keys: Vec<u16> = (0..500).collect();
    keys.shuffle(&mut thread_rng());

    for k in &keys {
        assert!(put(&tree, &k.to_be_bytes(), &k.to_le_bytes(), false));
    }
    for k in 0..500u16 {
        assert_eq!(tree.get(&k.to_be_bytes()).unwrap(), Some(k.to_le_bytes().to_vec()));
    }

    let stats = tree.stats();
    assert_eq!(stats.inserts, 500);
    assert!(stats.splits > 0);
    assert!(stats.root_splits > 0);
    assert!(tree.validate_in_list().unwrap());
    assert!(env.in_list().len() > 500 / 4);
    tree.verify().unwrap();
}

#[test]
fn test_cursor_follows_its_record_across_splits() {
    let (env, tree) = open(small_config(4), DatabaseConfig::new());
    for k in [10u8, 20, 30] {
        put(&tree, &[k], &[k], false);
    }

    let bystander = TreeCursor::new(Locker::basic(&env));
    assert!(tree.insert(Ln::new(&env, vec![25]), &[25], false, &bystander).unwrap());
    bystander.locker().operation_end().unwrap();

    for k in (0..60u8).filter(|k| k % 10 != 0 && *k != 25) {
        put(&tree, &[k], &[k], false);
    }
    assert!(tree.stats().splits > 0);

    let bin = bystander.latch_bin().unwrap();
    assert_eq!(bin.key(bystander.index()), &[25]);
    drop(bin);
    bystander.close();
    tree.verify().unwrap();
}

// =============================================================================
// Concurrency
// =============================================================================

const WRITERS: u16 = 6;
const KEYS_PER_WRITER: u16 = 250;

fn key_of(k: u16) -> [u8; 2] {
    k.to_be_bytes()
}

#[test]
fn test_concurrent_writers_and_reader() {
    let (env, tree) = open(small_config(4), DatabaseConfig::new());
    let total = WRITERS * KEYS_PER_WRITER;

    std::thread::scope(|s| {
        for w in 0..WRITERS {
            let tree = &tree;
            s.spawn(move || {
                // Interleaved keys put every writer into the same BINs.
                for i in 0..KEYS_PER_WRITER {
                    let k = i * WRITERS + w;
                    assert!(put(tree, &key_of(k), &k.to_le_bytes(), false));
                }
            });
        }
        let tree = &tree;
        s.spawn(move || {
            for _ in 0..20 {
                for k in (0..total).step_by(7) {
                    if let Some(data) = tree.get(&key_of(k)).unwrap() {
                        assert_eq!(data, k.to_le_bytes());
                    }
                }
            }
        });
    });

    for k in 0..total {
        assert_eq!(tree.get(&key_of(k)).unwrap(), Some(k.to_le_bytes().to_vec()));
    }
    let stats = tree.stats();
    assert_eq!(stats.inserts, total as u64);
    assert!(stats.root_splits > 0);
    assert_eq!(all_keys(&tree).len(), total as usize);
    assert!(tree.validate_in_list().unwrap());
    tree.verify().unwrap();

    // Deleters on disjoint key sets, with a reader on the survivors.
    std::thread::scope(|s| {
        for w in 0..WRITERS {
            let tree = &tree;
            s.spawn(move || {
                for i in (0..KEYS_PER_WRITER).filter(|i| i % 2 == 0) {
                    assert_eq!(remove(tree, &key_of(i * WRITERS + w), None), 1);
                }
            });
        }
        let tree = &tree;
        s.spawn(move || {
            for _ in 0..10 {
                for i in (1..KEYS_PER_WRITER).step_by(2) {
                    let k = i * WRITERS;
                    assert_eq!(tree.get(&key_of(k)).unwrap(), Some(k.to_le_bytes().to_vec()));
                }
            }
        });
    });

    compress_all(&env);
    let survivors: Vec<Vec<u8>> = (0..total)
        .filter(|k| (k / WRITERS) % 2 == 1)
        .map(|k| key_of(k).to_vec())
        .collect();
    assert_eq!(all_keys(&tree), survivors);
    assert!(tree.validate_in_list().unwrap());
    tree.verify().unwrap();
}

// =============================================================================
// LSN Arrays Through The Codec
// =============================================================================

#[test]
fn test_node_lsns_survive_the_codec() {
    let (_env, tree) = open(small_config(8), DatabaseConfig::new());
    let db = tree.database();
    let base = 40u32;

    for (deltas, compact) in [(&[0u32, 1, 127][..], true), (&[0, 1, 127, 128][..], false)] {
        let mut bin = In::new_bin(db, vec![0], 8, 1);
        for (i, delta) in deltas.iter().enumerate() {
            let lsn = Lsn::new(base + delta, 1000 * i as u32);
            assert!(bin.insert_entry(ChildReference::new(None, vec![i as u8], lsn)).unwrap());
        }
        assert_eq!(bin.lsn_array().is_compact(), compact);

        let bytes = codec::write_in(&bin);
        let read = codec::read_in(db, NodeKind::Bin, &bytes, Lsn::new(base + 200, 0)).unwrap();
        assert_eq!(read.n_entries(), deltas.len());
        for i in 0..deltas.len() {
            assert_eq!(read.lsn(i), bin.lsn(i));
            assert_eq!(read.key(i), bin.key(i));
        }
    }
}

// =============================================================================
// Compressor
// =============================================================================

#[test]
fn test_compression_removes_deleted_range() {
    let (env, tree) = open(small_config(4), DatabaseConfig::new());
    for k in 0..40u8 {
        put(&tree, &[k], &[k], false);
    }
    for k in 0..24u8 {
        assert_eq!(remove(&tree, &[k], None), 1);
    }
    assert!(env.compressor().queue_size() > 0);

    compress_all(&env);
    let remaining: Vec<Vec<u8>> = (24..40u8).map(|k| vec![k]).collect();
    assert_eq!(all_keys(&tree), remaining);
    assert!(env.compressor().stats().processed > 0);
    assert!(tree.stats().subtrees_deleted > 0);
    assert!(tree.validate_in_list().unwrap());
    tree.verify().unwrap();
}

#[test]
fn test_second_compression_pass_changes_nothing() {
    let (env, tree) = open(small_config(4), DatabaseConfig::new());
    for k in 0..30u8 {
        put(&tree, &[k], &[k], false);
    }
    for k in (0..30u8).step_by(2) {
        remove(&tree, &[k], None);
    }
    compress_all(&env);
    let keys = all_keys(&tree);
    let resident = env.in_list().len();

    assert_eq!(env.compressor().do_compress(&env).unwrap(), 0);
    assert_eq!(all_keys(&tree), keys);
    assert_eq!(env.in_list().len(), resident);
}

#[test]
fn test_duplicate_tree_lifecycle() {
    for purge_root in [false, true] {
        let config = EnvironmentConfig {
            compressor_purge_root: purge_root,
            ..small_config(4)
        };
        let (env, tree) = open(config, DatabaseConfig::new().sorted_duplicates(true));
        for data in [b"c", b"a", b"b"] {
            assert!(put(&tree, b"k", data, true));
        }
        assert_eq!(tree.stats().duplicate_trees_created, 1);

        assert_eq!(remove(&tree, b"k", None), 3);
        assert!(tree.get_duplicates(b"k").unwrap().is_empty());
        compress_all(&env);
        assert_eq!(tree.root_exists(), !purge_root, "purge_root = {}", purge_root);
        if purge_root {
            assert_eq!(tree.stats().roots_deleted, 1);
        } else {
            assert!(all_keys(&tree).is_empty());
        }

        assert!(put(&tree, b"k", b"z", true));
        assert_eq!(tree.get_duplicates(b"k").unwrap(), vec![b"z".to_vec()]);
        tree.verify().unwrap();
    }
}

// =============================================================================
// Eviction
// =============================================================================

#[test]
fn test_evicted_nodes_come_back_from_disk() {
    let dir = tempdir().unwrap();
    let config = EnvironmentConfig {
        log_dir: Some(dir.path().to_path_buf()),
        max_memory: 4096,
        evictor_nodes_per_scan: 50,
        ..small_config(4)
    };
    let (env, tree) = open(config, DatabaseConfig::new());
    for k in 0..200u8 {
        put(&tree, &[k], &[k; 8], false);
    }
    assert!(env.budget().is_over_budget());
    let resident = env.in_list().len();

    let evictor = Evictor::new();
    assert!(evictor.do_evict(&env).unwrap() > 0);
    let stats = evictor.stats();
    assert!(stats.nodes_evicted > 0);
    assert!(stats.batches > 0);
    assert!(env.in_list().len() < resident);
    assert!(tree.is_root_resident());

    for k in 0..200u8 {
        assert_eq!(tree.get(&[k]).unwrap(), Some(vec![k; 8]));
    }
    assert!(tree.validate_in_list().unwrap());
    tree.verify().unwrap();
}

// =============================================================================
// Stats
// =============================================================================

#[test]
fn test_stats_serialize_to_json() {
    let (env, tree) = open(small_config(4), DatabaseConfig::new());
    for k in 0..12u8 {
        put(&tree, &[k], &[k], false);
    }
    remove(&tree, &[3], None);
    compress_all(&env);

    let tree_json = serde_json::to_value(tree.stats()).unwrap();
    assert_eq!(tree_json["inserts"], 12);
    assert!(tree_json["splits"].as_u64().unwrap() > 0);

    let compressor_json = serde_json::to_value(env.compressor().stats()).unwrap();
    assert_eq!(compressor_json["queue_size"], 0);
    assert!(compressor_json.get("lazy_processed").is_some());
}
