#![allow(dead_code)]

use larch_common::EnvironmentConfig;
use larch_tree::{DatabaseConfig, Environment, Ln, Locker, Tree, TreeCursor};
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Routes tracing output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn small_config(max_entries: usize) -> EnvironmentConfig {
    EnvironmentConfig::default().with_max_entries(max_entries)
}

pub fn open(config: EnvironmentConfig, db_config: DatabaseConfig) -> (Arc<Environment>, Arc<Tree>) {
    init_tracing();
    let env = Environment::open(config).unwrap();
    let tree = env.open_tree(db_config).unwrap();
    (env, tree)
}

pub fn put(tree: &Tree, key: &[u8], data: &[u8], dups: bool) -> bool {
    let env = tree.database().env();
    let cursor = TreeCursor::new(Locker::basic(env));
    let inserted = tree.insert(Ln::new(env, data.to_vec()), key, dups, &cursor).unwrap();
    cursor.locker().operation_end().unwrap();
    inserted
}

pub fn remove(tree: &Tree, key: &[u8], data: Option<&[u8]>) -> usize {
    let cursor = TreeCursor::new(Locker::basic(tree.database().env()));
    let deleted = tree.delete_record(key, data, &cursor).unwrap();
    cursor.locker().operation_end().unwrap();
    deleted
}

/// Keys of every bottom node of the main tree, left to right.
pub fn all_keys(tree: &Tree) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    let mut bin = tree.get_first_node().unwrap().map(|b| b.into_exclusive().unwrap());
    while let Some(current) = bin {
        keys.extend((0..current.n_entries()).map(|i| current.key(i).to_vec()));
        bin = tree.get_next_bin(current, false).unwrap();
    }
    keys
}

/// Runs compressor passes until the queue stays empty.
pub fn compress_all(env: &Environment) {
    for _ in 0..8 {
        env.compressor().do_compress(env).unwrap();
        if env.compressor().queue_size() == 0 {
            return;
        }
    }
    panic!("compressor queue did not drain");
}
