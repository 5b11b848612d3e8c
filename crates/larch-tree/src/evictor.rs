//! Eviction of resident nodes.
//!
//! A batch takes the oldest resident nodes by generation and either strips
//! the leaves of a BIN or detaches a whole node from its parent, logging
//! it first when dirty. The parent slot keeps the LSN, so the node is
//! fetched back on the next access.
//!
//! Nodes are latched without waiting, so a busy node is skipped rather
//! than waited for. A node latch is never held while the resident list is
//! latched as a whole.

use crate::env::Environment;
use crate::in_node::EvictionType;
use crate::latch::{ExclusiveLatch, NodeRef};
use crate::tree::Tree;
use larch_common::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct EvictorCounters {
    batches: AtomicU64,
    nodes_scanned: AtomicU64,
    nodes_evicted: AtomicU64,
    bins_stripped: AtomicU64,
    bytes_released: AtomicU64,
}

/// Evictor statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictorStats {
    pub batches: u64,
    pub nodes_scanned: u64,
    /// Nodes detached from their parent.
    pub nodes_evicted: u64,
    /// BINs whose leaves were dropped.
    pub bins_stripped: u64,
    pub bytes_released: u64,
}

/// Frees cache memory by evicting resident nodes.
#[derive(Debug, Default)]
pub struct Evictor {
    counters: EvictorCounters,
}

impl Evictor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> EvictorStats {
        let c = &self.counters;
        EvictorStats {
            batches: c.batches.load(Ordering::Relaxed),
            nodes_scanned: c.nodes_scanned.load(Ordering::Relaxed),
            nodes_evicted: c.nodes_evicted.load(Ordering::Relaxed),
            bins_stripped: c.bins_stripped.load(Ordering::Relaxed),
            bytes_released: c.bytes_released.load(Ordering::Relaxed),
        }
    }

    /// Runs batches until the cache is within budget or a batch frees
    /// nothing. Returns the bytes released.
    pub fn do_evict(&self, env: &Environment) -> Result<i64> {
        let mut released = 0;
        while env.budget().is_over_budget() {
            let batch = self.evict_batch(env)?;
            if batch <= 0 {
                break;
            }
            released += batch;
        }
        Ok(released)
    }

    /// Evicts from up to `evictor_nodes_per_scan` of the least recently
    /// used resident nodes. Returns the bytes released.
    pub fn evict_batch(&self, env: &Environment) -> Result<i64> {
        let mut candidates: Vec<(u64, NodeRef)> = env
            .in_list()
            .snapshot()
            .into_iter()
            .filter_map(|(_, node_ref)| {
                let generation = node_ref.latch_no_wait()?.generation();
                Some((generation, node_ref))
            })
            .collect();
        candidates.sort_by_key(|(generation, _)| *generation);
        candidates.truncate(env.config().evictor_nodes_per_scan);

        let mut released = 0;
        for (_, node_ref) in &candidates {
            self.counters.nodes_scanned.fetch_add(1, Ordering::Relaxed);
            released += self.evict_one(env, node_ref)?;
        }
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        if released > 0 {
            self.counters
                .bytes_released
                .fetch_add(released as u64, Ordering::Relaxed);
        }
        debug!(
            scanned = candidates.len(),
            released,
            over_budget = env.budget().bytes_over_budget(),
            "eviction batch"
        );
        Ok(released)
    }

    fn evict_one(&self, env: &Environment, node_ref: &NodeRef) -> Result<i64> {
        let Some(mut node) = node_ref.latch_no_wait() else {
            return Ok(0);
        };
        if !node.is_in_list_resident() {
            return Ok(0);
        }
        match node.eviction_type() {
            EvictionType::MayNotEvict => Ok(0),
            EvictionType::MayEvictLns => {
                let released = node.evict_lns()?;
                if released > 0 {
                    self.counters.bins_stripped.fetch_add(1, Ordering::Relaxed);
                }
                Ok(released)
            }
            EvictionType::MayEvictNode => {
                if node.is_root() || !node.is_evictable() {
                    return Ok(0);
                }
                let Some(tree) = env.tree(node.database().id()) else {
                    return Ok(0);
                };
                if node.is_bin() {
                    env.compressor().lazy_compress(&mut node)?;
                }
                self.evict_node(env, &tree, node)
            }
        }
    }

    /// Detaches `node` from its parent. The node is released while the
    /// parent is searched for, so everything is checked again under the
    /// parent's latch.
    fn evict_node(&self, env: &Environment, tree: &Tree, node: ExclusiveLatch) -> Result<i64> {
        let node_id = node.node_id();
        let result = tree.get_resident_parent(node)?;
        let (Some(mut parent), Some(index)) = (result.parent, result.index) else {
            return Ok(0);
        };
        let Some(child_ref) = parent.child_node(index).filter(|c| c.node_id() == node_id) else {
            return Ok(0);
        };
        let mut child = child_ref.latch();
        if child.is_root() || !child.is_evictable() || child.eviction_type() != EvictionType::MayEvictNode {
            return Ok(0);
        }

        if child.is_dirty() {
            let lsn = child.log_allowing_deltas(false, None)?;
            parent.update_entry_target_lsn(index, None, lsn);
        } else {
            parent.set_target(index, None);
        }
        let released = child.budgeted_memory_size();
        env.remove_from_in_list(&mut child);
        self.counters.nodes_evicted.fetch_add(1, Ordering::Relaxed);
        trace!(
            node_id = %node_id,
            parent = %parent.node_id(),
            level = child.masked_level(),
            released,
            "evicted node"
        );
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::TreeCursor;
    use crate::env::DatabaseConfig;
    use crate::ln::Ln;
    use crate::txn::Locker;
    use larch_common::EnvironmentConfig;
    use std::sync::Arc;

    fn filled(n: u8, config: DatabaseConfig) -> (Arc<Environment>, Arc<Tree>) {
        let env_config = EnvironmentConfig {
            evictor_nodes_per_scan: 1000,
            ..EnvironmentConfig::default().with_max_entries(4)
        };
        let env = Environment::open(env_config).unwrap();
        let tree = env.open_tree(config).unwrap();
        for k in 0..n {
            let cursor = TreeCursor::new(Locker::basic(&env));
            assert!(tree.insert(Ln::new(&env, vec![k]), &[k], false, &cursor).unwrap());
            cursor.locker().operation_end().unwrap();
        }
        (env, tree)
    }

    #[test]
    fn test_first_batch_strips_leaves() {
        let (env, tree) = filled(20, DatabaseConfig::new());
        let evictor = Evictor::new();
        let resident = env.in_list().len();
        assert!(evictor.evict_batch(&env).unwrap() > 0);
        let stats = evictor.stats();
        assert!(stats.bins_stripped > 0);
        assert_eq!(stats.nodes_evicted, 0);
        assert_eq!(env.in_list().len(), resident);
        assert_eq!(tree.get(&[13]).unwrap(), Some(vec![13]));
    }

    #[test]
    fn test_stripped_bins_are_evicted_and_fetched_back() {
        let (env, tree) = filled(20, DatabaseConfig::new());
        let evictor = Evictor::new();
        let resident = env.in_list().len();
        evictor.evict_batch(&env).unwrap();
        evictor.evict_batch(&env).unwrap();
        assert!(evictor.stats().nodes_evicted > 0);
        assert!(env.in_list().len() < resident);
        assert!(tree.validate_in_list().unwrap());

        for k in 0..20u8 {
            assert_eq!(tree.get(&[k]).unwrap(), Some(vec![k]));
        }
        tree.verify().unwrap();
    }

    #[test]
    fn test_root_stays_resident() {
        let (env, tree) = filled(20, DatabaseConfig::new());
        let evictor = Evictor::new();
        for _ in 0..6 {
            evictor.evict_batch(&env).unwrap();
        }
        assert!(tree.is_root_resident());
        assert!(env.in_list().len() >= 1);
    }

    #[test]
    fn test_cursor_pins_bin() {
        let (env, tree) = filled(3, DatabaseConfig::new());
        let cursor = TreeCursor::new(Locker::basic(&env));
        let mut bin = tree.get_first_node().unwrap().unwrap().into_exclusive().unwrap();
        cursor.update_bin(&mut bin, 0);
        drop(bin);

        let evictor = Evictor::new();
        evictor.evict_batch(&env).unwrap();
        evictor.evict_batch(&env).unwrap();
        assert_eq!(evictor.stats().nodes_evicted, 0);
        let bin = tree.get_first_node().unwrap().unwrap();
        assert!(bin.ln(0).is_some());
    }

    #[test]
    fn test_dirty_node_is_logged_before_eviction() {
        let (env, tree) = filled(20, DatabaseConfig::new().deferred_write(true));
        let before = env.log().end_of_log();
        let evictor = Evictor::new();
        evictor.evict_batch(&env).unwrap();
        evictor.evict_batch(&env).unwrap();
        assert!(evictor.stats().nodes_evicted > 0);
        assert!(env.log().end_of_log() > before);
        for k in 0..20u8 {
            assert_eq!(tree.get(&[k]).unwrap(), Some(vec![k]));
        }
    }
}
