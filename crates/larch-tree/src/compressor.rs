//! Removal of deleted slots.
//!
//! Deleting a record leaves its slot behind, pending deleted. Lockers hand
//! the BINs they deleted from to the compressor queue when they end. A
//! compression pass takes a snapshot of the queue, removes the slots whose
//! records are gone and prunes the BINs that end up empty.
//!
//! The queue holds one [`BinReference`] per node; references added for a
//! node already queued are merged into it. A reference without deleted
//! keys asks for the node to be pruned.
//!
//! Nodes are found again by searching, so a reference whose node was split
//! or removed in the meantime is dropped. Keys that a split moved to a
//! sibling are chased separately.

use crate::bin_ref::BinReference;
use crate::env::Environment;
use crate::in_node::In;
use crate::latch::{ExclusiveLatch, NodeGuard};
use crate::node::Target;
use crate::tree::{Flow, RetrySignal, SearchType, Tree};
use larch_common::{NodeId, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct CompressorCounters {
    processed: AtomicU64,
    split: AtomicU64,
    db_closed: AtomicU64,
    cursors: AtomicU64,
    non_empty: AtomicU64,
    requeued: AtomicU64,
    lazy_processed: AtomicU64,
    lazy_empty: AtomicU64,
    lazy_split: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Compressor statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompressorStats {
    /// References waiting in the queue.
    pub queue_size: usize,
    /// Emptied BINs pruned from their tree.
    pub processed: u64,
    /// References dropped because their node was split or is gone.
    pub split: u64,
    /// References dropped because their database is closed.
    pub db_closed: u64,
    /// Times work was put off because cursors were on a node.
    pub cursors: u64,
    /// Prunes abandoned because the BIN was no longer empty.
    pub non_empty: u64,
    /// References put back on the queue by a pass.
    pub requeued: u64,
    /// BINs compressed just before being logged or evicted.
    pub lazy_processed: u64,
    pub lazy_empty: u64,
    pub lazy_split: u64,
}

/// The compressor queue and its passes.
pub struct Compressor {
    queue: Mutex<HashMap<NodeId, BinReference>>,
    // Held for a whole pass.
    running: Mutex<()>,
    counters: CompressorCounters,
}

impl Compressor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(HashMap::new()),
            running: Mutex::new(()),
            counters: CompressorCounters::default(),
        }
    }

    // ------------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------------

    /// Queues `bin_ref`, merging it into a reference to the same node.
    pub fn add_bin_ref_to_queue(&self, bin_ref: BinReference) {
        let mut queue = self.queue.lock();
        match queue.get_mut(&bin_ref.node_id()) {
            Some(queued) => queued.merge(bin_ref),
            None => {
                queue.insert(bin_ref.node_id(), bin_ref);
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        self.queue.lock().len()
    }

    /// True if a reference to `node_id` is queued.
    pub fn exists(&self, node_id: NodeId) -> bool {
        self.queue.lock().contains_key(&node_id)
    }

    /// Empties the queue. Returns how many references were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Takes the queued reference of `node_id` if it names deleted keys.
    /// A reference asking for a prune stays queued.
    fn remove_compressible_bin_reference(&self, node_id: NodeId) -> Option<BinReference> {
        let mut queue = self.queue.lock();
        if !queue.get(&node_id)?.deleted_keys_exist() {
            return None;
        }
        queue.remove(&node_id)
    }

    fn requeue(&self, bin_ref: BinReference) {
        bump(&self.counters.requeued);
        self.add_bin_ref_to_queue(bin_ref);
    }

    pub fn stats(&self) -> CompressorStats {
        let c = &self.counters;
        CompressorStats {
            queue_size: self.queue_size(),
            processed: c.processed.load(Ordering::Relaxed),
            split: c.split.load(Ordering::Relaxed),
            db_closed: c.db_closed.load(Ordering::Relaxed),
            cursors: c.cursors.load(Ordering::Relaxed),
            non_empty: c.non_empty.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            lazy_processed: c.lazy_processed.load(Ordering::Relaxed),
            lazy_empty: c.lazy_empty.load(Ordering::Relaxed),
            lazy_split: c.lazy_split.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------------

    /// Runs one pass over the references queued so far. References queued
    /// during the pass wait for the next one. Returns how many references
    /// the pass took. No latch may be held by the caller.
    pub fn do_compress(&self, env: &Environment) -> Result<usize> {
        let _running = self.running.lock();
        let snapshot: Vec<BinReference> = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                return Ok(0);
            }
            std::mem::take(&mut *queue).into_values().collect()
        };
        let taken = snapshot.len();
        debug!(queue_size = taken, "compressor pass");

        for mut bin_ref in snapshot {
            let Some(tree) = env.tree(bin_ref.db_id()) else {
                bump(&self.counters.db_closed);
                continue;
            };
            let Some(bin) = self.find_bin(&tree, &bin_ref)? else {
                continue;
            };
            if bin_ref.deleted_keys_exist() {
                let requeued = self.compress_bin(&tree, bin, &mut bin_ref)?;
                if !requeued {
                    self.check_for_relocated_slots(&tree, &bin_ref)?;
                }
            } else {
                // Queued by a lazy compression that emptied the node.
                let id_key = bin.identifier_key().to_vec();
                let dup_key = bin.dup_key().map(<[u8]>::to_vec);
                drop(bin);
                self.prune_bin(&tree, bin_ref, &id_key, dup_key.as_deref())?;
            }
        }
        Ok(taken)
    }

    /// Compresses the latched `bin` and prunes it if that empties it.
    /// Returns true if the reference went back on the queue.
    fn compress_bin(&self, tree: &Tree, mut bin: ExclusiveLatch, bin_ref: &mut BinReference) -> Result<bool> {
        if bin.n_cursors() > 0 {
            drop(bin);
            bump(&self.counters.cursors);
            self.requeue(bin_ref.clone());
            return Ok(true);
        }
        if bin.compress(Some(&mut *bin_ref), true)? {
            bump(&self.counters.requeued);
            return Ok(true);
        }
        if bin.n_entries() != 0 {
            return Ok(false);
        }
        let id_key = bin.identifier_key().to_vec();
        let dup_key = bin.dup_key().map(<[u8]>::to_vec);
        drop(bin);
        self.prune_bin(tree, bin_ref.clone(), &id_key, dup_key.as_deref())
    }

    /// Removes the emptied node from its tree. Returns true if the
    /// reference was queued again for cursors in the way.
    fn prune_bin(&self, tree: &Tree, bin_ref: BinReference, id_key: &[u8], dup_key: Option<&[u8]>) -> Result<bool> {
        let flow = match dup_key {
            Some(main_key) => tree.delete_dup(id_key, main_key)?,
            None => tree.delete(id_key)?,
        };
        match flow {
            Flow::Done(()) => {
                bump(&self.counters.processed);
                Ok(false)
            }
            Flow::Retry(RetrySignal::CursorsExist) => {
                bump(&self.counters.cursors);
                self.requeue(bin_ref);
                Ok(true)
            }
            Flow::Retry(RetrySignal::NodeNotEmpty) => {
                bump(&self.counters.non_empty);
                Ok(false)
            }
            Flow::Retry(signal) => {
                trace!(node_id = %bin_ref.node_id(), ?signal, "prune abandoned");
                Ok(false)
            }
        }
    }

    /// Compresses, one at a time, the nodes that deleted keys not found in
    /// the referenced node were moved to by a split.
    fn check_for_relocated_slots(&self, tree: &Tree, bin_ref: &BinReference) -> Result<()> {
        for key in bin_ref.deleted_keys() {
            let found = match bin_ref.dup_key() {
                Some(main_key) => search_for_bin(tree, main_key, Some(key))?,
                None => search_for_bin(tree, key, None)?,
            };
            if let Some(split_bin) = found {
                let mut split_ref = split_bin.create_reference();
                split_ref.add_deleted_key(key.to_vec());
                self.compress_bin(tree, split_bin, &mut split_ref)?;
            }
        }
        Ok(())
    }

    /// Finds the node named by `bin_ref`, latched.
    fn find_bin(&self, tree: &Tree, bin_ref: &BinReference) -> Result<Option<ExclusiveLatch>> {
        let found = match bin_ref.dup_key() {
            Some(main_key) => search_for_bin(tree, main_key, Some(bin_ref.id_key()))?,
            None => search_for_bin(tree, bin_ref.id_key(), None)?,
        };
        match found {
            Some(bin) if bin.node_id() == bin_ref.node_id() => Ok(Some(bin)),
            _ => {
                bump(&self.counters.split);
                Ok(None)
            }
        }
    }

    /// Compresses the latched `bin` without fetching and without pruning,
    /// using the queued reference to it. Emptied nodes and keys that could
    /// not be handled are left on the queue for the next pass.
    pub fn lazy_compress(&self, bin: &mut In) -> Result<()> {
        if !bin.is_bin() || bin.n_cursors() > 0 {
            return Ok(());
        }
        let Some(mut bin_ref) = self.remove_compressible_bin_reference(bin.node_id()) else {
            return Ok(());
        };
        let requeued = bin.compress(Some(&mut bin_ref), false)?;
        bump(&self.counters.lazy_processed);
        if requeued {
            return Ok(());
        }
        if bin_ref.deleted_keys_exist() {
            bump(&self.counters.lazy_split);
            self.requeue(bin_ref);
        } else if bin.n_entries() == 0 {
            bump(&self.counters.lazy_empty);
            self.requeue(bin_ref);
        }
        Ok(())
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Searches for the bottom node holding `main_key`, descending into its
/// duplicate tree by `dup_key` when one is given and exists.
fn search_for_bin(tree: &Tree, main_key: &[u8], dup_key: Option<&[u8]>) -> Result<Option<ExclusiveLatch>> {
    let Some(found) = tree.search(main_key, SearchType::Normal, None, None, false)? else {
        return Ok(None);
    };
    let mut bin = found.into_exclusive()?;
    let Some(dup_key) = dup_key else {
        return Ok(Some(bin));
    };
    let index = bin.find_entry(main_key, false, true);
    if index < 0 || bin.is_entry_known_deleted(index as usize) {
        return Ok(None);
    }
    let dup_root = match bin.fetch_target(index as usize)? {
        Some(Target::Node(node)) if node.kind().contains_duplicates() => node.clone(),
        // Not converted to a duplicate tree yet.
        Some(_) => return Ok(Some(bin)),
        None => return Ok(None),
    };
    let dup_root = dup_root.latch();
    drop(bin);
    tree.search_sub_tree(NodeGuard::from(dup_root), dup_key, SearchType::Normal, None, None, false)?
        .map(NodeGuard::into_exclusive)
        .transpose()
}
