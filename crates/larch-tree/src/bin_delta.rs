//! Partial versions of bottom nodes.
//!
//! A delta carries the slots changed since the node's last full version.
//! Slot dirty bits survive delta logging, so each delta is cumulative and
//! only the most recent one is needed to rebuild the node on top of the
//! full version it names.

use crate::child_ref::ChildReference;
use crate::codec;
use crate::constants::{DIRTY_BIT, EXACT_MATCH, INDEX_MASK};
use crate::env::Database;
use crate::in_node::In;
use crate::node::NodeKind;
use larch_common::{DatabaseId, LarchError, NodeId, Result};
use larch_log::Lsn;
use std::sync::Arc;
use tracing::trace;

/// One changed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaInfo {
    pub key: Vec<u8>,
    pub lsn: Lsn,
    pub state: u8,
}

/// The changed slots of a BIN or DBIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinDelta {
    pub node_id: NodeId,
    pub db_id: DatabaseId,
    /// Full version the delta applies to.
    pub last_full_lsn: Lsn,
    /// Deltas in the chain once this one is logged.
    pub deltas_since_full: u32,
    pub entries: Vec<DeltaInfo>,
}

impl BinDelta {
    /// Collects the dirty slots of `bin`.
    pub fn from_bin(bin: &In) -> Self {
        let entries = (0..bin.n_entries())
            .filter(|&i| bin.is_entry_dirty(i))
            .map(|i| DeltaInfo {
                key: bin.key(i).to_vec(),
                lsn: bin.lsn(i),
                state: bin.state(i),
            })
            .collect();
        Self {
            node_id: bin.node_id(),
            db_id: bin.database().id(),
            last_full_lsn: bin.last_full_version(),
            deltas_since_full: bin.num_deltas_since_last_full() + 1,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reads the full version and applies this delta, logged at
    /// `delta_lsn`, on top of it. Applied slots stay dirty.
    pub fn reconstruct_bin(&self, db: &Arc<Database>, delta_lsn: Lsn) -> Result<In> {
        if self.db_id != db.id() {
            return Err(LarchError::LogCorrupted {
                lsn: delta_lsn.to_string(),
                reason: format!("delta of {} applied to {}", self.db_id, db.id()),
            });
        }
        let record = db.env().log().get(self.last_full_lsn)?;
        let kind = match NodeKind::from_log_type(record.entry_type) {
            Some(kind) if kind.is_bin() => kind,
            _ => {
                return Err(LarchError::LogCorrupted {
                    lsn: delta_lsn.to_string(),
                    reason: format!(
                        "delta names {:?} entry at {} as its full version",
                        record.entry_type, self.last_full_lsn
                    ),
                })
            }
        };
        let mut bin = codec::read_in(db, kind, &record.payload, self.last_full_lsn)?;
        if bin.node_id() != self.node_id {
            return Err(LarchError::LogCorrupted {
                lsn: delta_lsn.to_string(),
                reason: format!("delta of node {} names full version of {}", self.node_id, bin.node_id()),
            });
        }
        bin.post_fetch_init(self.last_full_lsn);

        for entry in &self.entries {
            let found = bin.find_entry(&entry.key, true, false);
            if found >= 0 && found & EXACT_MATCH != 0 {
                bin.update_entry_lsn_state((found & INDEX_MASK) as usize, entry.lsn, entry.state);
            } else {
                let slot = ChildReference::with_state(None, entry.key.clone(), entry.lsn, entry.state | DIRTY_BIT);
                bin.insert_entry(slot)?;
            }
        }
        bin.set_delta_state(delta_lsn, self.deltas_since_full);
        bin.set_dirty(false);
        bin.init_memory_size();
        trace!(
            node_id = %self.node_id,
            full = %self.last_full_lsn,
            delta = %delta_lsn,
            slots = self.entries.len(),
            "reconstructed from delta"
        );
        Ok(bin)
    }
}
