//! Child references: a key, an LSN, a state byte and an optional resident
//! target. The tree root and a duplicate tree's count leaf are held this way,
//! and slots move between nodes in this form.

use crate::constants::{DIRTY_BIT, KNOWN_DELETED_BIT, MIGRATE_BIT, PENDING_DELETED_BIT};
use crate::env::Database;
use crate::latch::NodeRef;
use crate::ln::Ln;
use crate::node::{fetch_node, Target};
use larch_common::{LarchError, NodeId, Result};
use larch_log::Lsn;
use std::sync::Arc;
use tracing::warn;

/// Identity of the node holding a reference, for fetch diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct ParentInfo {
    pub node_id: NodeId,
    pub last_full_version: Lsn,
    pub dirty: bool,
}

/// A reference to a child node.
#[derive(Debug)]
pub struct ChildReference {
    target: Option<Target>,
    key: Vec<u8>,
    lsn: Lsn,
    state: u8,
}

impl ChildReference {
    /// Creates a reference whose state is just the dirty bit.
    pub fn new(target: Option<Target>, key: Vec<u8>, lsn: Lsn) -> Self {
        Self::with_state(target, key, lsn, DIRTY_BIT)
    }

    pub fn with_state(target: Option<Target>, key: Vec<u8>, lsn: Lsn, state: u8) -> Self {
        Self {
            target,
            key,
            lsn,
            state,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn set_key(&mut self, key: Vec<u8>) {
        self.key = key;
        self.set_dirty();
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.lsn = lsn;
        self.set_dirty();
    }

    /// Stores the LSN returned by an optional log, keeping the old one when
    /// a deferred write database skipped the write.
    pub fn update_lsn_after_optional_log(&mut self, db: &Database, lsn: Lsn) {
        if !(lsn.is_null() && db.is_deferred_write()) {
            self.set_lsn(lsn);
        }
    }

    pub fn state(&self) -> u8 {
        self.state
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn target_mut(&mut self) -> Option<&mut Target> {
        self.target.as_mut()
    }

    pub fn set_target(&mut self, target: Option<Target>) {
        self.target = target;
    }

    pub fn take_target(&mut self) -> Option<Target> {
        self.target.take()
    }

    /// Returns the resident internal node, if any.
    pub fn resident_node(&self) -> Option<&NodeRef> {
        self.target.as_ref().and_then(Target::as_node)
    }

    pub fn is_known_deleted(&self) -> bool {
        self.state & KNOWN_DELETED_BIT != 0
    }

    pub fn is_pending_deleted(&self) -> bool {
        self.state & PENDING_DELETED_BIT != 0
    }

    pub fn is_migrate(&self) -> bool {
        self.state & MIGRATE_BIT != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.state & DIRTY_BIT != 0
    }

    pub fn set_dirty(&mut self) {
        self.state |= DIRTY_BIT;
    }

    pub fn clear_dirty(&mut self) {
        self.state &= !DIRTY_BIT;
    }

    pub fn set_known_deleted(&mut self) {
        self.state |= KNOWN_DELETED_BIT;
        self.set_dirty();
    }

    /// Splits the reference into its parts.
    pub fn into_parts(self) -> (Option<Target>, Vec<u8>, Lsn, u8) {
        (self.target, self.key, self.lsn, self.state)
    }

    /// Returns the target, reading it from the log if it is not resident.
    ///
    /// A NULL LSN with no target is only legal for a known deleted slot.
    /// Missing log files are tolerated for deleted slots.
    pub fn fetch_target(
        &mut self,
        db: &Arc<Database>,
        parent: Option<ParentInfo>,
    ) -> Result<Option<&mut Target>> {
        if self.target.is_none() {
            if self.lsn.is_null() {
                if self.is_known_deleted() {
                    return Ok(None);
                }
                return Err(LarchError::InconsistentState(fetch_error_msg(
                    "NULL LSN without known deleted flag",
                    parent,
                    None,
                    &self.key,
                    self.lsn,
                    self.state,
                )));
            }
            match fetch_node(db, self.lsn) {
                Ok(target) => self.target = Some(target),
                Err(e) if e.is_log_file_not_found() && self.is_deleted() => {
                    warn!(lsn = %self.lsn, error = %e, "log file missing for deleted child reference");
                    return Ok(None);
                }
                Err(e) => {
                    return Err(LarchError::Fetch {
                        context: fetch_error_msg(
                            "fetch of child reference failed",
                            parent,
                            None,
                            &self.key,
                            self.lsn,
                            self.state,
                        ),
                        source: Box::new(e),
                    })
                }
            }
        }
        Ok(self.target.as_mut())
    }

    /// Fetches the target and returns it as a leaf.
    pub fn fetch_ln(
        &mut self,
        db: &Arc<Database>,
        parent: Option<ParentInfo>,
    ) -> Result<Option<&mut Ln>> {
        Ok(self.fetch_target(db, parent)?.and_then(Target::as_ln_mut))
    }

    fn is_deleted(&self) -> bool {
        self.is_known_deleted() || self.is_pending_deleted()
    }
}

/// Builds the diagnostic attached to a failed fetch.
pub(crate) fn fetch_error_msg(
    msg: &str,
    parent: Option<ParentInfo>,
    index: Option<usize>,
    key: &[u8],
    lsn: Lsn,
    state: u8,
) -> String {
    let mut out = format!("fetchTarget of {}", lsn);
    match parent {
        Some(p) => out.push_str(&format!(
            " parent IN={} lastFullVersion={} parent.getDirty()={}",
            p.node_id, p.last_full_version, p.dirty
        )),
        None => out.push_str(" parent IN=none"),
    }
    if let Some(index) = index {
        out.push_str(&format!(" index={}", index));
    }
    out.push_str(&format!(" key={:?} state=0x{:x} {}", key, state, msg));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_bits() {
        let mut r = ChildReference::with_state(None, b"k".to_vec(), Lsn::NULL, 0);
        assert!(!r.is_dirty());
        r.set_known_deleted();
        assert!(r.is_known_deleted());
        assert!(r.is_dirty());
        assert!(!r.is_pending_deleted());
        r.clear_dirty();
        r.set_lsn(Lsn::new(1, 16));
        assert!(r.is_dirty());
        assert_eq!(r.lsn(), Lsn::new(1, 16));
    }

    #[test]
    fn test_into_parts() {
        let r = ChildReference::new(None, b"key".to_vec(), Lsn::new(2, 40));
        let (target, key, lsn, state) = r.into_parts();
        assert!(target.is_none());
        assert_eq!(key, b"key");
        assert_eq!(lsn, Lsn::new(2, 40));
        assert_eq!(state, DIRTY_BIT);
    }

    #[test]
    fn test_fetch_error_msg() {
        let parent = ParentInfo {
            node_id: NodeId(9),
            last_full_version: Lsn::new(1, 32),
            dirty: true,
        };
        let msg = fetch_error_msg("boom", Some(parent), Some(3), b"a", Lsn::NULL, 0x2);
        assert!(msg.contains("parent IN=9"));
        assert!(msg.contains("index=3"));
        assert!(msg.contains("state=0x2"));
        assert!(msg.ends_with("boom"));
    }
}
