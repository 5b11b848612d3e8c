//! Root splits.
//!
//! A full root cannot be split into a parent it does not have, so a new
//! root one level up is created over it first.

use super::stats::TreeCounters;
use super::Tree;
use crate::child_ref::ChildReference;
use crate::in_node::In;
use crate::latch::NodeRef;
use crate::node::Target;
use larch_common::{LarchError, Result};
use tracing::debug;

impl Tree {
    /// Grows the tree by one level and splits the old root under the new
    /// one. The caller holds the root latch exclusively.
    pub(super) fn split_root(&self, root: &mut Option<ChildReference>) -> Result<()> {
        let Some(current_ref) = self.fetch_root(root)? else {
            return Err(LarchError::InconsistentState(format!(
                "split of missing root in database {}",
                self.database.id()
            )));
        };
        let mut current = current_ref.latch();
        let max_entries = self.database.node_max_entries();
        let id_key = current.key(0).to_vec();

        let new_root_ref = NodeRef::new(In::new_in(
            &self.database,
            id_key.clone(),
            max_entries,
            current.level() + 1,
        ));
        let mut new_root = new_root_ref.latch();
        new_root.set_is_root(true);
        current.set_is_root(false);

        // The old root is logged provisionally, the new root makes it
        // reachable. A failure leaves the old root in charge.
        let logged = current
            .optional_log_provisional(Some(&mut *new_root))
            .and_then(|current_lsn| {
                new_root.insert_entry(ChildReference::new(
                    Some(Target::Node(current_ref.clone())),
                    id_key,
                    current_lsn,
                ))?;
                new_root.optional_log()
            });
        let log_lsn = match logged {
            Ok(lsn) => lsn,
            Err(e) => {
                current.set_is_root(true);
                return Err(e);
            }
        };
        self.database.env().add_to_in_list(&mut new_root, &new_root_ref);

        let reference = root.get_or_insert_with(|| ChildReference::new(None, Vec::new(), log_lsn));
        reference.set_target(Some(Target::Node(new_root_ref.clone())));
        reference.update_lsn_after_optional_log(&self.database, log_lsn);

        In::split(&mut current, &mut new_root, 0, max_entries)?;
        // The split logged the new root again.
        reference.set_lsn(new_root.last_full_version());
        TreeCounters::bump(&self.counters.root_splits);
        debug!(
            db_id = %self.database.id(),
            old_root = %current.node_id(),
            new_root = %new_root.node_id(),
            level = new_root.masked_level(),
            "split root"
        );
        Ok(())
    }
}
