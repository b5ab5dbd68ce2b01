//! Directory state.
//!
//! A dir-capable inode lazily owns a [`Dir`]: the name→dentry map plus
//! replication policy, freeze state, and the auth-pin counters that gate
//! subtree migration. Auth pins propagate nested counts up the parent
//! chain (handled at cache level, which owns the graph).

use crate::waiter::Continuation;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sfs_types::{DirRep, InodeNumber, MdsId};
use std::collections::{BTreeMap, BTreeSet};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DirState: u32 {
        /// All entries are present in memory.
        const COMPLETE         = 1 << 0;
        /// Contents differ from the stored version.
        const DIRTY            = 1 << 1;
        /// This MDS is authoritative for the dir's contents.
        const AUTH             = 1 << 2;
        /// Root of a subtree this MDS imported.
        const IMPORT           = 1 << 3;
        /// Conversion to hashed form in progress.
        const HASHING          = 1 << 4;
        /// Entries are sharded across the cluster by dentry hash.
        const HASHED           = 1 << 5;
        /// Conversion back to single-authority form in progress.
        const UNHASHING        = 1 << 6;
        /// Root of a frozen subtree.
        const FROZEN_TREE_ROOT = 1 << 7;
        /// This dir alone is frozen.
        const FROZEN_DIR       = 1 << 8;
        /// Freeze requested; waiting for auth pins to drain.
        const FREEZING         = 1 << 9;
    }
}

/// Dir state bits that survive migration to the importer.
pub const DIR_STATE_EXPORTED_MASK: u32 =
    DirState::COMPLETE.bits() | DirState::DIRTY.bits();

/// Dir state bits the exporter keeps after handing contents off: the
/// freeze lasts until the ack, and hashed-ness is a cluster-wide fact.
pub const DIR_STATE_EXPORT_KEPT_MASK: u32 = DirState::FROZEN_TREE_ROOT.bits()
    | DirState::FROZEN_DIR.bits()
    | DirState::FREEZING.bits()
    | DirState::HASHED.bits();

/// A directory entry: the link from a name to a child inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dentry {
    pub ino: InodeNumber,
}

/// Events a continuation can park on at dir granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirWait {
    /// A specific dentry appearing (discover completion).
    Dentry(String),
    Unfreeze,
    /// Import of the surrounding subtree completing.
    Imported,
    /// Auth pins draining to zero so a freeze can complete.
    Freezeable,
}

/// What a completed freeze should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeKind {
    Tree,
    Dir,
}

#[derive(Debug)]
pub struct Dir {
    pub state: DirState,
    pub version: u64,
    pub entries: BTreeMap<String, Dentry>,
    pub dir_rep: DirRep,
    pub dir_rep_by: BTreeSet<MdsId>,
    pub popularity: f64,
    pub auth_pins: u32,
    pub nested_auth_pins: u32,
    /// Continuation to run when the pending freeze completes, plus its
    /// flavor. At most one freeze is in flight per dir.
    pub pending_freeze: Option<(FreezeKind, Option<Continuation>)>,
    waiters: Vec<(DirWait, Continuation)>,
}

impl Dir {
    #[must_use]
    pub fn new(auth: bool) -> Self {
        let mut state = DirState::empty();
        if auth {
            state |= DirState::AUTH;
        }
        Self {
            state,
            version: 0,
            entries: BTreeMap::new(),
            dir_rep: DirRep::None,
            dir_rep_by: BTreeSet::new(),
            popularity: 0.0,
            auth_pins: 0,
            nested_auth_pins: 0,
            pending_freeze: None,
            waiters: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        self.state.contains(DirState::AUTH)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.contains(DirState::COMPLETE)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.contains(DirState::DIRTY)
    }

    #[must_use]
    pub fn is_import(&self) -> bool {
        self.state.contains(DirState::IMPORT)
    }

    #[must_use]
    pub fn is_hashed(&self) -> bool {
        self.state.contains(DirState::HASHED)
    }

    #[must_use]
    pub fn is_hashing(&self) -> bool {
        self.state.contains(DirState::HASHING)
    }

    #[must_use]
    pub fn is_unhashing(&self) -> bool {
        self.state.contains(DirState::UNHASHING)
    }

    #[must_use]
    pub fn is_freezing(&self) -> bool {
        self.state.contains(DirState::FREEZING)
    }

    #[must_use]
    pub fn is_frozen_tree_root(&self) -> bool {
        self.state.contains(DirState::FROZEN_TREE_ROOT)
    }

    #[must_use]
    pub fn is_frozen_dir(&self) -> bool {
        self.state.contains(DirState::FROZEN_DIR)
    }

    /// All auth pins, direct and nested, have drained.
    #[must_use]
    pub fn is_freezeable(&self) -> bool {
        self.auth_pins == 0 && self.nested_auth_pins == 0
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Dentry> {
        self.entries.get(name)
    }

    pub fn add_child(&mut self, name: String, ino: InodeNumber) {
        let prev = self.entries.insert(name, Dentry { ino });
        assert!(prev.is_none(), "dentry already present");
    }

    pub fn remove_child(&mut self, name: &str) {
        self.entries.remove(name);
    }

    // ── waiters ────────────────────────────────────────────────────────

    pub fn add_waiter(&mut self, wait: DirWait, c: Continuation) {
        self.waiters.push((wait, c));
    }

    pub fn take_waiting(&mut self, wait: &DirWait) -> Vec<Continuation> {
        let mut taken = Vec::new();
        let mut kept = Vec::new();
        for (w, c) in self.waiters.drain(..) {
            if w == *wait {
                taken.push(c);
            } else {
                kept.push((w, c));
            }
        }
        self.waiters = kept;
        taken
    }

    pub fn take_all_waiting(&mut self) -> Vec<Continuation> {
        self.waiters.drain(..).map(|(_, c)| c).collect()
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_msg::{CacheMessage, Envelope};

    fn retry(n: u32) -> Continuation {
        Continuation::RetryMessage(Envelope::cache(
            MdsId(0),
            MdsId(n),
            CacheMessage::InodeGetReplica {
                ino: InodeNumber(1),
            },
        ))
    }

    #[test]
    fn dentry_waiters_are_name_scoped() {
        let mut dir = Dir::new(true);
        dir.add_waiter(DirWait::Dentry("a".into()), retry(1));
        dir.add_waiter(DirWait::Dentry("b".into()), retry(2));
        dir.add_waiter(DirWait::Unfreeze, retry(3));

        let a = dir.take_waiting(&DirWait::Dentry("a".into()));
        assert_eq!(a.len(), 1);
        assert_eq!(dir.waiter_count(), 2);
        let all = dir.take_all_waiting();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn freezeable_requires_both_counters_drained() {
        let mut dir = Dir::new(true);
        assert!(dir.is_freezeable());
        dir.auth_pins = 1;
        assert!(!dir.is_freezeable());
        dir.auth_pins = 0;
        dir.nested_auth_pins = 2;
        assert!(!dir.is_freezeable());
    }

    #[test]
    fn duplicate_dentry_aborts() {
        let mut dir = Dir::new(true);
        dir.add_child("x".into(), InodeNumber(5));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dir.add_child("x".into(), InodeNumber(6));
        }));
        assert!(result.is_err());
    }
}
