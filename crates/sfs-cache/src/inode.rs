//! Cached inode state.
//!
//! An [`Inode`] is one node of the in-memory namespace graph. It is either
//! authoritative (`auth`) or a replica. Distributed coherence state lives
//! in the [`InodeDist`] bitset; pins are a multiset of reasons and an
//! inode is expireable only when no pin of any reason is held.

use crate::waiter::Continuation;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sfs_types::{ClientId, DirAuth, InodeCore, InodeNumber, MdsId};
use std::collections::{BTreeMap, BTreeSet};

use crate::dir::Dir;

bitflags! {
    /// Distributed coherence state of one inode, as seen locally.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InodeDist: u16 {
        /// Replica: the authority holds the sync.
        const SYNCBYAUTH   = 1 << 0;
        /// Authority: I hold the sync.
        const SYNCBYME     = 1 << 1;
        /// Authority: sync requested, acks outstanding.
        const PRESYNC      = 1 << 2;
        /// Replica: the authority holds the hard lock.
        const LOCKBYAUTH   = 1 << 3;
        /// Authority: I hold the hard lock.
        const LOCKBYME     = 1 << 4;
        /// Authority: lock requested, acks outstanding.
        const PRELOCK      = 1 << 5;
        /// Soft metadata is only loosely consistent (monotonic updates
        /// may be applied on any holder without a sync).
        const SOFTASYNC    = 1 << 6;
        /// Replica: a local waiter is parked until the sync releases.
        const WAITONUNSYNC = 1 << 7;
        /// Replica: a local waiter is parked until the lock releases.
        const WAITONUNLOCK = 1 << 8;
    }
}

/// Why an inode is pinned in cache. The pin set is a multiset: a reason
/// may be held more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PinReason {
    /// Subtree root this MDS imported.
    Import,
    /// Subtree root this MDS handed off (an export point).
    Export,
    /// Dirty state not yet journaled away.
    Dirty,
    /// Sync acquisition in flight.
    Presync,
    /// Lock acquisition in flight.
    Prelock,
    /// Waiting for the authority to release a sync.
    WaitOnUnsync,
    /// Waiting for the authority to release a lock.
    WaitOnUnlock,
    /// A parked continuation references this inode.
    Waiter,
    /// Authority side: at least one peer holds a replica.
    Cached,
    /// One per cached child dentry; keeps parents in cache until their
    /// children evict, so back-references never dangle.
    Child,
    /// Anchor held during export prep so the dir cannot evict mid-flight.
    ExportPrep,
}

/// Events a continuation can park on at inode granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeWait {
    Sync,
    Unsync,
    Lock,
    Unlock,
    AuthPinnable,
    GetReplica,
}

/// Back-reference from an inode to the dentry that links it: the owning
/// dir's ino plus the entry name. Borrowed, never owning — the namespace
/// is a DAG with at most one parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub dir_ino: InodeNumber,
    pub name: String,
}

#[derive(Debug)]
pub struct Inode {
    pub core: InodeCore,
    /// This MDS is authoritative for the inode itself.
    pub auth: bool,
    /// Authority of the subtree below this inode.
    pub dir_auth: DirAuth,
    pub version: u64,
    pub popularity: f64,
    /// Replica holders; maintained only on the authority and never
    /// containing the authority itself.
    pub cached_by: BTreeSet<MdsId>,
    pub dist: InodeDist,
    /// Clients with this inode open for write (multiset).
    pub open_write: BTreeMap<ClientId, u32>,
    pub parent: Option<ParentLink>,
    pub dir: Option<Dir>,
    pub dirty: bool,
    /// Version of the parent dir when this inode was linked.
    pub parent_dir_version: u64,

    /// Auth pins held directly on this inode.
    pub auth_pins: u32,

    // Sync/lock acquisition bookkeeping (authority side).
    pub sync_waiting_for_ack: BTreeSet<MdsId>,
    pub sync_replica_wantback: bool,
    /// Soft operations currently running under the held sync.
    pub sync_active_count: u32,
    /// Release verdict waiting for the active count to drain.
    pub sync_release_pending: bool,
    pub lock_waiting_for_ack: BTreeSet<MdsId>,
    pub lock_active_count: u32,

    // Replica-side client fan-out bookkeeping.
    pub client_wait_for_sync: BTreeMap<ClientId, u32>,
    /// Parked authority sync request while clients drain: the asker.
    pub pending_sync_request: Option<MdsId>,

    pins: BTreeMap<PinReason, u32>,
    waiters: Vec<(InodeWait, Continuation)>,
}

impl Inode {
    #[must_use]
    pub fn new(core: InodeCore) -> Self {
        Self {
            core,
            auth: true,
            dir_auth: DirAuth::Parent,
            version: 0,
            popularity: 0.0,
            cached_by: BTreeSet::new(),
            dist: InodeDist::empty(),
            open_write: BTreeMap::new(),
            parent: None,
            dir: None,
            dirty: false,
            parent_dir_version: 0,
            auth_pins: 0,
            sync_waiting_for_ack: BTreeSet::new(),
            sync_replica_wantback: false,
            sync_active_count: 0,
            sync_release_pending: false,
            lock_waiting_for_ack: BTreeSet::new(),
            lock_active_count: 0,
            client_wait_for_sync: BTreeMap::new(),
            pending_sync_request: None,
            pins: BTreeMap::new(),
            waiters: Vec::new(),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.core.ino
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.core.is_dir()
    }

    #[must_use]
    pub fn dir_is_hashed(&self) -> bool {
        self.core.kind.is_hashed()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    // ── dist-state shorthands ──────────────────────────────────────────

    #[must_use]
    pub fn is_syncbyme(&self) -> bool {
        self.dist.contains(InodeDist::SYNCBYME)
    }

    #[must_use]
    pub fn is_syncbyauth(&self) -> bool {
        self.dist.contains(InodeDist::SYNCBYAUTH)
    }

    #[must_use]
    pub fn is_presync(&self) -> bool {
        self.dist.contains(InodeDist::PRESYNC)
    }

    #[must_use]
    pub fn is_lockbyme(&self) -> bool {
        self.dist.contains(InodeDist::LOCKBYME)
    }

    #[must_use]
    pub fn is_lockbyauth(&self) -> bool {
        self.dist.contains(InodeDist::LOCKBYAUTH)
    }

    #[must_use]
    pub fn is_prelock(&self) -> bool {
        self.dist.contains(InodeDist::PRELOCK)
    }

    #[must_use]
    pub fn is_softasync(&self) -> bool {
        self.dist.contains(InodeDist::SOFTASYNC)
    }

    #[must_use]
    pub fn is_waitonunsync(&self) -> bool {
        self.dist.contains(InodeDist::WAITONUNSYNC)
    }

    #[must_use]
    pub fn is_waitonunlock(&self) -> bool {
        self.dist.contains(InodeDist::WAITONUNLOCK)
    }

    #[must_use]
    pub fn is_open_write(&self) -> bool {
        !self.open_write.is_empty()
    }

    pub fn open_write_add(&mut self, client: ClientId) {
        *self.open_write.entry(client).or_insert(0) += 1;
    }

    pub fn open_write_remove(&mut self, client: ClientId) {
        if let Some(n) = self.open_write.get_mut(&client) {
            *n -= 1;
            if *n == 0 {
                self.open_write.remove(&client);
            }
        }
    }

    // ── pins ───────────────────────────────────────────────────────────

    pub fn pin(&mut self, reason: PinReason) {
        *self.pins.entry(reason).or_insert(0) += 1;
    }

    pub fn unpin(&mut self, reason: PinReason) {
        let n = self
            .pins
            .get_mut(&reason)
            .unwrap_or_else(|| panic!("unpin {reason:?} on {} without pin", self.core.ino));
        *n -= 1;
        if *n == 0 {
            self.pins.remove(&reason);
        }
    }

    #[must_use]
    pub fn is_pinned_by(&self, reason: PinReason) -> bool {
        self.pins.contains_key(&reason)
    }

    #[must_use]
    pub fn is_expireable(&self) -> bool {
        self.pins.is_empty()
    }

    #[must_use]
    pub fn pin_set(&self) -> &BTreeMap<PinReason, u32> {
        &self.pins
    }

    // ── waiters ────────────────────────────────────────────────────────

    /// Park a continuation on an inode event. The caller pins
    /// `PinReason::Waiter` alongside.
    pub fn add_waiter(&mut self, wait: InodeWait, c: Continuation) {
        self.waiters.push((wait, c));
    }

    /// Take all continuations parked on `wait`, preserving insertion
    /// order. The caller unpins one `Waiter` per continuation returned.
    pub fn take_waiting(&mut self, wait: &InodeWait) -> Vec<Continuation> {
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

    /// Take every parked continuation regardless of event (migration
    /// hand-off).
    pub fn take_all_waiting(&mut self) -> Vec<Continuation> {
        self.waiters.drain(..).map(|(_, c)| c).collect()
    }

    #[must_use]
    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    #[must_use]
    pub fn count_waiting(&self, wait: &InodeWait) -> usize {
        self.waiters.iter().filter(|(w, _)| w == wait).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_msg::Envelope;
    use sfs_types::InodeCore;

    fn inode(n: u64) -> Inode {
        Inode::new(InodeCore::new(InodeNumber(n)))
    }

    #[test]
    fn pins_are_a_multiset() {
        let mut in_ = inode(1);
        assert!(in_.is_expireable());
        in_.pin(PinReason::Dirty);
        in_.pin(PinReason::Dirty);
        in_.unpin(PinReason::Dirty);
        assert!(!in_.is_expireable());
        in_.unpin(PinReason::Dirty);
        assert!(in_.is_expireable());
    }

    #[test]
    #[should_panic(expected = "without pin")]
    fn unbalanced_unpin_aborts() {
        let mut in_ = inode(2);
        in_.unpin(PinReason::Import);
    }

    #[test]
    fn waiters_fire_in_insertion_order() {
        let mut in_ = inode(3);
        let mk = |to: u32| {
            Continuation::RetryMessage(Envelope::cache(
                MdsId(0),
                MdsId(to),
                sfs_msg::CacheMessage::InodeGetReplica {
                    ino: InodeNumber(3),
                },
            ))
        };
        in_.add_waiter(InodeWait::Sync, mk(1));
        in_.add_waiter(InodeWait::Unsync, mk(2));
        in_.add_waiter(InodeWait::Sync, mk(3));

        let taken = in_.take_waiting(&InodeWait::Sync);
        assert_eq!(taken.len(), 2);
        assert!(in_.has_waiters());
        let rest = in_.take_waiting(&InodeWait::Unsync);
        assert_eq!(rest.len(), 1);
        assert!(!in_.has_waiters());
    }

    #[test]
    fn open_write_counts_per_client() {
        let mut in_ = inode(4);
        in_.open_write_add(ClientId(9));
        in_.open_write_add(ClientId(9));
        in_.open_write_remove(ClientId(9));
        assert!(in_.is_open_write());
        in_.open_write_remove(ClientId(9));
        assert!(!in_.is_open_write());
    }
}
