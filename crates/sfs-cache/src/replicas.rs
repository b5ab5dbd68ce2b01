//! Replica bookkeeping: basic-state updates, dir-rep updates, expiry.
//!
//! `cached_by` is authoritative only on the owner; while it is non-empty
//! the owner keeps the inode pinned so replicas always have somewhere to
//! send their expire. Replica-side copies of `cached_by` are advisory and
//! never pin.

use crate::inode::{InodeWait, PinReason};
use crate::MdCache;
use sfs_msg::{CacheMessage, InodeBasicState};
use sfs_types::{DirRep, InodeNumber, MdsId};
use std::collections::BTreeSet;
use tracing::debug;

impl MdCache {
    /// Re-derive the replica pin: held iff this node is the authority and
    /// someone still caches the inode. Call after any mutation of `auth`
    /// or `cached_by`.
    pub(crate) fn fix_cached_pin(&mut self, ino: InodeNumber) {
        let in_ = self.inode(ino);
        let should = in_.auth && !in_.cached_by.is_empty();
        let held = in_.is_pinned_by(PinReason::Cached);
        if should && !held {
            self.pin(ino, PinReason::Cached);
        } else if !should && held {
            self.unpin(ino, PinReason::Cached);
        }
    }

    pub(crate) fn cached_by_add(&mut self, ino: InodeNumber, who: MdsId) {
        assert_ne!(who, self.whoami(), "authority caching itself");
        self.inode_mut(ino).cached_by.insert(who);
        self.fix_cached_pin(ino);
    }

    pub(crate) fn cached_by_remove(&mut self, ino: InodeNumber, who: MdsId) {
        self.inode_mut(ino).cached_by.remove(&who);
        self.fix_cached_pin(ino);
    }

    pub(crate) fn cached_by_clear(&mut self, ino: InodeNumber) {
        self.inode_mut(ino).cached_by.clear();
        self.fix_cached_pin(ino);
    }

    pub(crate) fn basic_state(&self, ino: InodeNumber) -> InodeBasicState {
        let in_ = self.inode(ino);
        InodeBasicState {
            core: in_.core,
            dir_auth: in_.dir_auth,
            cached_by: in_.cached_by.clone(),
        }
    }

    /// Broadcast the inode's basic state to every replica holder. The
    /// embedding server calls this after authoritative attribute changes.
    pub fn send_inode_updates(&mut self, ino: InodeNumber) {
        let whoami = self.whoami();
        let targets: Vec<MdsId> = self.inode(ino).cached_by.iter().copied().collect();
        let state = self.basic_state(ino);
        for to in targets {
            assert_ne!(to, whoami);
            debug!(target: "sfs::replicas", event = "inode_update_send", %ino, %to);
            self.send_cache_msg(to, CacheMessage::InodeUpdate(state.clone()));
        }
    }

    /// Broadcast the dir replication policy, optionally skipping one peer.
    pub fn send_dir_updates(&mut self, ino: InodeNumber, except: Option<MdsId>) {
        let whoami = self.whoami();
        let targets: Vec<MdsId> = self.inode(ino).cached_by.iter().copied().collect();
        let (dir_rep, dir_rep_by) = {
            let dir = self.dir(ino);
            (dir.dir_rep, dir.dir_rep_by.clone())
        };
        for to in targets {
            if to == whoami || Some(to) == except {
                continue;
            }
            self.send_cache_msg(
                to,
                CacheMessage::DirUpdate {
                    ino,
                    dir_rep,
                    dir_rep_by: dir_rep_by.clone(),
                },
            );
        }
    }

    pub(crate) fn handle_inode_update(&mut self, from: MdsId, state: InodeBasicState) {
        let ino = state.core.ino;
        if !self.inodes.contains_key(&ino) {
            // Evicted since the authority last heard from us; a soft
            // expire straightens out their cached_by.
            debug!(target: "sfs::replicas", event = "update_unknown", %ino);
            let whoami = self.whoami();
            self.send_cache_msg(
                from,
                CacheMessage::InodeExpire {
                    ino,
                    from: whoami,
                    soft: true,
                    hops: 0,
                },
            );
            return;
        }

        if self.inode_authority(ino) == self.whoami() {
            debug!(target: "sfs::replicas", event = "update_to_authority", %ino);
            return;
        }

        assert!(
            !self.inode_is_frozen(ino),
            "basic-state update against a frozen replica"
        );

        // Never let a remote update flip our view of local subtree
        // ownership; a stale dir_auth in flight during migration would.
        let whoami = self.whoami();
        let old_dir_auth = self.inode(ino).dir_auth;
        let was_ours = self.dir_authority(ino) == whoami;
        {
            let in_ = self.inode_mut(ino);
            in_.core = state.core;
            in_.dir_auth = state.dir_auth;
            in_.cached_by = state.cached_by;
        }
        let is_ours = self.dir_authority(ino) == whoami;
        if was_ours != is_ours {
            self.inode_mut(ino).dir_auth = old_dir_auth;
        }
        self.fix_cached_pin(ino);
        debug!(target: "sfs::replicas", event = "update_applied", %ino);
    }

    pub(crate) fn handle_dir_update(
        &mut self,
        ino: InodeNumber,
        dir_rep: DirRep,
        dir_rep_by: BTreeSet<MdsId>,
    ) {
        if !self.inodes.contains_key(&ino) {
            debug!(target: "sfs::replicas", event = "dir_update_unknown", %ino);
            return;
        }
        if self.inode(ino).dir.is_none() {
            debug!(target: "sfs::replicas", event = "dir_update_no_dir", %ino);
            return;
        }
        let dir = self.dir_mut(ino);
        dir.dir_rep = dir_rep;
        dir.dir_rep_by = dir_rep_by;
    }

    pub(crate) fn handle_inode_expire(
        &mut self,
        ino: InodeNumber,
        origin: MdsId,
        soft: bool,
        hops: u32,
    ) {
        let whoami = self.whoami();

        let known = self.inodes.contains_key(&ino);
        if known && self.inode_authority(ino) == whoami {
            if !self.inode(ino).cached_by.contains(&origin) {
                debug!(target: "sfs::replicas", event = "expire_not_cached", %ino, %origin);
                return;
            }
            debug!(target: "sfs::replicas", event = "expire", %ino, %origin);
            self.cached_by_remove(ino, origin);
            return;
        }

        // Not ours (or not here at all): pass it along the ring, unless
        // it was fire-and-forget.
        if soft {
            debug!(target: "sfs::replicas", event = "expire_soft_drop", %ino);
            return;
        }
        if hops > self.cluster().num_mds() {
            debug!(target: "sfs::replicas", event = "expire_hop_limit", %ino, hops);
            return;
        }
        let next = self.cluster().next(whoami);
        debug!(target: "sfs::replicas", event = "expire_forward", %ino, %next, hops);
        self.counters.iupfw += 1;
        self.send_cache_msg(
            next,
            CacheMessage::InodeExpire {
                ino,
                from: origin,
                soft,
                hops: hops + 1,
            },
        );
    }

    pub(crate) fn handle_inode_get_replica(&mut self, from: MdsId, ino: InodeNumber) {
        assert!(
            self.inodes.contains_key(&ino),
            "get_replica for an inode we don't have"
        );
        debug!(target: "sfs::replicas", event = "get_replica", %ino, %from);
        self.cached_by_add(ino, from);
        self.send_cache_msg(from, CacheMessage::InodeGetReplicaAck { ino });
    }

    pub(crate) fn handle_inode_get_replica_ack(&mut self, ino: InodeNumber) {
        assert!(self.inodes.contains_key(&ino));
        debug!(target: "sfs::replicas", event = "get_replica_ack", %ino);
        self.fire_inode_waiters(ino, &InodeWait::GetReplica);
    }
}
