//! Hard-metadata coherence (the lock regime).
//!
//! Hard metadata (owner, mode) only changes under a lock the authority
//! acquires two-phase across `cached_by`. Replicas merely observe
//! `LOCKBYAUTH` and stall reads until release; writes always funnel to
//! the authority. A held lock subsumes a sync for read purposes.

use crate::dir::DirWait;
use crate::inode::{InodeDist, InodeWait, PinReason};
use crate::waiter::Continuation;
use crate::MdCache;
use sfs_msg::{CacheMessage, Envelope};
use sfs_types::{InodeNumber, MdsId};
use tracing::debug;

impl MdCache {
    /// Read access to hard metadata. Free on the authority; a replica only
    /// stalls while the authority holds the lock.
    pub fn read_hard_try(&mut self, ino: InodeNumber, req: Option<&Envelope>) -> bool {
        if self.inode(ino).auth {
            return true;
        }
        if !self.inode(ino).is_lockbyauth() {
            return true;
        }
        debug!(target: "sfs::lock", event = "read_hard_wait", %ino);
        if let Some(req) = req {
            self.add_inode_waiter(ino, InodeWait::Unlock, Continuation::RetryMessage(req.clone()));
        }
        if !self.inode(ino).is_waitonunlock() {
            self.inode_lock_wait(ino);
        }
        false
    }

    /// Begin a hard write. Only the authority can initiate the lock;
    /// replicas forward the request.
    pub fn write_hard_start(&mut self, ino: InodeNumber, req: Option<&Envelope>) -> bool {
        if self.inode_is_frozen(ino) {
            debug!(target: "sfs::lock", event = "write_hard_frozen", %ino);
            if let (Some(req), Some(link)) = (req, self.inode(ino).parent.clone()) {
                self.add_dir_waiter(
                    link.dir_ino,
                    DirWait::Unfreeze,
                    Continuation::RetryMessage(req.clone()),
                );
            }
            return false;
        }

        if !self.inode(ino).auth {
            let auth = self.inode_authority(ino);
            debug!(target: "sfs::lock", event = "write_hard_fw", %ino, %auth);
            assert_ne!(auth, self.whoami());
            if let Some(req) = req {
                self.send(req.clone().forwarded_to(auth));
            }
            return false;
        }

        if self.inode(ino).is_lockbyme() || self.inode(ino).cached_by.is_empty() {
            let in_ = self.inode_mut(ino);
            in_.lock_active_count += 1;
            return true;
        }

        if !self.can_auth_pin_inode(ino) {
            debug!(target: "sfs::lock", event = "wait_authpinnable", %ino);
            if let Some(req) = req {
                self.add_inode_waiter(
                    ino,
                    InodeWait::AuthPinnable,
                    Continuation::RetryMessage(req.clone()),
                );
            }
            return false;
        }

        if let Some(req) = req {
            self.add_inode_waiter(ino, InodeWait::Lock, Continuation::RetryMessage(req.clone()));
        }
        self.inode_mut(ino).lock_active_count += 1;

        if !self.inode(ino).is_prelock() {
            self.inode_lock_start(ino);
        }
        false
    }

    /// End a hard write; the lock drops once the last writer is done,
    /// unless sticky retention keeps it.
    pub fn write_hard_finish(&mut self, ino: InodeNumber) {
        let sticky = self.sticky_lock;
        let in_ = self.inode_mut(ino);
        assert!(in_.lock_active_count > 0);
        in_.lock_active_count -= 1;
        let release = in_.lock_active_count == 0 && in_.is_lockbyme() && !sticky;
        debug!(target: "sfs::lock", event = "write_hard_finish", %ino, release);
        if release {
            self.inode_lock_release(ino);
        }
    }

    // ── authority side ─────────────────────────────────────────────────

    fn inode_lock_start(&mut self, ino: InodeNumber) {
        let whoami = self.whoami();
        {
            let in_ = self.inode_mut(ino);
            assert!(in_.auth);
            assert!(!in_.is_prelock());
            assert!(!in_.is_lockbyme());
            assert!(!in_.is_lockbyauth());
            assert!(!in_.cached_by.is_empty(), "lock_start with no replicas");
            in_.lock_waiting_for_ack = in_.cached_by.clone();
            in_.dist |= InodeDist::PRELOCK;
        }
        debug!(target: "sfs::lock", event = "lock_start", %ino);
        self.pin(ino, PinReason::Prelock);
        self.auth_pin_inode(ino);

        let targets: Vec<MdsId> = self.inode(ino).cached_by.iter().copied().collect();
        for to in targets {
            self.send_cache_msg(to, CacheMessage::InodeLockStart { ino, asker: whoami });
        }
    }

    pub(crate) fn inode_lock_release(&mut self, ino: InodeNumber) {
        {
            let in_ = self.inode_mut(ino);
            assert!(in_.is_lockbyme());
            assert!(in_.auth);
            in_.dist -= InodeDist::LOCKBYME;
        }
        debug!(target: "sfs::lock", event = "lock_release", %ino);
        self.auth_unpin_inode(ino);

        let targets: Vec<MdsId> = self.inode(ino).cached_by.iter().copied().collect();
        for to in targets {
            self.send_cache_msg(to, CacheMessage::InodeLockRelease { ino });
        }
    }

    // ── replica side ───────────────────────────────────────────────────

    fn inode_lock_wait(&mut self, ino: InodeNumber) {
        let in_ = self.inode_mut(ino);
        assert!(!in_.auth);
        assert!(in_.is_lockbyauth());
        in_.dist |= InodeDist::WAITONUNLOCK;
        self.pin(ino, PinReason::WaitOnUnlock);
    }

    pub(crate) fn handle_inode_lock_start(&mut self, ino: InodeNumber, asker: MdsId) {
        if !self.inodes.contains_key(&ino) {
            debug!(target: "sfs::lock", event = "lock_start_unknown", %ino);
            self.send_cache_msg(
                asker,
                CacheMessage::InodeLockAck {
                    ino,
                    did_have: false,
                },
            );
            return;
        }

        assert!(!self.inode(ino).auth, "lock start against the authority");
        debug!(target: "sfs::lock", event = "locked_by_auth", %ino);
        self.inode_mut(ino).dist |= InodeDist::LOCKBYAUTH;
        self.send_cache_msg(
            asker,
            CacheMessage::InodeLockAck {
                ino,
                did_have: true,
            },
        );
    }

    pub(crate) fn handle_inode_lock_ack(&mut self, ino: InodeNumber, from: MdsId, did_have: bool) {
        {
            let in_ = self.inode_mut(ino);
            assert!(in_.auth);
            assert!(in_.is_prelock());
            in_.lock_waiting_for_ack.remove(&from);
        }
        if !did_have {
            self.cached_by_remove(ino, from);
        }

        if !self.inode(ino).lock_waiting_for_ack.is_empty() {
            debug!(target: "sfs::lock", event = "lock_ack_partial", %ino, %from);
            return;
        }

        debug!(target: "sfs::lock", event = "lock_acquired", %ino);
        {
            let in_ = self.inode_mut(ino);
            in_.dist -= InodeDist::PRELOCK;
            in_.dist |= InodeDist::LOCKBYME;
        }
        self.unpin(ino, PinReason::Prelock);

        // Each fired waiter re-enters write_hard_start and re-counts
        // itself; drop the provisional counts taken at park time.
        let fired = {
            let taken = self.inode_mut(ino).take_waiting(&InodeWait::Lock);
            let n = taken.len() as u32;
            for c in taken {
                self.unpin(ino, PinReason::Waiter);
                self.runq.push_back(c);
            }
            n
        };
        let in_ = self.inode_mut(ino);
        assert!(in_.lock_active_count >= fired);
        in_.lock_active_count -= fired;
    }

    pub(crate) fn handle_inode_lock_release(&mut self, ino: InodeNumber) {
        if !self.inodes.contains_key(&ino) {
            debug!(target: "sfs::lock", event = "lock_release_unknown", %ino);
            return;
        }
        assert!(
            self.inode(ino).is_lockbyauth(),
            "lock release on a replica that was never locked"
        );
        assert!(!self.inode(ino).auth);

        debug!(target: "sfs::lock", event = "lock_released", %ino);
        self.inode_mut(ino).dist -= InodeDist::LOCKBYAUTH;

        if self.inode(ino).is_waitonunlock() {
            self.inode_mut(ino).dist -= InodeDist::WAITONUNLOCK;
            self.unpin(ino, PinReason::WaitOnUnlock);
            self.fire_inode_waiters(ino, &InodeWait::Unlock);
        }
    }
}
