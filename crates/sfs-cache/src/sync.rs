//! Soft-metadata coherence (the sync regime).
//!
//! Soft metadata (size, times) has two per-inode regimes. Normal: every
//! replica may read freely and writes funnel through a sync held by the
//! authority. Softasync: replicas may apply monotonic writes locally, and
//! it is *reads* that need a sync to collect the latest values. Sync
//! acquisition is two-phase over `cached_by`; replicas with client
//! write-opens fan the request out to the clients before acking.

use crate::dir::DirWait;
use crate::inode::{InodeDist, InodeWait, PinReason};
use crate::waiter::Continuation;
use crate::MdCache;
use sfs_msg::{CacheMessage, Envelope};
use sfs_types::{ClientId, InodeNumber, MdsId};
use tracing::debug;

impl MdCache {
    fn sticky_sync_for(&self, ino: InodeNumber) -> bool {
        if self.inode(ino).is_softasync() {
            self.sticky_sync_softasync
        } else {
            self.sticky_sync_normal
        }
    }

    fn park_on_unfreeze(&mut self, ino: InodeNumber, req: Option<&Envelope>) {
        if let (Some(req), Some(link)) = (req, self.inode(ino).parent.clone()) {
            self.add_dir_waiter(
                link.dir_ino,
                DirWait::Unfreeze,
                Continuation::RetryMessage(req.clone()),
            );
        }
    }

    fn forward_to_authority(&mut self, ino: InodeNumber, req: Option<&Envelope>) {
        let auth = self.inode_authority(ino);
        assert_ne!(auth, self.whoami());
        if let Some(req) = req {
            self.send(req.clone().forwarded_to(auth));
        }
    }

    /// Begin a soft read. True means proceed; false means the request was
    /// parked or forwarded.
    pub fn read_soft_start(&mut self, ino: InodeNumber, req: Option<&Envelope>) -> bool {
        if !self.read_hard_try(ino, req) {
            return false;
        }
        if self.inode_is_frozen(ino) {
            debug!(target: "sfs::sync", event = "read_soft_frozen", %ino);
            self.park_on_unfreeze(ino, req);
            return false;
        }

        let in_ = self.inode(ino);
        if in_.is_softasync() {
            if in_.auth {
                if in_.is_syncbyme() || in_.is_lockbyme() || in_.cached_by.is_empty() {
                    return self.soft_op_begun(ino);
                }
            } else {
                // Replica reads under softasync chase the freshest copy.
                debug!(target: "sfs::sync", event = "read_soft_fw", %ino);
                self.forward_to_authority(ino, req);
                return false;
            }
        } else if !in_.is_syncbyauth() {
            return self.soft_op_begun(ino);
        }

        self.wait_for_sync(ino, req)
    }

    /// Begin a soft write. Symmetric with reads: softasync replicas write
    /// locally, normal replicas funnel through the authority.
    pub fn write_soft_start(&mut self, ino: InodeNumber, req: Option<&Envelope>) -> bool {
        if !self.read_hard_try(ino, req) {
            return false;
        }
        if self.inode_is_frozen(ino) {
            debug!(target: "sfs::sync", event = "write_soft_frozen", %ino);
            self.park_on_unfreeze(ino, req);
            return false;
        }

        let in_ = self.inode(ino);
        if in_.is_softasync() {
            if !in_.is_syncbyauth() {
                // Monotonic updates apply anywhere without coordination.
                return self.soft_op_begun(ino);
            }
        } else if in_.auth {
            if in_.is_syncbyme() || in_.is_lockbyme() || in_.cached_by.is_empty() {
                return self.soft_op_begun(ino);
            }
        } else {
            debug!(target: "sfs::sync", event = "write_soft_fw", %ino);
            self.forward_to_authority(ino, req);
            return false;
        }

        self.wait_for_sync(ino, req)
    }

    fn soft_op_begun(&mut self, ino: InodeNumber) -> bool {
        self.inode_mut(ino).sync_active_count += 1;
        true
    }

    /// End a soft read begun with [`Self::read_soft_start`]. A release
    /// verdict parked behind in-flight operations applies once the last
    /// one finishes.
    pub fn read_soft_finish(&mut self, ino: InodeNumber) {
        self.soft_op_done(ino);
    }

    /// End a soft write begun with [`Self::write_soft_start`].
    pub fn write_soft_finish(&mut self, ino: InodeNumber) {
        self.soft_op_done(ino);
    }

    fn soft_op_done(&mut self, ino: InodeNumber) {
        let in_ = self.inode_mut(ino);
        assert!(in_.sync_active_count > 0, "soft finish without start");
        in_.sync_active_count -= 1;
        let release = in_.sync_active_count == 0 && in_.sync_release_pending;
        if release {
            in_.sync_release_pending = false;
            if self.inode(ino).is_syncbyme() {
                debug!(target: "sfs::sync", event = "sync_release_drained", %ino);
                self.sync_release(ino);
            }
        }
    }

    /// Common tail: this node needs the sync (or its release) to proceed.
    fn wait_for_sync(&mut self, ino: InodeNumber, req: Option<&Envelope>) -> bool {
        if !self.can_auth_pin_inode(ino) {
            debug!(target: "sfs::sync", event = "wait_authpinnable", %ino);
            if let Some(req) = req {
                self.add_inode_waiter(
                    ino,
                    InodeWait::AuthPinnable,
                    Continuation::RetryMessage(req.clone()),
                );
            }
            return false;
        }

        if self.inode(ino).auth {
            if let Some(req) = req {
                self.add_inode_waiter(ino, InodeWait::Sync, Continuation::RetryMessage(req.clone()));
            }
            if !self.inode(ino).is_presync() {
                self.sync_start(ino);
            }
        } else {
            if let Some(req) = req {
                self.add_inode_waiter(
                    ino,
                    InodeWait::Unsync,
                    Continuation::RetryMessage(req.clone()),
                );
            }
            assert!(self.inode(ino).is_syncbyauth());
            if !self.inode(ino).is_waitonunsync() {
                self.sync_wait(ino);
            }
        }
        false
    }

    // ── authority side ─────────────────────────────────────────────────

    /// Two-phase sync acquisition across every replica holder.
    pub(crate) fn sync_start(&mut self, ino: InodeNumber) {
        let whoami = self.whoami();
        {
            let in_ = self.inode_mut(ino);
            assert!(in_.auth);
            assert!(!in_.is_presync());
            assert!(!in_.is_syncbyme());
            assert!(!in_.cached_by.is_empty(), "sync_start with no replicas");
            in_.sync_waiting_for_ack = in_.cached_by.clone();
            in_.dist |= InodeDist::PRESYNC;
            in_.sync_replica_wantback = false;
        }
        debug!(target: "sfs::sync", event = "sync_start", %ino);
        self.pin(ino, PinReason::Presync);
        self.auth_pin_inode(ino);

        let targets: Vec<MdsId> = self.inode(ino).cached_by.iter().copied().collect();
        for to in targets {
            self.send_cache_msg(to, CacheMessage::InodeSyncStart { ino, asker: whoami });
        }
    }

    pub(crate) fn sync_release(&mut self, ino: InodeNumber) {
        {
            let in_ = self.inode_mut(ino);
            assert!(in_.is_syncbyme());
            assert!(in_.auth);
            in_.dist -= InodeDist::SYNCBYME;
            in_.sync_release_pending = false;
        }
        debug!(target: "sfs::sync", event = "sync_release", %ino);
        self.auth_unpin_inode(ino);

        let targets: Vec<MdsId> = self.inode(ino).cached_by.iter().copied().collect();
        for to in targets {
            self.send_cache_msg(to, CacheMessage::InodeSyncRelease { ino });
        }
    }

    // ── replica side ───────────────────────────────────────────────────

    /// Mark that we're parked until the authority releases; under sticky
    /// the authority won't release on its own, so recall it.
    fn sync_wait(&mut self, ino: InodeNumber) {
        let auth = self.inode_authority(ino);
        {
            let in_ = self.inode_mut(ino);
            assert!(!in_.auth);
            assert!(in_.is_syncbyauth());
            assert!(!in_.is_waitonunsync());
            in_.dist |= InodeDist::WAITONUNSYNC;
        }
        self.pin(ino, PinReason::WaitOnUnsync);
        debug!(target: "sfs::sync", event = "sync_wait", %ino, %auth);

        if self.sticky_sync_for(ino) {
            self.send_cache_msg(auth, CacheMessage::InodeSyncRecall { ino });
        }
    }

    pub(crate) fn handle_inode_sync_start(&mut self, ino: InodeNumber, asker: MdsId) {
        if !self.inodes.contains_key(&ino) {
            // Raced an eviction; let the authority trim its cached_by.
            debug!(target: "sfs::sync", event = "sync_start_unknown", %ino);
            self.send_cache_msg(
                asker,
                CacheMessage::InodeSyncAck {
                    ino,
                    did_have: false,
                    wantback: false,
                },
            );
            return;
        }

        assert!(!self.inode(ino).auth, "sync start against the authority");

        if self.inode(ino).is_open_write() {
            // Clients hold dirty soft state; collect it before acking.
            let clients: Vec<ClientId> =
                self.inode(ino).open_write.keys().copied().collect();
            debug!(target: "sfs::sync", event = "sync_clients", %ino, n = clients.len());
            let in_ = self.inode_mut(ino);
            in_.client_wait_for_sync = in_.open_write.clone();
            in_.pending_sync_request = Some(asker);
            let whoami = self.whoami();
            for client in clients {
                let env = Envelope::to_client(
                    whoami,
                    client,
                    CacheMessage::InodeSyncStart { ino, asker: whoami },
                );
                self.send(env);
            }
        } else {
            self.inode_sync_ack(ino, asker, false);
        }
    }

    fn inode_sync_ack(&mut self, ino: InodeNumber, asker: MdsId, wantback: bool) {
        debug!(target: "sfs::sync", event = "sync_ack", %ino, %asker, wantback);
        self.inode_mut(ino).dist |= InodeDist::SYNCBYAUTH;
        self.send_cache_msg(
            asker,
            CacheMessage::InodeSyncAck {
                ino,
                did_have: true,
                wantback,
            },
        );
    }

    pub(crate) fn handle_client_sync_ack(&mut self, ino: InodeNumber, client: ClientId) {
        let in_ = self.inode_mut(ino);
        let n = in_
            .client_wait_for_sync
            .get_mut(&client)
            .expect("client ack without outstanding sync");
        *n -= 1;
        if *n == 0 {
            in_.client_wait_for_sync.remove(&client);
        }
        if in_.client_wait_for_sync.is_empty() {
            let asker = in_
                .pending_sync_request
                .take()
                .expect("clients drained with no parked request");
            // The clients gave their state back; so should we.
            self.inode_sync_ack(ino, asker, true);
        } else {
            debug!(target: "sfs::sync", event = "sync_clients_pending", %ino);
        }
    }

    pub(crate) fn handle_inode_sync_ack(
        &mut self,
        ino: InodeNumber,
        from: MdsId,
        did_have: bool,
        wantback: bool,
    ) {
        {
            let in_ = self.inode_mut(ino);
            assert!(in_.auth);
            assert!(in_.is_presync());
            in_.sync_waiting_for_ack.remove(&from);
            if wantback {
                in_.sync_replica_wantback = true;
            }
        }
        if !did_have {
            self.cached_by_remove(ino, from);
        }

        if !self.inode(ino).sync_waiting_for_ack.is_empty() {
            debug!(target: "sfs::sync", event = "sync_ack_partial", %ino, %from);
            return;
        }

        debug!(target: "sfs::sync", event = "sync_acquired", %ino);
        let fired = {
            let in_ = self.inode_mut(ino);
            in_.dist -= InodeDist::PRESYNC;
            in_.dist |= InodeDist::SYNCBYME;
            in_.count_waiting(&InodeWait::Sync) > 0
        };
        self.unpin(ino, PinReason::Presync);

        // Let the parked operations run under the sync before deciding
        // whether to keep it.
        self.fire_inode_waiters(ino, &InodeWait::Sync);
        self.drain_runq();

        if !self.inode(ino).is_syncbyme() {
            // A waiter released it already.
            return;
        }
        if self.inode_is_freezing(ino) || self.inode_is_frozen(ino) {
            // A migration is waiting on our auth pin; the woken
            // operations will chase the subtree instead.
            debug!(target: "sfs::sync", event = "sync_drop_for_freeze", %ino);
            self.sync_release(ino);
        } else if self.inode(ino).sync_replica_wantback || !self.sticky_sync_for(ino) {
            // The grant should go, but not out from under operations
            // still re-driving toward it.
            if fired || self.inode(ino).sync_active_count > 0 {
                debug!(target: "sfs::sync", event = "sync_release_deferred", %ino);
                self.inode_mut(ino).sync_release_pending = true;
            } else {
                self.sync_release(ino);
            }
        } else {
            debug!(target: "sfs::sync", event = "sync_sticky_keep", %ino);
        }
    }

    pub(crate) fn handle_inode_sync_release(&mut self, ino: InodeNumber) {
        if !self.inodes.contains_key(&ino) {
            debug!(target: "sfs::sync", event = "sync_release_unknown", %ino);
            return;
        }
        assert!(
            self.inode(ino).is_syncbyauth(),
            "sync release on a replica that was never synced"
        );
        assert!(!self.inode(ino).auth);

        debug!(target: "sfs::sync", event = "sync_released", %ino);
        self.inode_mut(ino).dist -= InodeDist::SYNCBYAUTH;

        if self.inode(ino).is_waitonunsync() {
            self.inode_mut(ino).dist -= InodeDist::WAITONUNSYNC;
            self.unpin(ino, PinReason::WaitOnUnsync);
            self.fire_inode_waiters(ino, &InodeWait::Unsync);
        }

        if self.inode(ino).is_open_write() {
            let whoami = self.whoami();
            let clients: Vec<ClientId> =
                self.inode(ino).open_write.keys().copied().collect();
            for client in clients {
                let env = Envelope::to_client(
                    whoami,
                    client,
                    CacheMessage::InodeSyncRelease { ino },
                );
                self.send(env);
            }
        }
    }

    pub(crate) fn handle_inode_sync_recall(&mut self, ino: InodeNumber) {
        if !self.inodes.contains_key(&ino) {
            debug!(target: "sfs::sync", event = "sync_recall_unknown", %ino);
            return;
        }
        if !self.inode(ino).is_syncbyme() {
            debug!(target: "sfs::sync", event = "sync_recall_not_held", %ino);
            return;
        }
        assert!(self.inode(ino).auth);
        debug!(target: "sfs::sync", event = "sync_recalled", %ino);
        self.sync_release(ino);
    }
}
