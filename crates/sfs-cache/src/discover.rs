//! Dentry discovery.
//!
//! One message type serves both directions: a request travels to the
//! dentry authority with an empty trace, accumulates one replica snapshot
//! per resolved segment (possibly crossing several MDSs), and comes back
//! to the asker, which installs the replicas and wakes whatever was parked
//! on the missing dentries. Installation is idempotent: a record for a
//! dentry we already have is skipped.

use crate::dir::DirWait;
use crate::inode::{Inode, InodeDist};
use crate::waiter::Continuation;
use crate::{MdCache, OnFail, Traversal};
use sfs_msg::{CacheMessage, Discover, DiscoverRecord, Envelope};
use sfs_types::{InodeNumber, MdsId};
use tracing::{debug, warn};

impl MdCache {
    pub(crate) fn handle_discover(&mut self, env: Envelope, dis: Discover) {
        if dis.asker == self.whoami() {
            self.discover_reply(env, dis);
        } else {
            self.discover_request(env, dis);
        }
    }

    fn make_record(&self, ino: InodeNumber) -> DiscoverRecord {
        let in_ = self.inode(ino);
        let (dir_rep, dir_rep_by) = match &in_.dir {
            Some(dir) => (dir.dir_rep, dir.dir_rep_by.clone()),
            None => (sfs_types::DirRep::None, Default::default()),
        };
        DiscoverRecord {
            core: in_.core,
            cached_by: in_.cached_by.clone(),
            dir_auth: in_.dir_auth,
            dir_rep,
            dir_rep_by,
            is_syncbyauth: in_.is_syncbyme(),
            is_softasync: in_.is_softasync(),
            is_lockbyauth: in_.is_lockbyme(),
        }
    }

    /// Build a replica from a received snapshot and register it. The
    /// caller links it into its parent before [`Self::replica_dir_setup`]
    /// opens the dir (authority resolution needs the parent link).
    fn install_replica(&mut self, rec: &DiscoverRecord) -> InodeNumber {
        let whoami = self.whoami();
        let ino = rec.core.ino;
        let mut in_ = Inode::new(rec.core);
        in_.auth = false;
        in_.dir_auth = rec.dir_auth;
        in_.cached_by = rec.cached_by.clone();
        in_.cached_by.insert(whoami);
        if rec.is_syncbyauth {
            in_.dist |= InodeDist::SYNCBYAUTH;
        }
        if rec.is_softasync {
            in_.dist |= InodeDist::SOFTASYNC;
        }
        if rec.is_lockbyauth {
            in_.dist |= InodeDist::LOCKBYAUTH;
        }
        self.add_inode(in_);
        ino
    }

    fn replica_dir_setup(&mut self, ino: InodeNumber, rec: &DiscoverRecord) {
        if !self.inode(ino).is_dir() {
            return;
        }
        self.open_dir(ino);
        assert!(!self.dir(ino).is_auth(), "replica dir opened authoritative");
        let dir = self.dir_mut(ino);
        dir.dir_rep = rec.dir_rep;
        dir.dir_rep_by = rec.dir_rep_by.clone();
    }

    // ── reply side (we are the asker) ──────────────────────────────────

    fn discover_reply(&mut self, env: Envelope, dis: Discover) {
        if dis.just_root {
            if self.root.is_some() {
                debug!(target: "sfs::discover", event = "root_reply_duplicate");
                self.opening_root = false;
                return;
            }
            debug!(target: "sfs::discover", event = "got_root");
            let rec = dis.trace[0].clone();
            let root_ino = self.install_replica(&rec);
            self.replica_dir_setup(root_ino, &rec);
            self.root = Some(root_ino);
            self.opening_root = false;

            let parked = std::mem::take(&mut self.waiting_for_root);
            for c in parked {
                self.runq.push_back(c);
            }
            return;
        }

        // Walk back to where the request started.
        let trav = match self.traverse(&dis.base_path, None, OnFail::Fail) {
            Traversal::Done(trace) => trace,
            other => {
                debug!(target: "sfs::discover", event = "reply_base_gone", ?other);
                return;
            }
        };
        let mut cur = *trav.last().expect("trace includes root");

        for (i, rec) in dis.trace.iter().enumerate() {
            let name = &dis.want[i];
            self.open_dir(cur);

            let existing = self.dir(cur).lookup(name).map(|d| d.ino);
            let next = if let Some(have) = existing {
                // Parallel discovers already installed it.
                debug!(target: "sfs::discover", event = "already_had", %name);
                have
            } else {
                if self.dentry_authority(cur, name) == self.whoami() {
                    // The trace names something that is ours but missing
                    // locally; the dir must be stale. Reload and retry.
                    warn!(target: "sfs::discover", event = "ours_but_missing", %name);
                    self.fetch_dir(cur, Continuation::RetryMessage(env));
                    return;
                }
                let ino = self.install_replica(rec);
                self.link_inode(cur, name.clone(), ino)
                    .expect("discover parent is a dir");
                self.replica_dir_setup(ino, rec);
                debug!(target: "sfs::discover", event = "assimilated", %ino, %name);
                ino
            };

            self.fire_dir_waiters(cur, &DirWait::Dentry(name.clone()));
            cur = next;
        }
    }

    // ── request side (we may own some of the path) ─────────────────────

    fn discover_request(&mut self, env: Envelope, mut dis: Discover) {
        let whoami = self.whoami();

        if self.root.is_none() {
            // Nothing to resolve against yet; root's owner can.
            debug!(target: "sfs::discover", event = "request_no_root");
            self.send(env.forwarded_to(MdsId(0)));
            return;
        }

        let base = dis.current_base();
        let mut cur = match self.traverse(&base, Some(&env), OnFail::Forward) {
            Traversal::Done(trace) => *trace.last().expect("trace includes root"),
            Traversal::Deferred => return,
            other => {
                warn!(target: "sfs::discover", event = "request_base_error", ?other);
                return;
            }
        };

        if dis.just_root {
            let root = self.root.expect("checked above");
            dis.trace.push(self.make_record(root));
            self.cached_by_add(root, dis.asker);
            debug!(target: "sfs::discover", event = "serving_root", asker = %dis.asker);
        }

        while !dis.done() {
            assert!(self.inode(cur).is_dir(), "discover descended into a file");
            self.open_dir(cur);
            let name = dis.next_dentry().to_owned();

            let dauth = self.dentry_authority(cur, &name);
            if dauth != whoami {
                let dest = if dis.have_added() {
                    // Partial results are worth more than a longer trip.
                    dis.asker
                } else {
                    dauth
                };
                debug!(target: "sfs::discover", event = "request_punt", %name, %dest);
                self.send_cache_msg(dest, CacheMessage::Discover(dis));
                return;
            }

            if self.dir_is_frozen(cur) {
                debug!(target: "sfs::discover", event = "request_frozen", ino = %cur);
                self.add_dir_waiter(cur, DirWait::Unfreeze, Continuation::RetryMessage(env));
                return;
            }

            match self.dir(cur).lookup(&name).map(|d| d.ino) {
                Some(next) => {
                    dis.trace.push(self.make_record(next));
                    self.cached_by_add(next, dis.asker);
                    debug!(target: "sfs::discover", event = "adding_bit", ino = %next, %name);
                    cur = next;
                }
                None => {
                    assert!(
                        !self.dir(cur).is_complete(),
                        "discover wants {name}, which does not exist here"
                    );
                    debug!(target: "sfs::discover", event = "request_fetch", ino = %cur);
                    self.fetch_dir(cur, Continuation::RetryMessage(env));
                    return;
                }
            }
        }

        debug!(target: "sfs::discover", event = "request_done", asker = %dis.asker);
        let asker = dis.asker;
        self.send_cache_msg(asker, CacheMessage::Discover(dis));
    }
}
