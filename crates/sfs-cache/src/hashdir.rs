//! Hashed-dir conversion.
//!
//! A hashed dir's entries are sharded across the cluster by dentry hash;
//! every node is partially authoritative for it. Conversion in either
//! direction reuses the single-dir freeze and the import dentry decoder:
//! hashing ships each shard to its owner and waits for every holder to
//! ack; unhashing pulls every shard back and waits symmetrically.

use crate::dir::DirState;
use crate::waiter::Continuation;
use crate::{MdCache, OnFail, Traversal};
use sfs_msg::blob::{BlobReader, BlobWriter, InodeExportRecord};
use sfs_msg::{CacheMessage, Envelope};
use sfs_types::{DirAuth, InodeKind, InodeNumber, MdsId};
use tracing::{debug, info, warn};

impl MdCache {
    fn drop_sync_in_dir(&mut self, ino: InodeNumber) {
        let children: Vec<InodeNumber> =
            self.dir(ino).entries.values().map(|d| d.ino).collect();
        for child in children {
            if self.inode(child).auth && self.inode(child).is_syncbyme() {
                debug!(target: "sfs::hashdir", event = "dropsync", ino = %child);
                self.sync_release(child);
            }
        }
    }

    /// Serialize one shard entry and strip our ownership of it.
    fn give_away_entry(
        &mut self,
        dir_ino: InodeNumber,
        name: &str,
        writer: &mut BlobWriter,
        explicit_auth: Option<MdsId>,
        reinherit_from: Option<MdsId>,
    ) {
        let child = self.dir(dir_ino).lookup(name).expect("entry present").ino;
        self.inode_mut(child).version += 1;

        if let Some(me) = explicit_auth {
            if self.inode(child).dir_auth == DirAuth::Parent {
                self.inode_mut(child).dir_auth = DirAuth::Mds(me);
            }
        }
        if let Some(auth) = reinherit_from {
            if self.inode(child).dir_auth == DirAuth::Mds(auth) {
                self.inode_mut(child).dir_auth = DirAuth::Parent;
            }
        }

        {
            let in_ = self.inode(child);
            writer.push_entry(
                name,
                &InodeExportRecord {
                    core: in_.core,
                    dir_auth: in_.dir_auth,
                    version: in_.version,
                    popularity: in_.popularity,
                    dirty: in_.dirty,
                    softasync: in_.is_softasync(),
                    cached_by: in_.cached_by.iter().copied().collect(),
                },
            );
        }

        if self.inode(child).dirty {
            self.mark_clean(child);
        }
        self.cached_by_clear(child);
        assert!(self.inode(child).auth, "giving away an entry we don't own");
        self.inode_mut(child).auth = false;
        self.fix_cached_pin(child);
    }

    // ── hash, on the authority ─────────────────────────────────────────

    pub fn hash_dir(&mut self, ino: InodeNumber) {
        self.open_dir(ino);
        {
            let dir = self.dir(ino);
            assert!(!dir.is_hashing());
            assert!(!dir.is_hashed());
            assert!(dir.is_auth());
        }
        if self.dir(ino).is_freezing() || self.dir_is_frozen(ino) {
            debug!(target: "sfs::hashdir", event = "hash_busy", %ino);
            return;
        }

        info!(target: "sfs::hashdir", event = "hash_begin", %ino);
        self.dir_mut(ino).state.insert(DirState::HASHING);

        self.freeze_dir(ino, Some(Continuation::HashDirFrozen { ino }));

        if !self.dir(ino).is_complete() {
            debug!(target: "sfs::hashdir", event = "hash_fetch", %ino);
            self.fetch_dir(ino, Continuation::HashDirComplete { ino });
        } else {
            self.hash_dir_complete(ino);
        }

        if self.sticky_sync_normal || self.sticky_sync_softasync {
            self.drop_sync_in_dir(ino);
        }
        self.drain_runq();
    }

    /// Every locally-stored entry that stays with us is pinned dirty so
    /// the store pass after conversion rewrites it.
    pub(crate) fn hash_dir_complete(&mut self, ino: InodeNumber) {
        {
            let dir = self.dir(ino);
            assert!(dir.is_hashing());
            assert!(!dir.is_hashed());
            assert!(dir.is_auth());
        }
        let whoami = self.whoami();
        let cluster = self.cluster();
        let mine: Vec<InodeNumber> = self
            .dir(ino)
            .entries
            .iter()
            .filter(|(name, _)| cluster.hash_dentry(ino, name) == whoami)
            .map(|(_, d)| d.ino)
            .collect();
        for child in mine {
            self.mark_dirty(child);
        }
        self.hash_dir_finish(ino);
    }

    pub(crate) fn hash_dir_finish(&mut self, ino: InodeNumber) {
        // Freeze and fetch completions both land here; once the shards
        // are out (or the conversion finalized) there is nothing to redo.
        if !self.dir(ino).is_hashing() || self.hash_waiting.contains_key(&ino) {
            return;
        }
        {
            let dir = self.dir(ino);
            assert!(!dir.is_hashed());
            assert!(dir.is_auth());
            if !dir.is_frozen_dir() {
                debug!(target: "sfs::hashdir", event = "hash_wait_freeze", %ino);
                return;
            }
            if !dir.is_complete() {
                debug!(target: "sfs::hashdir", event = "hash_wait_complete", %ino);
                return;
            }
        }

        debug!(target: "sfs::hashdir", event = "hash_shard", %ino);
        let whoami = self.whoami();
        let cluster = self.cluster();
        let path = self.make_path(ino);

        let mut shards: Vec<BlobWriter> = (0..cluster.num_mds()).map(|_| BlobWriter::new()).collect();
        let names: Vec<String> = self.dir(ino).entries.keys().cloned().collect();
        for name in names {
            let code = cluster.hash_dentry(ino, &name);
            if code == whoami {
                continue;
            }
            let mut writer = std::mem::take(&mut shards[code.0 as usize]);
            self.give_away_entry(ino, &name, &mut writer, Some(whoami), None);
            shards[code.0 as usize] = writer;
        }

        let mut waiting = std::collections::BTreeSet::new();
        for (i, writer) in shards.into_iter().enumerate() {
            let peer = MdsId(i as u32);
            if peer == whoami {
                continue;
            }
            waiting.insert(peer);
            self.send_cache_msg(
                peer,
                CacheMessage::HashDir {
                    path: path.clone(),
                    state: writer.finish(),
                },
            );
        }

        if waiting.is_empty() {
            self.hash_dir_finalize(ino);
        } else {
            self.hash_waiting.insert(ino, waiting);
        }
    }

    /// Every holder has acked its shard: the dir is hashed cluster-wide.
    fn hash_dir_finalize(&mut self, ino: InodeNumber) {
        info!(target: "sfs::hashdir", event = "hashed", %ino);
        self.inode_mut(ino).core.kind = InodeKind::HashedDir;
        if self.inode(ino).auth {
            self.mark_dirty(ino);
        }
        {
            let dir = self.dir_mut(ino);
            dir.state.insert(DirState::HASHED);
            dir.state.remove(DirState::HASHING);
            dir.state.insert(DirState::DIRTY);
        }
        self.unfreeze_dir(ino);
    }

    pub(crate) fn handle_hash_dir_ack(&mut self, from: MdsId, ino: InodeNumber) {
        let waiting = self
            .hash_waiting
            .get_mut(&ino)
            .expect("hash ack without pending conversion");
        assert!(waiting.remove(&from), "hash ack twice from one peer");
        debug!(target: "sfs::hashdir", event = "hash_ack", %ino, %from);
        if waiting.is_empty() {
            self.hash_waiting.remove(&ino);
            self.hash_dir_finalize(ino);
        }
    }

    // ── hash, on a shard holder ────────────────────────────────────────

    pub(crate) fn handle_hash_dir(
        &mut self,
        env: Envelope,
        from: MdsId,
        path: String,
        state: &[u8],
    ) {
        let trace = match self.traverse(&path, Some(&env), OnFail::Discover) {
            Traversal::Done(trace) => trace,
            Traversal::Deferred => return,
            other => {
                warn!(target: "sfs::hashdir", event = "hash_traverse_failed", ?other);
                return;
            }
        };
        let ino = *trace.last().expect("trace includes root");
        self.ensure_dir(ino, false);

        debug!(target: "sfs::hashdir", event = "hash_assimilate", %ino, %from);
        assert!(!self.dir(ino).is_auth());
        assert!(!self.dir(ino).is_hashed());

        self.dir_mut(ino).state.insert(DirState::HASHING);

        let mut reader = BlobReader::new(state);
        while reader.remaining() > 0 {
            let (name, rec) = reader.read_entry().expect("well-formed shard entry");
            let child = self.import_dentry_inode(ino, &name, &rec, from, None);
            self.mark_dirty(child);
        }

        {
            let dir = self.dir_mut(ino);
            dir.state.remove(DirState::HASHING);
            dir.state.insert(DirState::HASHED);
            dir.state.insert(DirState::COMPLETE);
            dir.state.insert(DirState::DIRTY);
        }

        self.inode_mut(ino).core.kind = InodeKind::HashedDir;
        if self.inode(ino).auth {
            self.mark_dirty(ino);
        }

        self.send_cache_msg(from, CacheMessage::HashDirAck { ino });
    }

    // ── unhash, on the authority ───────────────────────────────────────

    pub fn unhash_dir(&mut self, ino: InodeNumber) {
        self.open_dir(ino);
        {
            let dir = self.dir(ino);
            assert!(dir.is_hashed());
            assert!(!dir.is_unhashing());
            assert!(dir.is_auth());
        }
        if self.dir(ino).is_freezing() || self.dir_is_frozen(ino) {
            debug!(target: "sfs::hashdir", event = "unhash_busy", %ino);
            return;
        }

        info!(target: "sfs::hashdir", event = "unhash_begin", %ino);
        self.dir_mut(ino).state.insert(DirState::UNHASHING);

        self.freeze_dir(ino, Some(Continuation::UnhashFrozen { ino }));

        let whoami = self.whoami();
        let path = self.make_path(ino);
        let peers: Vec<MdsId> = self.cluster().iter().filter(|p| *p != whoami).collect();
        let mut waiting = std::collections::BTreeSet::new();
        for peer in peers {
            waiting.insert(peer);
            self.send_cache_msg(peer, CacheMessage::UnhashDir { path: path.clone() });
        }
        self.unhash_waiting.insert(ino, waiting);

        if !self.dir(ino).is_complete() {
            debug!(target: "sfs::hashdir", event = "unhash_fetch", %ino);
            self.fetch_dir(ino, Continuation::UnhashComplete { ino });
        } else {
            self.unhash_dir_complete(ino);
        }

        if self.sticky_sync_normal || self.sticky_sync_softasync {
            self.drop_sync_in_dir(ino);
        }
        self.drain_runq();
    }

    pub(crate) fn unhash_dir_complete(&mut self, ino: InodeNumber) {
        let whoami = self.whoami();
        let cluster = self.cluster();
        let mine: Vec<InodeNumber> = self
            .dir(ino)
            .entries
            .iter()
            .filter(|(name, _)| cluster.hash_dentry(ino, name) == whoami)
            .map(|(_, d)| d.ino)
            .collect();
        for child in mine {
            self.mark_dirty(child);
        }
        self.unhash_dir_finish(ino);
    }

    pub(crate) fn unhash_dir_finish(&mut self, ino: InodeNumber) {
        if !self.dir(ino).is_unhashing() {
            return;
        }
        {
            let dir = self.dir(ino);
            if !dir.is_frozen_dir() {
                debug!(target: "sfs::hashdir", event = "unhash_wait_freeze", %ino);
                return;
            }
            if !dir.is_complete() {
                debug!(target: "sfs::hashdir", event = "unhash_wait_complete", %ino);
                return;
            }
        }
        if self
            .unhash_waiting
            .get(&ino)
            .is_some_and(|w| !w.is_empty())
        {
            debug!(target: "sfs::hashdir", event = "unhash_wait_acks", %ino);
            return;
        }
        self.unhash_waiting.remove(&ino);

        info!(target: "sfs::hashdir", event = "unhashed", %ino);
        {
            let dir = self.dir_mut(ino);
            dir.state.remove(DirState::HASHED);
            dir.state.remove(DirState::UNHASHING);
            dir.state.insert(DirState::DIRTY);
            dir.state.insert(DirState::COMPLETE);
        }
        self.inode_mut(ino).core.kind = InodeKind::Dir;
        self.mark_dirty(ino);
        self.unfreeze_dir(ino);
    }

    pub(crate) fn handle_unhash_dir_ack(&mut self, from: MdsId, ino: InodeNumber, state: &[u8]) {
        {
            let dir = self.dir(ino);
            assert!(dir.is_auth());
            assert!(dir.is_hashed());
            assert!(dir.is_unhashing());
        }
        debug!(target: "sfs::hashdir", event = "unhash_ack", %ino, %from);

        let mut reader = BlobReader::new(state);
        while reader.remaining() > 0 {
            let (name, rec) = reader.read_entry().expect("well-formed shard entry");
            let child = self.import_dentry_inode(ino, &name, &rec, from, None);
            self.mark_dirty(child);
        }

        let waiting = self
            .unhash_waiting
            .get_mut(&ino)
            .expect("unhash ack without pending conversion");
        assert!(waiting.remove(&from), "unhash ack twice from one peer");

        self.unhash_dir_finish(ino);
    }

    // ── unhash, on a shard holder ──────────────────────────────────────

    pub(crate) fn handle_unhash_dir(&mut self, env: Envelope, from: MdsId, path: String) {
        let trace = match self.traverse(&path, Some(&env), OnFail::Discover) {
            Traversal::Done(trace) => trace,
            Traversal::Deferred => return,
            other => {
                warn!(target: "sfs::hashdir", event = "unhash_traverse_failed", ?other);
                return;
            }
        };
        let ino = *trace.last().expect("trace includes root");
        self.ensure_dir(ino, false);

        debug!(target: "sfs::hashdir", event = "unhash_peer", %ino, %from);
        assert!(self.dir(ino).is_hashed());

        self.dir_mut(ino).state.insert(DirState::UNHASHING);

        self.freeze_dir(
            ino,
            Some(Continuation::PeerUnhashFrozen { ino, auth: from }),
        );

        if !self.dir(ino).is_complete() {
            debug!(target: "sfs::hashdir", event = "unhash_peer_fetch", %ino);
            self.fetch_dir(ino, Continuation::PeerUnhashComplete { ino, auth: from });
        } else {
            self.peer_unhash_dir_complete(ino, from);
        }

        if self.sticky_sync_normal || self.sticky_sync_softasync {
            self.drop_sync_in_dir(ino);
        }
    }

    pub(crate) fn peer_unhash_dir_complete(&mut self, ino: InodeNumber, auth: MdsId) {
        let whoami = self.whoami();
        let cluster = self.cluster();
        let mine: Vec<InodeNumber> = self
            .dir(ino)
            .entries
            .iter()
            .filter(|(name, _)| cluster.hash_dentry(ino, name) == whoami)
            .map(|(_, d)| d.ino)
            .collect();
        for child in mine {
            self.mark_dirty(child);
        }
        self.peer_unhash_dir_finish(ino, auth);
    }

    pub(crate) fn peer_unhash_dir_finish(&mut self, ino: InodeNumber, auth: MdsId) {
        if !self.dir(ino).is_unhashing() {
            return;
        }
        {
            let dir = self.dir(ino);
            assert!(dir.is_hashed());
            if !dir.is_complete() {
                debug!(target: "sfs::hashdir", event = "unhash_peer_wait_complete", %ino);
                return;
            }
            if !dir.is_frozen_dir() {
                debug!(target: "sfs::hashdir", event = "unhash_peer_wait_freeze", %ino);
                return;
            }
        }

        debug!(target: "sfs::hashdir", event = "unhash_give_back", %ino, %auth);
        let whoami = self.whoami();
        let cluster = self.cluster();
        let mut writer = BlobWriter::new();
        let names: Vec<String> = self.dir(ino).entries.keys().cloned().collect();
        for name in names {
            if cluster.hash_dentry(ino, &name) != whoami {
                continue;
            }
            self.give_away_entry(ino, &name, &mut writer, None, Some(auth));
        }

        self.send_cache_msg(
            auth,
            CacheMessage::UnhashDirAck {
                ino,
                state: writer.finish(),
            },
        );

        self.inode_mut(ino).core.kind = InodeKind::Dir;
        if self.inode(ino).auth {
            self.mark_dirty(ino);
        }
        {
            let dir = self.dir_mut(ino);
            dir.state.remove(DirState::HASHED);
            dir.state.remove(DirState::UNHASHING);
            dir.state.remove(DirState::DIRTY);
        }
        self.unfreeze_dir(ino);
    }
}
