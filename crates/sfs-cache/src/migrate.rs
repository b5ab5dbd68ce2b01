//! Subtree export/import: authority migration.
//!
//! Five phases, each gated by an explicit ack: prep (destination
//! discovers and anchors the dir), freeze (auth pins drain subtree-wide),
//! transfer (one packed walk of every owned dir), ack (importer has
//! assimilated), notify (the inode authority of the subtree root spreads
//! the new dir authority). Waiters parked under the subtree are
//! partitioned at transfer time: retried messages chase the new
//! authority, internal steps fail in place.

use crate::dir::{Dir, DirState, DirWait, DIR_STATE_EXPORTED_MASK, DIR_STATE_EXPORT_KEPT_MASK};
use crate::inode::{Inode, InodeDist, InodeWait, PinReason};
use crate::waiter::{Continuation, ExportWaiters};
use crate::{MdCache, OnFail, Traversal};
use sfs_msg::blob::{BlobReader, BlobWriter, DirExportHeader, InodeExportRecord};
use sfs_msg::{CacheMessage, Envelope};
use sfs_types::{DirAuth, InodeNumber, MdsId};
use tracing::{debug, info, warn};

impl MdCache {
    /// Add `delta` to the popularity of `ino` and every ancestor.
    pub(crate) fn adjust_popularity(&mut self, ino: InodeNumber, delta: f64) {
        let mut cur = ino;
        loop {
            self.inode_mut(cur).popularity += delta;
            match &self.inode(cur).parent {
                Some(link) => cur = link.dir_ino,
                None => break,
            }
        }
    }

    pub(crate) fn ensure_dir(&mut self, ino: InodeNumber, auth: bool) {
        if self.inode(ino).dir.is_none() {
            let hashed = self.inode(ino).dir_is_hashed();
            let mut dir = Dir::new(auth);
            if hashed {
                dir.state.insert(DirState::HASHED);
            }
            self.inode_mut(ino).dir = Some(dir);
        }
    }

    // ── phase 1: prep ──────────────────────────────────────────────────

    /// Begin exporting the subtree rooted at `ino` to `dest`.
    pub fn export_dir(&mut self, ino: InodeNumber, dest: MdsId) {
        if dest == self.whoami() {
            warn!(target: "sfs::migrate", event = "export_to_self", %ino);
            return;
        }
        if self.inode(ino).is_root() {
            warn!(target: "sfs::migrate", event = "export_of_root");
            return;
        }
        self.open_dir(ino);
        if self.dir(ino).is_freezing() || self.dir_is_frozen(ino) {
            debug!(target: "sfs::migrate", event = "export_busy", %ino);
            return;
        }

        info!(target: "sfs::migrate", event = "export_begin", %ino, %dest);
        let path = self.make_path(ino);
        self.send_cache_msg(dest, CacheMessage::ExportDirPrep { ino, path });
        // Anchor the dir so the freeze cannot complete before the
        // destination has it pinned on its side.
        self.auth_pin_dir(ino);
        self.counters.ex += 1;

        // Popularity leaves with the subtree.
        let pop = self.inode(ino).popularity;
        self.adjust_popularity(ino, -pop);

        self.freeze_tree(ino, Continuation::ExportFrozen { ino, dest, pop });

        if self.sticky_sync_normal || self.sticky_sync_softasync {
            self.export_dir_dropsync(ino);
        }
        self.drain_runq();
    }

    /// Sticky grants under the subtree would deadlock the freeze; shed
    /// them so in-flight operations can finish.
    fn export_dir_dropsync(&mut self, idir: InodeNumber) {
        if self.inode(idir).dir.is_none() {
            return;
        }
        let children: Vec<InodeNumber> =
            self.dir(idir).entries.values().map(|d| d.ino).collect();
        for child in children {
            if self.inode(child).is_syncbyme() {
                debug!(target: "sfs::migrate", event = "dropsync", ino = %child);
                self.sync_release(child);
            }
            let in_ = self.inode(child);
            if in_.is_dir()
                && in_.dir_auth == DirAuth::Parent
                && in_.dir.as_ref().is_some_and(|d| d.nested_auth_pins > 0)
            {
                self.export_dir_dropsync(child);
            }
        }
    }

    pub(crate) fn handle_export_dir_prep_ack(&mut self, ino: InodeNumber) {
        assert!(self.inodes.contains_key(&ino), "prep ack for unknown dir");
        debug!(target: "sfs::migrate", event = "prep_ack", %ino);
        // Drop the anchor; the freeze may now complete.
        self.auth_unpin_dir(ino);
    }

    // ── phase 3: transfer (runs when the freeze completes) ─────────────

    pub(crate) fn export_dir_frozen(&mut self, ino: InodeNumber, dest: MdsId, pop: f64) {
        debug!(target: "sfs::migrate", event = "export_frozen", %ino, %dest);

        let containing_import = self.get_containing_import(ino);
        if containing_import == ino {
            // Re-exporting a previous import; the import point dissolves
            // and every export nested under it leaves with the subtree.
            debug!(target: "sfs::migrate", event = "reexport_import", %ino);
            self.imports.remove(&ino);
            self.dir_mut(ino).state.remove(DirState::IMPORT);
            self.unpin(ino, PinReason::Import);
            self.nested_exports.remove(&ino);
        } else {
            debug!(target: "sfs::migrate", event = "fresh_export", %ino, import = %containing_import);
            self.exports.insert(ino);
            self.nested_exports
                .entry(containing_import)
                .or_default()
                .insert(ino);
            self.pin(ino, PinReason::Export);

            // Any sibling export that now falls inside the new export
            // moves with it; keep only those still directly under the
            // containing import.
            let nested: Vec<InodeNumber> = self.nested_exports[&containing_import]
                .iter()
                .copied()
                .collect();
            for ex in nested {
                if ex == ino {
                    continue;
                }
                let parent = self
                    .inode(ex)
                    .parent
                    .as_ref()
                    .map(|l| l.dir_ino)
                    .expect("export point has a parent");
                if self.get_containing_export(parent) == Some(ino) {
                    debug!(target: "sfs::migrate", event = "nested_export_moves", ino = %ex);
                    self.nested_exports
                        .get_mut(&containing_import)
                        .expect("containing import present")
                        .remove(&ex);
                }
            }
        }

        // New authority, locally; canonicalize to the inherit sentinel
        // when the parent already points there.
        self.inode_mut(ino).dir_auth = DirAuth::Mds(dest);
        if let Some(link) = self.inode(ino).parent.clone() {
            if self.inode(link.dir_ino).dir_auth == DirAuth::Mds(dest) {
                self.inode_mut(ino).dir_auth = DirAuth::Parent;
            }
        }

        let mut writer = BlobWriter::new();
        let mut waiters = ExportWaiters::default();
        let mut ndirs = 0_u32;
        self.export_dir_walk(ino, dest, &mut writer, &mut ndirs, &mut waiters);

        self.send_cache_msg(
            dest,
            CacheMessage::ExportDir {
                ino,
                ndirs,
                state: writer.finish(),
                popularity: pop,
            },
        );
        self.pending_export_finish.insert(ino, waiters);
        self.counters.nex = self.exports.len() as u64;
        self.counters.nim = self.imports.len() as u64;
    }

    fn export_dir_walk(
        &mut self,
        idir: InodeNumber,
        newauth: MdsId,
        writer: &mut BlobWriter,
        ndirs: &mut u32,
        waiters: &mut ExportWaiters,
    ) {
        if self.inode(idir).dir.is_none() {
            return;
        }
        let whoami = self.whoami();
        let hashed = self.dir(idir).is_hashed();
        debug!(
            target: "sfs::migrate",
            event = "export_walk",
            ino = %idir,
            items = self.dir(idir).size()
        );

        let entries: Vec<(String, InodeNumber)> = self
            .dir(idir)
            .entries
            .iter()
            .map(|(name, d)| (name.clone(), d.ino))
            .collect();

        // Which children get shipped: everything, or only the dirs that
        // tie the hierarchy together when the dir's files are sharded.
        let shipped: Vec<(String, InodeNumber)> = entries
            .iter()
            .filter(|(_, c)| !hashed || self.inode(*c).is_dir())
            .cloned()
            .collect();

        {
            let dir = self.dir(idir);
            writer.push_dir_header(&DirExportHeader {
                ino: idir,
                nitems: shipped.len() as u32,
                version: dir.version,
                state: dir.state.bits(),
                dir_rep: dir.dir_rep,
                dir_rep_by: dir.dir_rep_by.iter().copied().collect(),
                popularity: dir.popularity,
            });
        }
        *ndirs += 1;

        // This dir is no longer ours; keep only the freeze bits.
        {
            let dir = self.dir_mut(idir);
            assert!(dir.is_auth(), "exporting a dir we don't own");
            let kept = dir.state.bits() & DIR_STATE_EXPORT_KEPT_MASK;
            dir.state = DirState::from_bits_truncate(kept);
        }

        // Hand off everything parked on the dir's inode.
        let parked = self.inode_mut(idir).take_all_waiting();
        for _ in 0..parked.len() {
            self.unpin(idir, PinReason::Waiter);
        }
        waiters.assimilate(parked);

        let mut subdirs = Vec::new();
        for (name, child) in entries {
            self.inode_mut(child).version += 1;

            // Inside a hashed dir, subtree ownership must be explicit
            // before the walk ships it.
            if hashed && self.inode(child).dir_auth == DirAuth::Parent {
                self.inode_mut(child).dir_auth = DirAuth::Mds(whoami);
            }

            let ship = !hashed || self.inode(child).is_dir();
            if ship {
                let in_ = self.inode(child);
                writer.push_entry(
                    &name,
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

            if self.inode(child).is_dir() {
                let child_dir_auth = self.inode(child).dir_auth;
                let recurse = child_dir_auth == DirAuth::Parent
                    || (self.inode(child).dir_is_hashed()
                        && child_dir_auth == DirAuth::Mds(whoami));
                if recurse {
                    subdirs.push(child);
                } else {
                    // A nested export leaves with the subtree; its
                    // nested_exports entry was pruned before the walk.
                    debug!(target: "sfs::migrate", event = "walk_nested_export", ino = %child);
                    assert!(self.exports.remove(&child), "nested export unknown");
                    self.unpin(child, PinReason::Export);
                }
            }

            if hashed {
                // Shipped dirs become replicas on the importer; make sure
                // the ones we own know about it.
                if self.inode(child).is_dir() && self.inode(child).auth {
                    if !self.inode(child).cached_by.contains(&newauth) {
                        self.cached_by_add(child, newauth);
                    }
                }
            } else {
                if self.inode(child).dirty {
                    self.mark_clean(child);
                }
                self.cached_by_clear(child);
                assert!(self.inode(child).auth, "exporting a replica");
                self.inode_mut(child).auth = false;
                self.fix_cached_pin(child);
            }
        }

        // And everything parked on the dir itself.
        let parked = self.dir_mut(idir).take_all_waiting();
        for _ in 0..parked.len() {
            self.unpin(idir, PinReason::Waiter);
        }
        waiters.assimilate(parked);

        for sub in subdirs {
            self.export_dir_walk(sub, newauth, writer, ndirs, waiters);
        }
    }

    // ── phase 4 (exporter side): ack ───────────────────────────────────

    pub(crate) fn handle_export_dir_ack(&mut self, ino: InodeNumber) {
        info!(target: "sfs::migrate", event = "export_acked", %ino);

        self.unfreeze_tree(ino);

        let waiters = self
            .pending_export_finish
            .remove(&ino)
            .expect("ack without a pending export");
        let new_auth = self.dir_authority(ino);
        for env in waiters.redelegate {
            debug!(target: "sfs::migrate", event = "redelegate", %new_auth);
            self.send(env.forwarded_to(new_auth));
        }
        for c in waiters.fail {
            warn!(target: "sfs::migrate", event = "export_waiter_failed", ?c);
        }
        self.drain_runq();
    }

    // ── importer side ──────────────────────────────────────────────────

    pub(crate) fn handle_export_dir_prep(&mut self, env: Envelope, ino: InodeNumber, path: String) {
        debug!(target: "sfs::migrate", event = "prep", %ino, %path);

        let from = match env.source {
            sfs_msg::Addr::Mds(who) => who,
            _ => panic!("export prep from a non-MDS"),
        };
        assert_ne!(from, self.whoami());

        let trace = match self.traverse(&path, Some(&env), OnFail::Discover) {
            Traversal::Done(trace) => trace,
            Traversal::Deferred => return,
            other => {
                warn!(target: "sfs::migrate", event = "prep_traverse_failed", ?other);
                return;
            }
        };
        let target = *trace.last().expect("trace includes root");
        assert_eq!(target, ino, "prep path resolves elsewhere");

        self.ensure_dir(target, false);
        assert!(!self.dir(target).is_auth());

        // Anchor until the data arrives.
        self.auth_pin_dir(target);

        debug!(target: "sfs::migrate", event = "prep_ack_send", %ino);
        self.send_cache_msg(from, CacheMessage::ExportDirPrepAck { ino });
    }

    pub(crate) fn handle_export_dir(
        &mut self,
        from: MdsId,
        ino: InodeNumber,
        ndirs: u32,
        state: &[u8],
        popularity: f64,
    ) {
        assert!(
            self.inodes.contains_key(&ino),
            "import data for an unprepared dir"
        );
        info!(target: "sfs::migrate", event = "import_begin", %ino, %from, ndirs);
        self.counters.im += 1;

        self.ensure_dir(ino, false);
        assert!(!self.dir(ino).is_auth());

        self.inode_mut(ino).dir_auth = DirAuth::Mds(self.whoami());

        let containing_import;
        if self.exports.contains(&ino) {
            // The subtree is coming home.
            debug!(target: "sfs::migrate", event = "reimport", %ino);
            self.exports.remove(&ino);
            self.unpin(ino, PinReason::Export);
            containing_import = self.get_containing_import(ino);
            if let Some(nested) = self.nested_exports.get_mut(&containing_import) {
                nested.remove(&ino);
            }
        } else {
            self.imports.insert(ino);
            self.dir_mut(ino).state.insert(DirState::IMPORT);
            self.pin(ino, PinReason::Import);
            containing_import = ino;
        }

        assert!(
            !self.import_hashed_replicate_waiting.contains_key(&ino),
            "overlapping hashed imports"
        );

        let mut reader = BlobReader::new(state);
        for _ in 0..ndirs {
            self.import_dir_block(&mut reader, containing_import, from, ino);
        }
        assert_eq!(reader.remaining(), 0, "trailing bytes in import blob");

        // Canonicalize: inherit when the chain already resolves to us.
        if DirAuth::Mds(self.inode_authority(ino)) == self.inode(ino).dir_auth {
            self.inode_mut(ino).dir_auth = DirAuth::Parent;
        }

        let newpop = popularity - self.inode(ino).popularity;
        if newpop > 0.0 {
            self.adjust_popularity(ino, newpop);
        }

        debug!(target: "sfs::migrate", event = "import_ack_send", %ino, %from);
        self.send_cache_msg(from, CacheMessage::ExportDirAck { ino });

        if self.import_hashed_frozen_waiting.contains_key(&ino) {
            // Hashed subdirs still need their peer replicas registered;
            // the finish runs from got_hashed_replica.
            debug!(target: "sfs::migrate", event = "import_wait_hashed", %ino);
        } else {
            self.export_dir_finish(ino);
        }
    }

    // ── phase 5: notify ────────────────────────────────────────────────

    pub(crate) fn export_dir_finish(&mut self, ino: InodeNumber) {
        assert!(self.dir(ino).is_auth());

        if self.inode_authority(ino) == self.whoami() {
            // We own the subtree root's inode too; spread the word
            // directly.
            self.send_inode_updates(ino);
        } else {
            let path = self.make_path(ino);
            let iauth = self.inode_authority(ino);
            let whoami = self.whoami();
            self.send_cache_msg(
                iauth,
                CacheMessage::ExportDirNotify {
                    path,
                    new_auth: whoami,
                },
            );
        }

        // Drop the prep anchor.
        self.auth_unpin_dir(ino);

        info!(target: "sfs::migrate", event = "import_done", %ino);
        self.counters.nex = self.exports.len() as u64;
        self.counters.nim = self.imports.len() as u64;

        self.fire_dir_waiters(ino, &DirWait::Imported);
        self.drain_runq();
    }

    fn import_dir_block(
        &mut self,
        reader: &mut BlobReader<'_>,
        containing_import: InodeNumber,
        oldauth: MdsId,
        import_root: InodeNumber,
    ) {
        let hdr = reader.read_dir_header().expect("well-formed dir block");
        debug!(
            target: "sfs::migrate",
            event = "import_dir_block",
            ino = %hdr.ino,
            items = hdr.nitems
        );
        assert!(
            self.inodes.contains_key(&hdr.ino),
            "dir block for an unknown inode"
        );
        let idir = hdr.ino;
        self.ensure_dir(idir, false);

        {
            let was_import = self.dir(idir).is_import();
            let dir = self.dir_mut(idir);
            dir.version = hdr.version;
            if dir.is_hashed() {
                // Already cluster-wide knowledge; nothing to assimilate.
            } else {
                let mut state =
                    DirState::from_bits_truncate(hdr.state & DIR_STATE_EXPORTED_MASK);
                if was_import {
                    state |= DirState::IMPORT;
                }
                dir.state = state;
            }
            assert!(!dir.is_auth());
            dir.state.insert(DirState::AUTH);
            dir.dir_rep = hdr.dir_rep;
            dir.dir_rep_by = hdr.dir_rep_by.iter().copied().collect();
            dir.popularity = hdr.popularity;
        }

        // A replica's waiters are a subset of what the authority carried;
        // they resume once the whole import lands.
        let parked = self.dir_mut(idir).take_all_waiting();
        for _ in 0..parked.len() {
            self.unpin(idir, PinReason::Waiter);
        }
        for c in parked {
            self.add_dir_waiter(import_root, DirWait::Imported, c);
        }

        for _ in 0..hdr.nitems {
            let (name, rec) = reader.read_entry().expect("well-formed dir entry");
            let child = self.import_dentry_inode(idir, &name, &rec, oldauth, Some(import_root));

            // Nested export fix-ups.
            if let DirAuth::Mds(target) = self.inode(child).dir_auth {
                if target == self.whoami() {
                    // The nested export pointed at us all along; the
                    // import point it carried dissolves into this one.
                    debug!(target: "sfs::migrate", event = "nested_export_to_me", ino = %child);
                    self.counters.immyex += 1;
                    if self.imports.remove(&child) {
                        self.unpin(child, PinReason::Import);
                    }
                    if let Some(d) = self.inode_mut(child).dir.as_mut() {
                        d.state.remove(DirState::IMPORT);
                    }
                    if let Some(nested) = self.nested_exports.remove(&child) {
                        for n in nested {
                            self.nested_exports
                                .entry(containing_import)
                                .or_default()
                                .insert(n);
                        }
                    }
                    self.inode_mut(child).dir_auth = DirAuth::Parent;
                } else {
                    debug!(target: "sfs::migrate", event = "nested_export_assimilated", ino = %child, %target);
                    self.counters.imex += 1;
                    self.exports.insert(child);
                    self.nested_exports
                        .entry(containing_import)
                        .or_default()
                        .insert(child);
                    self.pin(child, PinReason::Export);
                }
            }
        }
    }

    /// Assimilate one shipped dentry+inode. Serves three flows: a normal
    /// subtree import, a hashed shard landing, and an unhash
    /// reassimilation; hashed dirs additionally carry collateral dir
    /// replicas that may need their authority contacted.
    pub(crate) fn import_dentry_inode(
        &mut self,
        dir_ino: InodeNumber,
        name: &str,
        rec: &InodeExportRecord,
        from: MdsId,
        import_root: Option<InodeNumber>,
    ) -> InodeNumber {
        {
            let dir = self.dir(dir_ino);
            assert!(
                (dir.is_auth() && !dir.is_hashing())
                    || (!dir.is_auth() && dir.is_hashing())
                    || (dir.is_auth() && dir.is_unhashing()),
                "import into a dir in no importable state"
            );
        }

        let ino = rec.core.ino;
        let had_inode = self.inodes.contains_key(&ino);
        if !had_inode {
            let in_ = Inode::new(rec.core);
            self.add_inode(in_);
            self.link_inode(dir_ino, name.to_owned(), ino)
                .expect("import parent is a dir");
            debug!(target: "sfs::migrate", event = "import_new", %ino, name);
        } else {
            debug!(target: "sfs::migrate", event = "import_known", %ino, name);
        }

        let importing;
        if self.dir(dir_ino).is_unhashing() {
            self.inode_mut(ino).core = rec.core;
            self.inode_mut(ino).auth = true;
            importing = true;
        } else if self.dir(dir_ino).is_hashed() {
            assert!(self.inode(ino).is_dir(), "hashed dir shipped a file");
            let mine = self.inode_authority(ino) == self.whoami();
            self.inode_mut(ino).auth = mine;
            importing = false;
        } else {
            self.inode_mut(ino).core = rec.core;
            self.inode_mut(ino).auth = true;
            importing = true;
        }

        if importing {
            let whoami = self.whoami();
            {
                let in_ = self.inode_mut(ino);
                in_.dir_auth = rec.dir_auth;
                in_.version = rec.version;
                in_.popularity = rec.popularity;

                in_.cached_by.clear();
                for who in &rec.cached_by {
                    if *who != whoami {
                        in_.cached_by.insert(*who);
                    }
                }
                // The old authority keeps its copy as a replica.
                in_.cached_by.insert(from);

                // Grants do not survive migration; the softasync regime
                // does.
                in_.dist = if rec.softasync {
                    InodeDist::SOFTASYNC
                } else {
                    InodeDist::empty()
                };
            }
            self.fix_cached_pin(ino);

            if rec.dirty {
                self.mark_dirty(ino);
                debug!(target: "sfs::migrate", event = "log_dirty_import", %ino);
                let core = self.inode(ino).core;
                self.log.submit_entry(crate::LogEvent::InodeUpdate { ino, core });
            }
        } else {
            // Collateral dir replica inside a hashed dir.
            assert!(self.inode(ino).is_dir());
            let auth = self.inode_authority(ino);

            if self.inode(ino).auth {
                assert_eq!(auth, self.whoami());
                assert!(
                    self.inode(ino).cached_by.contains(&from),
                    "exporter shipped our dir without caching it"
                );
            } else if auth == from {
                // The exporter owns it and already counts us.
            } else if had_inode {
                debug!(target: "sfs::migrate", event = "collateral_known", %ino, %auth);
            } else {
                // Third-party authority doesn't know we exist yet.
                debug!(target: "sfs::migrate", event = "collateral_fetch", %ino, %auth);
                let import_root =
                    import_root.expect("collateral dirs only appear in subtree imports");
                let dauth = self.dentry_authority(dir_ino, name);
                self.send_cache_msg(dauth, CacheMessage::InodeGetReplica { ino });

                if !self.import_hashed_replicate_waiting.contains_key(&dir_ino) {
                    self.import_hashed_frozen_waiting
                        .entry(import_root)
                        .or_default()
                        .insert(dir_ino);
                    // Newly authoritative, so no pins can be outstanding.
                    self.freeze_dir(dir_ino, None);
                }
                self.import_hashed_replicate_waiting
                    .entry(dir_ino)
                    .or_default()
                    .insert(ino);

                self.add_inode_waiter(
                    ino,
                    InodeWait::GetReplica,
                    Continuation::GotHashedReplica {
                        import_ino: import_root,
                        dir_ino,
                        replica_ino: ino,
                    },
                );
            }
        }

        ino
    }

    pub(crate) fn got_hashed_replica(
        &mut self,
        import_ino: InodeNumber,
        dir_ino: InodeNumber,
        replica_ino: InodeNumber,
    ) {
        debug!(
            target: "sfs::migrate",
            event = "got_hashed_replica",
            import = %import_ino,
            dir = %dir_ino,
            replica = %replica_ino
        );

        let waiting = self
            .import_hashed_replicate_waiting
            .get_mut(&dir_ino)
            .expect("replica ack without waiting entry");
        assert!(waiting.remove(&replica_ino), "replica ack twice");
        if !waiting.is_empty() {
            return;
        }
        self.import_hashed_replicate_waiting.remove(&dir_ino);

        self.unfreeze_dir(dir_ino);

        let frozen = self
            .import_hashed_frozen_waiting
            .get_mut(&import_ino)
            .expect("frozen bookkeeping missing");
        assert!(frozen.remove(&dir_ino));
        if frozen.is_empty() {
            self.import_hashed_frozen_waiting.remove(&import_ino);
            self.export_dir_finish(import_ino);
        }
    }

    // ── phase 5 (inode authority bystander) ────────────────────────────

    pub(crate) fn handle_export_dir_notify(
        &mut self,
        env: Envelope,
        path: String,
        new_auth: MdsId,
    ) {
        debug!(target: "sfs::migrate", event = "notify", %path, %new_auth);

        if self.root.is_none() {
            if self.whoami() != MdsId(0) {
                self.send(env.forwarded_to(MdsId(0)));
            } else {
                warn!(target: "sfs::migrate", event = "notify_without_root");
            }
            return;
        }

        let trace = match self.traverse(&path, Some(&env), OnFail::Forward) {
            Traversal::Done(trace) => trace,
            Traversal::Deferred => return,
            other => {
                warn!(target: "sfs::migrate", event = "notify_traverse_failed", ?other);
                return;
            }
        };
        let ino = *trace.last().expect("trace includes root");

        let iauth = self.inode_authority(ino);
        if iauth != self.whoami() {
            debug!(target: "sfs::migrate", event = "notify_forward", %iauth);
            self.send(env.forwarded_to(iauth));
            return;
        }

        assert_ne!(
            self.inode(ino).dir_auth,
            DirAuth::Mds(self.whoami()),
            "notify for a subtree we think is ours"
        );

        // The update must not change which subtrees *we* own.
        let was_ours = self.dir_authority(ino) == self.whoami();
        self.inode_mut(ino).dir_auth = DirAuth::Mds(new_auth);
        let is_ours = self.dir_authority(ino) == self.whoami();
        assert_eq!(was_ours, is_ours);

        debug!(target: "sfs::migrate", event = "notify_applied", %ino, %new_auth);
        self.send_inode_updates(ino);
    }
}
