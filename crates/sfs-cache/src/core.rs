//! Namespace store operations, root bootstrap, trim and shutdown.

use crate::dir::DirState;
use crate::inode::{Inode, ParentLink, PinReason};
use crate::waiter::Continuation;
use crate::MdCache;
use sfs_error::{Result, SfsError};
use sfs_msg::{CacheMessage, Discover};
use sfs_types::{DirAuth, InodeCore, InodeKind, InodeNumber, MdsId, ROOT_INO};
use tracing::{debug, info, warn};

impl MdCache {
    /// Allocate and register a fresh authoritative inode.
    pub fn create_inode(&mut self) -> InodeNumber {
        let ino = self.alloc.get_ino();
        let mut in_ = Inode::new(InodeCore::new(ino));
        in_.auth = true;
        self.add_inode(in_);
        ino
    }

    pub fn destroy_inode(&mut self, ino: InodeNumber) {
        self.alloc.reclaim_ino(ino);
        self.remove_inode(ino);
    }

    pub(crate) fn add_inode(&mut self, in_: Inode) {
        assert_eq!(self.inodes.len(), self.lru.len());
        let ino = in_.ino();
        self.lru.insert_mid(ino);
        let prev = self.inodes.insert(ino, in_);
        assert!(prev.is_none(), "inode {ino} added twice");
        assert_eq!(self.inodes.len(), self.lru.len());
    }

    /// Detach an inode from its parent dentry and drop it from the cache.
    pub(crate) fn remove_inode(&mut self, ino: InodeNumber) {
        let parent = self.inode(ino).parent.clone();
        if let Some(link) = parent {
            self.dir_mut(link.dir_ino).remove_child(&link.name);
            self.inode_mut(ino).parent = None;
            self.unpin(link.dir_ino, PinReason::Child);
        }
        self.inodes.remove(&ino);
        self.lru.remove(ino);
    }

    /// Link `child` under `parent` as `name`. The name must be absent.
    pub fn link_inode(&mut self, parent: InodeNumber, name: String, child: InodeNumber) -> Result<()> {
        if !self.inode(parent).is_dir() {
            return Err(SfsError::NotDirectory);
        }
        self.open_dir(parent);
        assert!(
            self.dir(parent).lookup(&name).is_none(),
            "link over an existing dentry"
        );
        assert!(
            self.inode(child).parent.is_none(),
            "child already has a parent"
        );
        let dir_version = self.dir(parent).version;
        self.dir_mut(parent).add_child(name.clone(), child);
        let child_in = self.inode_mut(child);
        child_in.parent = Some(ParentLink {
            dir_ino: parent,
            name,
        });
        child_in.parent_dir_version = dir_version;
        self.pin(parent, PinReason::Child);
        Ok(())
    }

    /// Absolute path of an inode, assembled by walking parent links.
    #[must_use]
    pub fn make_path(&self, ino: InodeNumber) -> String {
        let mut segs = Vec::new();
        let mut cur = ino;
        while let Some(link) = &self.inode(cur).parent {
            segs.push(link.name.clone());
            cur = link.dir_ino;
        }
        segs.reverse();
        sfs_types::join_path(&segs)
    }

    // ── subtree bookkeeping ────────────────────────────────────────────

    /// The import root whose subtree contains `ino`. Every locally-owned
    /// inode lives under exactly one import.
    #[must_use]
    pub fn get_containing_import(&self, ino: InodeNumber) -> InodeNumber {
        let mut cur = ino;
        loop {
            if self.imports.contains(&cur) {
                return cur;
            }
            match &self.inode(cur).parent {
                Some(link) => cur = link.dir_ino,
                None => panic!("inode {ino} not under any import"),
            }
        }
    }

    /// The nearest enclosing export point, if `ino` sits under one.
    #[must_use]
    pub fn get_containing_export(&self, ino: InodeNumber) -> Option<InodeNumber> {
        let mut cur = ino;
        loop {
            if self.exports.contains(&cur) {
                return Some(cur);
            }
            match &self.inode(cur).parent {
                Some(link) => cur = link.dir_ino,
                None => return None,
            }
        }
    }

    // ── root ───────────────────────────────────────────────────────────

    pub(crate) fn set_root(&mut self, in_: Inode) {
        let ino = in_.ino();
        self.add_inode(in_);
        self.root = Some(ino);
    }

    /// Make the root available, fabricating it on MDS 0 and discovering
    /// it from everywhere else. `c` runs once the root is in cache.
    pub fn open_root(&mut self, c: Option<Continuation>) {
        if self.root.is_some() {
            if let Some(c) = c {
                self.runq.push_back(c);
                self.drain_runq();
            }
            return;
        }

        if self.whoami() == MdsId(0) {
            let mut core = InodeCore::new(ROOT_INO);
            core.kind = InodeKind::Dir;
            core.mode = 0o755;
            let mut root = Inode::new(core);
            root.auth = true;
            root.dir_auth = DirAuth::Mds(MdsId(0));
            self.set_root(root);
            self.open_dir(ROOT_INO);

            // Root is technically an import, from a vacuum.
            self.imports.insert(ROOT_INO);
            self.dir_mut(ROOT_INO).state.insert(DirState::IMPORT);
            self.pin(ROOT_INO, PinReason::Import);
            self.counters.nim = self.imports.len() as u64;
            info!(target: "sfs::cache", event = "root_created");

            if let Some(c) = c {
                self.runq.push_back(c);
                self.drain_runq();
            }
        } else {
            if let Some(c) = c {
                self.waiting_for_root.push(c);
            }
            if !self.opening_root {
                debug!(target: "sfs::cache", event = "discovering_root");
                self.opening_root = true;
                let whoami = self.whoami();
                self.send_cache_msg(MdsId(0), CacheMessage::Discover(Discover::root(whoami)));
            }
        }
    }

    // ── trim ───────────────────────────────────────────────────────────

    /// Expire cache entries until the LRU is at `max` (its configured
    /// maximum when `None`). Replica expiry notifies the authority; a
    /// trimmed-empty import is spontaneously re-exported to its inode
    /// authority.
    pub fn trim(&mut self, max: Option<usize>) -> bool {
        let max = match max {
            Some(n) => n,
            None => {
                let m = self.lru.max();
                if m == 0 {
                    return false;
                }
                m
            }
        };

        while self.lru.len() > max {
            let Some(ino) = self.lru.expire() else {
                self.drain_runq();
                return false;
            };
            let auth = self.inode_authority(ino);
            let whoami = self.whoami();
            if auth != whoami {
                debug!(target: "sfs::cache", event = "expire_notify", %ino, %auth);
                self.send_cache_msg(
                    auth,
                    CacheMessage::InodeExpire {
                        ino,
                        from: whoami,
                        soft: false,
                        hops: 0,
                    },
                );
            }

            let parent_dir = self.inode(ino).parent.as_ref().map(|l| l.dir_ino);

            debug!(target: "sfs::cache", event = "trim_evict", %ino);
            self.lru_orphan_remove(ino);

            if let Some(idir) = parent_dir {
                // The parent no longer has all entries in memory.
                self.dir_mut(idir).state.remove(DirState::COMPLETE);

                if self.imports.contains(&idir)
                    && self.dir(idir).size() == 0
                    && !self.inode(idir).is_root()
                    && !self.dir(idir).is_freezing()
                    && !self.dir_is_frozen(idir)
                {
                    let mut dest = self.inode_authority(idir);
                    if self.shutting_down {
                        dest = MdsId(0);
                    }
                    if dest != self.whoami() {
                        debug!(target: "sfs::cache", event = "reexport_empty_import", ino = %idir, %dest);
                        self.export_dir(idir, dest);
                    }
                }
            } else {
                debug!(target: "sfs::cache", event = "trimmed_root");
                self.root = None;
            }
        }
        self.drain_runq();
        true
    }

    /// Remove an inode that the LRU has already expired (so `remove_inode`
    /// must not double-remove the LRU entry).
    fn lru_orphan_remove(&mut self, ino: InodeNumber) {
        let parent = self.inode(ino).parent.clone();
        if let Some(link) = parent {
            self.dir_mut(link.dir_ino).remove_child(&link.name);
            self.inode_mut(ino).parent = None;
            self.unpin(link.dir_ino, PinReason::Child);
        }
        self.inodes.remove(&ino);
    }

    // ── shutdown ───────────────────────────────────────────────────────

    /// Begin a graceful drain: release every grant this node holds and
    /// turn sticky retention off so freezes cannot deadlock.
    pub fn shutdown_start(&mut self) {
        info!(target: "sfs::cache", event = "shutdown_start");
        self.shutting_down = true;

        let held: Vec<InodeNumber> = self
            .inodes
            .values()
            .filter(|in_| in_.auth && (in_.is_syncbyme() || in_.is_lockbyme()))
            .map(Inode::ino)
            .collect();
        for ino in held {
            if self.inode(ino).is_syncbyme() {
                self.sync_release(ino);
            }
            if self.inode(ino).is_lockbyme() {
                self.inode_lock_release(ino);
            }
        }

        self.sticky_sync_normal = false;
        self.sticky_sync_softasync = false;
        self.sticky_lock = false;
    }

    /// One drain pass. Returns true when the cache is empty and this node
    /// is done. The embedder pumps messages and log flushes between
    /// passes.
    pub fn shutdown_pass(&mut self) -> bool {
        debug!(target: "sfs::cache", event = "shutdown_pass", cache = self.lru.len());

        if self.log.num_events() > 0 {
            debug!(target: "sfs::cache", event = "shutdown_wait_log");
            return false;
        }

        self.trim(Some(0));

        // Replicas on already-shut-down peers cannot expire themselves
        // any more; strip them so their pins drain.
        if self.whoami() == MdsId(0) {
            let mut stripped = false;
            let targets: Vec<(InodeNumber, Vec<MdsId>)> = self
                .inodes
                .values()
                .filter(|in_| in_.auth)
                .map(|in_| {
                    (
                        in_.ino(),
                        in_.cached_by
                            .iter()
                            .copied()
                            .filter(|who| self.peer_is_shut_down(*who))
                            .collect(),
                    )
                })
                .collect();
            for (ino, gone) in targets {
                for who in gone {
                    self.inode_mut(ino).cached_by.remove(&who);
                    stripped = true;
                }
            }
            if stripped {
                self.trim(Some(0));
            }
        }

        if self.whoami() != MdsId(0) {
            let candidates: Vec<InodeNumber> = self.imports.iter().copied().collect();
            for im in candidates {
                if self.inode(im).is_root() {
                    continue;
                }
                if self.dir(im).is_freezing() || self.dir_is_frozen(im) {
                    continue;
                }
                debug!(target: "sfs::cache", event = "shutdown_export", ino = %im);
                self.export_dir(im, MdsId(0));
            }
        } else if self.lru.len() == 1 {
            if let Some(root) = self.root {
                // All that's left is root; un-import it and let it go.
                debug!(target: "sfs::cache", event = "shutdown_drop_root");
                self.imports.remove(&root);
                self.dir_mut(root).state.remove(DirState::IMPORT);
                self.unpin(root, PinReason::Import);

                if self.inode(root).is_pinned_by(PinReason::Dirty) {
                    self.mark_clean(root);
                }

                if !self.inode(root).is_expireable() {
                    warn!(target: "sfs::cache", event = "shutdown_root_still_pinned");
                    self.imports.insert(root);
                    self.dir_mut(root).state.insert(DirState::IMPORT);
                    self.pin(root, PinReason::Import);
                } else {
                    self.trim(Some(0));
                }
            }
        }

        assert_eq!(self.inodes.len(), self.lru.len());
        self.lru.is_empty()
    }

    // ── consistency checks (debug aid, used by tests) ──────────────────

    /// Assert the import/export bookkeeping invariants: every export is
    /// nested under exactly one import that is a proper ancestor.
    pub fn check_subtree_invariants(&self) {
        let mut seen = std::collections::BTreeSet::new();
        for (imp, nested) in &self.nested_exports {
            assert!(self.imports.contains(imp), "nested_exports under non-import");
            for ex in nested {
                assert!(self.exports.contains(ex), "nested export not in exports");
                assert!(seen.insert(*ex), "export nested under two imports");
                assert_eq!(self.get_containing_import(*ex), *imp);
            }
        }
        assert_eq!(seen.len(), self.exports.len(), "stray export points");
        for imp in &self.imports {
            assert!(
                self.inode(*imp).dir.as_ref().is_some_and(|d| d.is_import()),
                "import lacks IMPORT state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheConfig;
    use sfs_types::MdsMap;

    fn cache(whoami: u32, n: u32) -> MdCache {
        MdCache::new(MdsId(whoami), MdsMap::new(n), &CacheConfig::default())
    }

    #[test]
    fn root_bootstrap_on_zero_is_an_import() {
        let mut c = cache(0, 2);
        c.open_root(None);
        assert_eq!(c.root_ino(), Some(ROOT_INO));
        assert!(c.imports().contains(&ROOT_INO));
        assert!(!c.get_inode(ROOT_INO).unwrap().is_expireable());
        assert_eq!(c.cache_size(), 1);
    }

    #[test]
    fn root_bootstrap_elsewhere_sends_discover() {
        let mut c = cache(1, 2);
        c.open_root(None);
        assert_eq!(c.root_ino(), None);
        let out = c.take_outbox();
        assert_eq!(out.len(), 1);
        match &out[0].payload {
            sfs_msg::Payload::Cache(CacheMessage::Discover(d)) => {
                assert!(d.just_root);
                assert_eq!(d.asker, MdsId(1));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        // A second open_root parks without a second request.
        c.open_root(None);
        assert!(c.take_outbox().is_empty());
    }

    #[test]
    fn link_requires_a_dir() {
        let mut c = cache(0, 1);
        c.open_root(None);
        let file = c.create_inode();
        let child = c.create_inode();
        assert!(matches!(
            c.link_inode(file, "x".into(), child),
            Err(SfsError::NotDirectory)
        ));
        c.link_inode(ROOT_INO, "x".into(), child).unwrap();
        assert_eq!(c.make_path(child), "/x");
    }

    #[test]
    fn inode_map_tracks_lru_size() {
        let mut c = cache(0, 1);
        c.open_root(None);
        for _ in 0..5 {
            let ino = c.create_inode();
            c.link_inode(ROOT_INO, format!("f{ino}"), ino).unwrap();
        }
        assert_eq!(c.cache_size(), 6);
        c.trim(Some(2));
        assert_eq!(c.cache_size(), 2);
    }

    #[test]
    fn trim_stops_at_pinned_entries() {
        let mut c = cache(0, 1);
        c.open_root(None);
        let ino = c.create_inode();
        c.link_inode(ROOT_INO, "keep".into(), ino).unwrap();
        c.mark_dirty(ino);
        assert!(!c.trim(Some(0)));
        assert!(c.get_inode(ino).is_some());
    }
}
