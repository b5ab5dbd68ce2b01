//! Path traversal.
//!
//! Walks a slash path from the root, one dentry per step. Each step can
//! complete locally, park the request on the event it needs (unfreeze,
//! dentry arrival, dir fetch), or punt to the MDS that owns the next
//! dentry according to the caller's failure policy.

use crate::dir::DirWait;
use crate::waiter::Continuation;
use crate::MdCache;
use sfs_error::SfsError;
use sfs_msg::{CacheMessage, Discover, Envelope};
use sfs_types::{path_segments, InodeNumber};
use tracing::debug;

/// What to do when the next dentry belongs to another MDS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFail {
    /// Ask the dentry authority to replicate the remaining path here.
    Discover,
    /// Retransmit the original request to the dentry authority.
    Forward,
    /// Give up and report `NotAuth`.
    Fail,
}

/// Result of a traversal. `Deferred` means the request was parked or
/// forwarded and the caller must stop processing it.
#[derive(Debug)]
pub enum Traversal {
    /// Inodes from the root to the target, inclusive.
    Done(Vec<InodeNumber>),
    Deferred,
    /// The walk left this MDS's authority (only with [`OnFail::Fail`]).
    NotAuth,
    Error(SfsError),
}

impl MdCache {
    /// Walk `path`. `req` is the original envelope, used to park a retry
    /// or to forward; a `None` request can only complete or fail.
    pub fn traverse(&mut self, path: &str, req: Option<&Envelope>, onfail: OnFail) -> Traversal {
        let whoami = self.whoami();

        let Some(root) = self.root else {
            debug!(target: "sfs::traverse", event = "no_root", path);
            let retry = req.map(|r| Continuation::RetryMessage(r.clone()));
            self.open_root(retry);
            return Traversal::Deferred;
        };

        let mut trace = vec![root];
        let mut cur = root;
        let mut have_clean = String::new();

        for dname in path_segments(path) {
            if !self.inode(cur).is_dir() {
                return Traversal::Error(SfsError::NotDirectory);
            }
            self.open_dir(cur);

            // Frozen dirs reject traversal until the thaw.
            if self.dir(cur).is_frozen_tree_root() || self.dir(cur).is_frozen_dir() {
                debug!(target: "sfs::traverse", event = "frozen_wait", ino = %cur);
                if let Some(req) = req {
                    self.add_dir_waiter(
                        cur,
                        DirWait::Unfreeze,
                        Continuation::RetryMessage(req.clone()),
                    );
                }
                return Traversal::Deferred;
            }

            // Hard metadata must be readable to continue.
            if !self.read_hard_try(cur, req) {
                return Traversal::Deferred;
            }

            if let Some(dn) = self.dir(cur).lookup(&dname) {
                cur = dn.ino;
                have_clean.push('/');
                have_clean.push_str(&dname);
                trace.push(cur);
                continue;
            }

            let dauth = self.dentry_authority(cur, &dname);
            if dauth == whoami {
                if self.dir(cur).is_complete() {
                    return Traversal::Error(SfsError::NotFound);
                }
                // Not all entries are in memory; reload the dir.
                debug!(target: "sfs::traverse", event = "fetch_dir", ino = %cur);
                self.lru.touch(cur);
                self.counters.cmiss += 1;
                self.counters.rdir += 1;
                if let Some(req) = req {
                    self.fetch_dir(cur, Continuation::RetryMessage(req.clone()));
                }
                return Traversal::Deferred;
            }

            match onfail {
                OnFail::Discover => {
                    let mut want = vec![dname.clone()];
                    // Everything after the missing segment is wanted too.
                    let all = path_segments(path);
                    let depth = trace.len(); // segments consumed so far + 1
                    want.extend(all.into_iter().skip(depth));

                    debug!(
                        target: "sfs::traverse",
                        event = "discover",
                        ino = %cur,
                        name = %dname,
                        %dauth
                    );
                    self.lru.touch(cur);
                    self.counters.dis += 1;
                    self.counters.cmiss += 1;
                    let base = if have_clean.is_empty() {
                        "/".to_owned()
                    } else {
                        have_clean.clone()
                    };
                    let dis = Discover::new(whoami, base, want);
                    self.send_cache_msg(dauth, CacheMessage::Discover(dis));

                    if let Some(req) = req {
                        self.add_dir_waiter(
                            cur,
                            DirWait::Dentry(dname),
                            Continuation::RetryMessage(req.clone()),
                        );
                    }
                    return Traversal::Deferred;
                }
                OnFail::Forward => {
                    let Some(req) = req else {
                        return Traversal::NotAuth;
                    };
                    debug!(target: "sfs::traverse", event = "forward", name = %dname, %dauth);
                    self.counters.cfw += 1;
                    self.send(req.clone().forwarded_to(dauth));
                    return Traversal::Deferred;
                }
                OnFail::Fail => return Traversal::NotAuth,
            }
        }

        Traversal::Done(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::DirState;
    use crate::CacheConfig;
    use sfs_msg::Payload;
    use sfs_types::{InodeKind, MdsId, MdsMap, ROOT_INO};

    fn cache(whoami: u32, n: u32) -> MdCache {
        MdCache::new(MdsId(whoami), MdsMap::new(n), &CacheConfig::default())
    }

    fn add_dir(c: &mut MdCache, parent: InodeNumber, name: &str) -> InodeNumber {
        let ino = c.create_inode();
        c.inode_mut(ino).core.kind = InodeKind::Dir;
        c.link_inode(parent, name.to_owned(), ino).unwrap();
        c.open_dir(ino);
        ino
    }

    #[test]
    fn walks_a_local_path() {
        let mut c = cache(0, 1);
        c.open_root(None);
        let a = add_dir(&mut c, ROOT_INO, "a");
        let b = add_dir(&mut c, a, "b");
        c.dir_mut(ROOT_INO).state.insert(DirState::COMPLETE);
        c.dir_mut(a).state.insert(DirState::COMPLETE);

        match c.traverse("/a/b", None, OnFail::Fail) {
            Traversal::Done(trace) => assert_eq!(trace, vec![ROOT_INO, a, b]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn noent_requires_a_complete_dir() {
        let mut c = cache(0, 1);
        c.open_root(None);
        c.dir_mut(ROOT_INO).state.insert(DirState::COMPLETE);
        assert!(matches!(
            c.traverse("/missing", None, OnFail::Fail),
            Traversal::Error(SfsError::NotFound)
        ));

        // Incomplete dir defers to a fetch instead.
        c.dir_mut(ROOT_INO).state.remove(DirState::COMPLETE);
        let req = Envelope::cache(
            MdsId(0),
            MdsId(0),
            CacheMessage::InodeGetReplica { ino: ROOT_INO },
        );
        assert!(matches!(
            c.traverse("/missing", Some(&req), OnFail::Fail),
            Traversal::Deferred
        ));
        assert_eq!(c.take_fetch_requests(), vec![ROOT_INO]);
    }

    #[test]
    fn files_are_not_traversable() {
        let mut c = cache(0, 1);
        c.open_root(None);
        let f = c.create_inode();
        c.link_inode(ROOT_INO, "file".into(), f).unwrap();
        assert!(matches!(
            c.traverse("/file/x", None, OnFail::Fail),
            Traversal::Error(SfsError::NotDirectory)
        ));
    }

    #[test]
    fn foreign_dentry_discovers_with_remaining_path() {
        let mut c = cache(1, 2);
        // Fake a root replica owned by mds0.
        let mut core = sfs_types::InodeCore::new(ROOT_INO);
        core.kind = InodeKind::Dir;
        let mut root = crate::inode::Inode::new(core);
        root.auth = false;
        root.dir_auth = sfs_types::DirAuth::Mds(MdsId(0));
        c.set_root(root);
        c.open_dir(ROOT_INO);

        let req = Envelope::cache(
            MdsId(1),
            MdsId(1),
            CacheMessage::InodeGetReplica { ino: ROOT_INO },
        );
        assert!(matches!(
            c.traverse("/x/y", Some(&req), OnFail::Discover),
            Traversal::Deferred
        ));
        let out = c.take_outbox();
        assert_eq!(out.len(), 1);
        match &out[0].payload {
            Payload::Cache(CacheMessage::Discover(d)) => {
                assert_eq!(d.base_path, "/");
                assert_eq!(d.want, vec!["x".to_owned(), "y".to_owned()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(c.dir(ROOT_INO).waiter_count() == 1);
    }
}
