#![forbid(unsafe_code)]
//! Wire protocol for the SwarmFS metadata cache.
//!
//! Every message between MDSs (and to clients, for sync fan-out) travels
//! in an [`Envelope`] addressed by node and port. The cache listens on a
//! single [`Port::Cache`]; payloads on other ports are opaque to it and
//! are forwarded or handed to the embedding server untouched.
//!
//! Message kinds are a closed tagged sum ([`CacheMessage`]), not open
//! polymorphism. The subtree-migration state blob has its own dense
//! little-endian codec in [`blob`].

pub mod blob;

use serde::{Deserialize, Serialize};
use sfs_types::{ClientId, DirRep, InodeCore, InodeNumber, MdsId};
use std::collections::BTreeSet;

/// A node address: a metadata server or a filesystem client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Addr {
    Mds(MdsId),
    Client(ClientId),
}

/// Subsystem ports. The cache owns `Cache`; `Server` carries end-user
/// requests the cache only ever forwards; `Main` is node lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Port {
    Cache,
    Server,
    Main,
}

/// Payload of an envelope. The cache interprets `Cache` payloads only;
/// `Opaque` bytes belong to some other subsystem and are relayed verbatim
/// (path traversal forwards parked upper-layer requests this way).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Cache(CacheMessage),
    Opaque(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: Addr,
    pub dest: Addr,
    pub source_port: Port,
    pub dest_port: Port,
    pub payload: Payload,
}

impl Envelope {
    /// A cache-port message between two MDSs.
    #[must_use]
    pub fn cache(from: MdsId, to: MdsId, msg: CacheMessage) -> Self {
        Self {
            source: Addr::Mds(from),
            dest: Addr::Mds(to),
            source_port: Port::Cache,
            dest_port: Port::Cache,
            payload: Payload::Cache(msg),
        }
    }

    /// A cache-port message from an MDS to a client (sync fan-out).
    #[must_use]
    pub fn to_client(from: MdsId, to: ClientId, msg: CacheMessage) -> Self {
        Self {
            source: Addr::Mds(from),
            dest: Addr::Client(to),
            source_port: Port::Cache,
            dest_port: Port::Cache,
            payload: Payload::Cache(msg),
        }
    }

    /// Re-address this envelope to another MDS, keeping ports and payload.
    #[must_use]
    pub fn forwarded_to(mut self, to: MdsId) -> Self {
        self.dest = Addr::Mds(to);
        self
    }
}

/// One resolved segment in a discover reply: enough of the authority's
/// state to install a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverRecord {
    pub core: InodeCore,
    pub cached_by: BTreeSet<MdsId>,
    pub dir_auth: sfs_types::DirAuth,
    pub dir_rep: DirRep,
    pub dir_rep_by: BTreeSet<MdsId>,
    pub is_syncbyauth: bool,
    pub is_softasync: bool,
    pub is_lockbyauth: bool,
}

/// Dentry discovery request/reply. The same value travels out with empty
/// `trace` and returns with one [`DiscoverRecord`] per resolved segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discover {
    pub asker: MdsId,
    pub base_path: String,
    pub want: Vec<String>,
    pub trace: Vec<DiscoverRecord>,
    pub just_root: bool,
}

impl Discover {
    #[must_use]
    pub fn new(asker: MdsId, base_path: String, want: Vec<String>) -> Self {
        Self {
            asker,
            base_path,
            want,
            trace: Vec::new(),
            just_root: false,
        }
    }

    /// The root-bootstrap degenerate request.
    #[must_use]
    pub fn root(asker: MdsId) -> Self {
        Self {
            asker,
            base_path: String::new(),
            want: Vec::new(),
            trace: Vec::new(),
            just_root: true,
        }
    }

    /// All wanted segments have a record.
    #[must_use]
    pub fn done(&self) -> bool {
        self.trace.len() >= self.want.len()
    }

    /// Name of the next unresolved segment.
    #[must_use]
    pub fn next_dentry(&self) -> &str {
        &self.want[self.trace.len()]
    }

    /// Path of the deepest inode already covered: the base plus every
    /// resolved segment.
    #[must_use]
    pub fn current_base(&self) -> String {
        let mut path = self.base_path.clone();
        for seg in &self.want[..self.trace.len()] {
            path.push('/');
            path.push_str(seg);
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }

    #[must_use]
    pub fn have_added(&self) -> bool {
        !self.trace.is_empty()
    }
}

/// Basic inode state broadcast to replicas by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InodeBasicState {
    pub core: InodeCore,
    pub dir_auth: sfs_types::DirAuth,
    pub cached_by: BTreeSet<MdsId>,
}

/// Every message kind the cache port understands. Receiving anything else
/// on the cache port is a protocol bug and aborts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheMessage {
    Discover(Discover),

    InodeUpdate(InodeBasicState),
    DirUpdate {
        ino: InodeNumber,
        dir_rep: DirRep,
        dir_rep_by: BTreeSet<MdsId>,
    },
    InodeExpire {
        ino: InodeNumber,
        from: MdsId,
        soft: bool,
        hops: u32,
    },

    InodeSyncStart {
        ino: InodeNumber,
        asker: MdsId,
    },
    InodeSyncAck {
        ino: InodeNumber,
        did_have: bool,
        wantback: bool,
    },
    InodeSyncRelease {
        ino: InodeNumber,
    },
    InodeSyncRecall {
        ino: InodeNumber,
    },

    InodeLockStart {
        ino: InodeNumber,
        asker: MdsId,
    },
    InodeLockAck {
        ino: InodeNumber,
        did_have: bool,
    },
    InodeLockRelease {
        ino: InodeNumber,
    },

    ExportDirPrep {
        ino: InodeNumber,
        path: String,
    },
    ExportDirPrepAck {
        ino: InodeNumber,
    },
    ExportDir {
        ino: InodeNumber,
        ndirs: u32,
        state: Vec<u8>,
        popularity: f64,
    },
    ExportDirAck {
        ino: InodeNumber,
    },
    ExportDirNotify {
        path: String,
        new_auth: MdsId,
    },

    InodeGetReplica {
        ino: InodeNumber,
    },
    InodeGetReplicaAck {
        ino: InodeNumber,
    },

    HashDir {
        path: String,
        state: Vec<u8>,
    },
    HashDirAck {
        ino: InodeNumber,
    },
    UnhashDir {
        path: String,
    },
    UnhashDirAck {
        ino: InodeNumber,
        state: Vec<u8>,
    },
}

impl CacheMessage {
    /// Short tag for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            CacheMessage::Discover(_) => "discover",
            CacheMessage::InodeUpdate(_) => "inode_update",
            CacheMessage::DirUpdate { .. } => "dir_update",
            CacheMessage::InodeExpire { .. } => "inode_expire",
            CacheMessage::InodeSyncStart { .. } => "inode_sync_start",
            CacheMessage::InodeSyncAck { .. } => "inode_sync_ack",
            CacheMessage::InodeSyncRelease { .. } => "inode_sync_release",
            CacheMessage::InodeSyncRecall { .. } => "inode_sync_recall",
            CacheMessage::InodeLockStart { .. } => "inode_lock_start",
            CacheMessage::InodeLockAck { .. } => "inode_lock_ack",
            CacheMessage::InodeLockRelease { .. } => "inode_lock_release",
            CacheMessage::ExportDirPrep { .. } => "export_dir_prep",
            CacheMessage::ExportDirPrepAck { .. } => "export_dir_prep_ack",
            CacheMessage::ExportDir { .. } => "export_dir",
            CacheMessage::ExportDirAck { .. } => "export_dir_ack",
            CacheMessage::ExportDirNotify { .. } => "export_dir_notify",
            CacheMessage::InodeGetReplica { .. } => "inode_get_replica",
            CacheMessage::InodeGetReplicaAck { .. } => "inode_get_replica_ack",
            CacheMessage::HashDir { .. } => "hash_dir",
            CacheMessage::HashDirAck { .. } => "hash_dir_ack",
            CacheMessage::UnhashDir { .. } => "unhash_dir",
            CacheMessage::UnhashDirAck { .. } => "unhash_dir_ack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_tracks_progress() {
        let mut dis = Discover::new(MdsId(1), "/a".to_owned(), vec!["b".into(), "c".into()]);
        assert!(!dis.done());
        assert_eq!(dis.next_dentry(), "b");
        assert_eq!(dis.current_base(), "/a");

        dis.trace.push(DiscoverRecord {
            core: InodeCore::new(InodeNumber(10)),
            cached_by: BTreeSet::new(),
            dir_auth: sfs_types::DirAuth::Parent,
            dir_rep: DirRep::None,
            dir_rep_by: BTreeSet::new(),
            is_syncbyauth: false,
            is_softasync: false,
            is_lockbyauth: false,
        });
        assert_eq!(dis.next_dentry(), "c");
        assert_eq!(dis.current_base(), "/a/b");
        assert!(dis.have_added());
    }

    #[test]
    fn root_discover_is_done_immediately() {
        let dis = Discover::root(MdsId(2));
        assert!(dis.just_root);
        assert!(dis.done());
        assert_eq!(dis.current_base(), "/");
    }

    #[test]
    fn forwarding_rewrites_dest_only() {
        let env = Envelope::cache(MdsId(0), MdsId(1), CacheMessage::InodeGetReplica {
            ino: InodeNumber(5),
        });
        let fwd = env.clone().forwarded_to(MdsId(2));
        assert_eq!(fwd.dest, Addr::Mds(MdsId(2)));
        assert_eq!(fwd.source, env.source);
        assert_eq!(fwd.payload, env.payload);
    }
}
