//! Parked continuations.
//!
//! A suspended operation is a tagged record, not a closure: it carries the
//! original message (or the minimal state of an internal protocol step)
//! and is re-driven by the dispatcher when its event fires. Continuations
//! parked under a subtree being exported are partitioned at hand-off time:
//! retried messages can be redelegated to the new authority, internal
//! steps cannot and fail locally.

use serde::{Deserialize, Serialize};
use sfs_msg::Envelope;
use sfs_types::{InodeNumber, MdsId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Continuation {
    /// Re-deliver the original message locally.
    RetryMessage(Envelope),

    /// Export freeze completed: ship the subtree.
    ExportFrozen {
        ino: InodeNumber,
        dest: MdsId,
        pop: f64,
    },

    /// Hash conversion: the dir froze / the store fetch completed.
    HashDirFrozen { ino: InodeNumber },
    HashDirComplete { ino: InodeNumber },

    /// Unhash on the authority: freeze / fetch completed.
    UnhashFrozen { ino: InodeNumber },
    UnhashComplete { ino: InodeNumber },

    /// Unhash on a shard holder: freeze / fetch completed.
    PeerUnhashFrozen { ino: InodeNumber, auth: MdsId },
    PeerUnhashComplete { ino: InodeNumber, auth: MdsId },

    /// A replica needed to re-tie a hashed dir arrived.
    GotHashedReplica {
        import_ino: InodeNumber,
        dir_ino: InodeNumber,
        replica_ino: InodeNumber,
    },
}

impl Continuation {
    /// Whether this continuation can be handed to the new authority when
    /// the subtree it waits on migrates away.
    #[must_use]
    pub fn can_redelegate(&self) -> bool {
        matches!(self, Continuation::RetryMessage(_))
    }
}

/// Waiters collected while walking an export, resolved when the ack
/// arrives: retried messages chase the subtree, the rest fail.
#[derive(Debug, Default)]
pub struct ExportWaiters {
    pub redelegate: Vec<Envelope>,
    pub fail: Vec<Continuation>,
}

impl ExportWaiters {
    pub fn assimilate(&mut self, waiters: Vec<Continuation>) {
        for c in waiters {
            match c {
                Continuation::RetryMessage(env) => self.redelegate.push(env),
                other => self.fail.push(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_msg::CacheMessage;

    #[test]
    fn only_retried_messages_redelegate() {
        let retry = Continuation::RetryMessage(Envelope::cache(
            MdsId(0),
            MdsId(1),
            CacheMessage::InodeGetReplica {
                ino: InodeNumber(9),
            },
        ));
        let internal = Continuation::HashDirFrozen {
            ino: InodeNumber(9),
        };
        assert!(retry.can_redelegate());
        assert!(!internal.can_redelegate());

        let mut part = ExportWaiters::default();
        part.assimilate(vec![retry, internal]);
        assert_eq!(part.redelegate.len(), 1);
        assert_eq!(part.fail.len(), 1);
    }
}
