//! Cache counters reported to the metrics sink.

use serde::Serialize;

/// Plain event counters. The cache is single-threaded, so these are bare
/// integers bumped inline by the handlers.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Counters {
    /// Cache misses during traversal.
    pub cmiss: u64,
    /// Directory fetches from the metadata store.
    pub rdir: u64,
    /// Discover requests sent.
    pub dis: u64,
    /// Traversals forwarded to another MDS.
    pub cfw: u64,
    /// Subtree exports initiated.
    pub ex: u64,
    /// Subtree imports completed.
    pub im: u64,
    /// Nested exports assimilated during an import.
    pub imex: u64,
    /// Nested exports that turned out to target the importer itself.
    pub immyex: u64,
    /// Inode expires hop-forwarded toward the authority.
    pub iupfw: u64,
    /// Current size of the export set.
    pub nex: u64,
    /// Current size of the import set.
    pub nim: u64,
}
