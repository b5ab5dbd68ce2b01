#![forbid(unsafe_code)]
//! Core types for the SwarmFS metadata service.
//!
//! Identifier newtypes, the POSIX-like inode record shared between cache
//! and wire, the cluster map, and the little-endian codec helpers used by
//! the migration blob format.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Inode number of the filesystem root, owned by MDS 0 at startup.
pub const ROOT_INO: InodeNumber = InodeNumber(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MdsId(pub u32);

impl fmt::Display for MdsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mds{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}", self.0)
    }
}

/// Authority of the subtree *below* an inode.
///
/// `Parent` is the inherit sentinel: the subtree belongs to whichever MDS
/// owns the inode itself, resolved by walking up the parent chain to the
/// nearest concrete value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirAuth {
    Parent,
    Mds(MdsId),
}

impl DirAuth {
    #[must_use]
    pub fn concrete(self) -> Option<MdsId> {
        match self {
            DirAuth::Parent => None,
            DirAuth::Mds(who) => Some(who),
        }
    }

    /// Wire encoding: `Parent` is -1, concrete authorities are their id.
    #[must_use]
    pub fn to_wire(self) -> i32 {
        match self {
            DirAuth::Parent => -1,
            DirAuth::Mds(MdsId(n)) => n as i32,
        }
    }

    pub fn from_wire(raw: i32) -> Result<Self, ParseError> {
        if raw == -1 {
            Ok(DirAuth::Parent)
        } else if raw >= 0 {
            Ok(DirAuth::Mds(MdsId(raw as u32)))
        } else {
            Err(ParseError::InvalidField {
                field: "dir_auth",
                reason: "negative authority other than the inherit sentinel",
            })
        }
    }
}

/// What kind of object an inode names.
///
/// A hashed dir is still a directory; its entries are sharded across the
/// cluster by dentry hash instead of living on a single authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    File,
    Dir,
    HashedDir,
}

impl InodeKind {
    #[must_use]
    pub fn is_dir(self) -> bool {
        matches!(self, InodeKind::Dir | InodeKind::HashedDir)
    }

    #[must_use]
    pub fn is_hashed(self) -> bool {
        matches!(self, InodeKind::HashedDir)
    }

    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            InodeKind::File => 0,
            InodeKind::Dir => 1,
            InodeKind::HashedDir => 2,
        }
    }

    pub fn from_wire(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(InodeKind::File),
            1 => Ok(InodeKind::Dir),
            2 => Ok(InodeKind::HashedDir),
            _ => Err(ParseError::InvalidField {
                field: "kind",
                reason: "unknown inode kind",
            }),
        }
    }
}

/// The POSIX-like inode record.
///
/// Hard metadata (uid, gid, mode) is protected by the lock regime; soft
/// metadata (size, times) by the sync regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeCore {
    pub ino: InodeNumber,
    pub kind: InodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl InodeCore {
    /// A zeroed record for a freshly allocated inode.
    #[must_use]
    pub fn new(ino: InodeNumber) -> Self {
        Self {
            ino,
            kind: InodeKind::File,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Per-dir replication policy: where readdir replicas of the dir should
/// live besides the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirRep {
    None,
    All,
    List,
}

impl DirRep {
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            DirRep::None => 0,
            DirRep::All => 1,
            DirRep::List => 2,
        }
    }

    pub fn from_wire(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(DirRep::None),
            1 => Ok(DirRep::All),
            2 => Ok(DirRep::List),
            _ => Err(ParseError::InvalidField {
                field: "dir_rep",
                reason: "unknown replication policy",
            }),
        }
    }
}

// ── Cluster map ─────────────────────────────────────────────────────────────

/// Static cluster membership: MDS ids are `0..num_mds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdsMap {
    num_mds: u32,
}

impl MdsMap {
    #[must_use]
    pub fn new(num_mds: u32) -> Self {
        assert!(num_mds > 0, "cluster must have at least one MDS");
        Self { num_mds }
    }

    #[must_use]
    pub fn num_mds(&self) -> u32 {
        self.num_mds
    }

    #[must_use]
    pub fn contains(&self, who: MdsId) -> bool {
        who.0 < self.num_mds
    }

    /// Successor in the ring, used by hop-forwarded expires.
    #[must_use]
    pub fn next(&self, who: MdsId) -> MdsId {
        MdsId((who.0 + 1) % self.num_mds)
    }

    pub fn iter(&self) -> impl Iterator<Item = MdsId> {
        (0..self.num_mds).map(MdsId)
    }

    /// Shard owner of a dentry inside a hashed dir: FNV-1a over the dir's
    /// ino and the name, reduced mod cluster size. Stable across nodes.
    #[must_use]
    pub fn hash_dentry(&self, dir_ino: InodeNumber, name: &str) -> MdsId {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut h = FNV_OFFSET;
        for b in dir_ino.0.to_le_bytes() {
            h = (h ^ u64::from(b)).wrapping_mul(FNV_PRIME);
        }
        for b in name.as_bytes() {
            h = (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME);
        }
        MdsId((h % u64::from(self.num_mds)) as u32)
    }
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// Split a slash-separated path into its segments, ignoring the leading
/// slash and empty components. `"/"` and `""` both yield no segments.
#[must_use]
pub fn path_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Join segments back into an absolute path.
#[must_use]
pub fn join_path(segments: &[String]) -> String {
    let mut out = String::new();
    for seg in segments {
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

// ── Codec helpers ───────────────────────────────────────────────────────────

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "offset + len overflows",
    })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

pub fn read_le_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    let mut buf = [0_u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

pub fn read_le_f64(data: &[u8], offset: usize) -> Result<f64, ParseError> {
    Ok(f64::from_bits(read_le_u64(data, offset)?))
}

/// Read a NUL-terminated UTF-8 string at `offset`. Returns the string and
/// the offset just past the terminator.
pub fn read_cstr(data: &[u8], offset: usize) -> Result<(String, usize), ParseError> {
    let rest = data.get(offset..).ok_or(ParseError::InsufficientData {
        needed: 1,
        offset,
        actual: 0,
    })?;
    let nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or(ParseError::UnterminatedString { offset })?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|_| ParseError::InvalidField {
            field: "name",
            reason: "not valid UTF-8",
        })?
        .to_owned();
    Ok((s, offset + nul + 1))
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("unterminated string at offset {offset}")]
    UnterminatedString { offset: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_auth_wire_round_trip() {
        assert_eq!(DirAuth::Parent.to_wire(), -1);
        assert_eq!(DirAuth::from_wire(-1).unwrap(), DirAuth::Parent);
        assert_eq!(
            DirAuth::from_wire(3).unwrap(),
            DirAuth::Mds(MdsId(3))
        );
        assert!(DirAuth::from_wire(-2).is_err());
    }

    #[test]
    fn path_segments_ignore_leading_slash_and_empties() {
        assert_eq!(path_segments("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(path_segments("a//b/"), vec!["a", "b"]);
        assert!(path_segments("/").is_empty());
        assert!(path_segments("").is_empty());
    }

    #[test]
    fn join_path_inverts_split() {
        let segs = path_segments("/a/b");
        assert_eq!(join_path(&segs), "/a/b");
        assert_eq!(join_path(&[]), "/");
    }

    #[test]
    fn cstr_reads_until_nul() {
        let buf = b"abc\0def\0";
        let (s, next) = read_cstr(buf, 0).unwrap();
        assert_eq!(s, "abc");
        assert_eq!(next, 4);
        let (s2, next2) = read_cstr(buf, next).unwrap();
        assert_eq!(s2, "def");
        assert_eq!(next2, 8);
        assert!(read_cstr(b"no-nul", 0).is_err());
    }

    #[test]
    fn hash_dentry_is_stable_and_in_range(){
        let map = MdsMap::new(5);
        let a = map.hash_dentry(InodeNumber(7), "alpha");
        let b = map.hash_dentry(InodeNumber(7), "alpha");
        assert_eq!(a, b);
        assert!(map.contains(a));
        assert_eq!(map.next(MdsId(4)), MdsId(0));
    }
}
