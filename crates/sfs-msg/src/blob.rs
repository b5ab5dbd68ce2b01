//! Dense little-endian codec for the subtree-migration state blob.
//!
//! An `ExportDir` (and the hash/unhash shard messages) carry a packed walk
//! of the transferred subtree: one directory block per dir, depth first,
//! the subtree root first. A directory block is a fixed header, the
//! replication list, then `nitems` entries of NUL-terminated name followed
//! by a fixed inode record and its `cached_by` list. No alignment padding
//! anywhere.

use serde::{Deserialize, Serialize};
use sfs_types::{
    read_cstr, read_le_f64, read_le_i32, read_le_u32, read_le_u64, read_le_u8, DirAuth, DirRep,
    InodeCore, InodeKind, InodeNumber, MdsId, ParseError,
};

/// Fixed-size prefix of a directory block.
///
/// Layout: ino u64 ‖ nitems u32 ‖ version u64 ‖ state u32 ‖ dir_rep u8 ‖
/// ndir_rep_by u32 ‖ popularity f64, then `ndir_rep_by × u32` MDS ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirExportHeader {
    pub ino: InodeNumber,
    pub nitems: u32,
    pub version: u64,
    pub state: u32,
    pub dir_rep: DirRep,
    pub dir_rep_by: Vec<MdsId>,
    pub popularity: f64,
}

/// Per-entry inode record.
///
/// Layout: ino u64 ‖ kind u8 ‖ mode u32 ‖ uid u32 ‖ gid u32 ‖ size u64 ‖
/// atime u64 ‖ mtime u64 ‖ ctime u64 ‖ dir_auth i32 ‖ version u64 ‖
/// popularity f64 ‖ dirty u8 ‖ softasync u8 ‖ ncached_by u32, then
/// `ncached_by × u32` MDS ids. Sync and lock grants are deliberately not
/// part of the record: they do not survive migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InodeExportRecord {
    pub core: InodeCore,
    pub dir_auth: DirAuth,
    pub version: u64,
    pub popularity: f64,
    pub dirty: bool,
    pub softasync: bool,
    pub cached_by: Vec<MdsId>,
}

/// Appends blob elements to a growing byte buffer.
#[derive(Debug, Default)]
pub struct BlobWriter {
    buf: Vec<u8>,
}

impl BlobWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_dir_header(&mut self, hdr: &DirExportHeader) {
        self.buf.extend_from_slice(&hdr.ino.0.to_le_bytes());
        self.buf.extend_from_slice(&hdr.nitems.to_le_bytes());
        self.buf.extend_from_slice(&hdr.version.to_le_bytes());
        self.buf.extend_from_slice(&hdr.state.to_le_bytes());
        self.buf.push(hdr.dir_rep.to_wire());
        let nrep = hdr.dir_rep_by.len() as u32;
        self.buf.extend_from_slice(&nrep.to_le_bytes());
        self.buf.extend_from_slice(&hdr.popularity.to_bits().to_le_bytes());
        for who in &hdr.dir_rep_by {
            self.buf.extend_from_slice(&who.0.to_le_bytes());
        }
    }

    pub fn push_entry(&mut self, name: &str, rec: &InodeExportRecord) {
        debug_assert!(!name.as_bytes().contains(&0));
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);

        let core = &rec.core;
        self.buf.extend_from_slice(&core.ino.0.to_le_bytes());
        self.buf.push(core.kind.to_wire());
        self.buf.extend_from_slice(&core.mode.to_le_bytes());
        self.buf.extend_from_slice(&core.uid.to_le_bytes());
        self.buf.extend_from_slice(&core.gid.to_le_bytes());
        self.buf.extend_from_slice(&core.size.to_le_bytes());
        self.buf.extend_from_slice(&core.atime.to_le_bytes());
        self.buf.extend_from_slice(&core.mtime.to_le_bytes());
        self.buf.extend_from_slice(&core.ctime.to_le_bytes());
        self.buf.extend_from_slice(&rec.dir_auth.to_wire().to_le_bytes());
        self.buf.extend_from_slice(&rec.version.to_le_bytes());
        self.buf.extend_from_slice(&rec.popularity.to_bits().to_le_bytes());
        self.buf.push(u8::from(rec.dirty));
        self.buf.push(u8::from(rec.softasync));
        let nby = rec.cached_by.len() as u32;
        self.buf.extend_from_slice(&nby.to_le_bytes());
        for who in &rec.cached_by {
            self.buf.extend_from_slice(&who.0.to_le_bytes());
        }
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Cursor over a received blob.
#[derive(Debug)]
pub struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_dir_header(&mut self) -> Result<DirExportHeader, ParseError> {
        let p = self.pos;
        let ino = InodeNumber(read_le_u64(self.data, p)?);
        let nitems = read_le_u32(self.data, p + 8)?;
        let version = read_le_u64(self.data, p + 12)?;
        let state = read_le_u32(self.data, p + 20)?;
        let dir_rep = DirRep::from_wire(read_le_u8(self.data, p + 24)?)?;
        let nrep = read_le_u32(self.data, p + 25)?;
        let popularity = read_le_f64(self.data, p + 29)?;
        let mut at = p + 37;
        let mut dir_rep_by = Vec::with_capacity(nrep as usize);
        for _ in 0..nrep {
            dir_rep_by.push(MdsId(read_le_u32(self.data, at)?));
            at += 4;
        }
        self.pos = at;
        Ok(DirExportHeader {
            ino,
            nitems,
            version,
            state,
            dir_rep,
            dir_rep_by,
            popularity,
        })
    }

    pub fn read_entry(&mut self) -> Result<(String, InodeExportRecord), ParseError> {
        let (name, mut p) = read_cstr(self.data, self.pos)?;

        let ino = InodeNumber(read_le_u64(self.data, p)?);
        let kind = InodeKind::from_wire(read_le_u8(self.data, p + 8)?)?;
        let mode = read_le_u32(self.data, p + 9)?;
        let uid = read_le_u32(self.data, p + 13)?;
        let gid = read_le_u32(self.data, p + 17)?;
        let size = read_le_u64(self.data, p + 21)?;
        let atime = read_le_u64(self.data, p + 29)?;
        let mtime = read_le_u64(self.data, p + 37)?;
        let ctime = read_le_u64(self.data, p + 45)?;
        let dir_auth = DirAuth::from_wire(read_le_i32(self.data, p + 53)?)?;
        let version = read_le_u64(self.data, p + 57)?;
        let popularity = read_le_f64(self.data, p + 65)?;
        let dirty = read_le_u8(self.data, p + 73)? != 0;
        let softasync = read_le_u8(self.data, p + 74)? != 0;
        let nby = read_le_u32(self.data, p + 75)?;
        p += 79;
        let mut cached_by = Vec::with_capacity(nby as usize);
        for _ in 0..nby {
            cached_by.push(MdsId(read_le_u32(self.data, p)?));
            p += 4;
        }
        self.pos = p;

        Ok((
            name,
            InodeExportRecord {
                core: InodeCore {
                    ino,
                    kind,
                    mode,
                    uid,
                    gid,
                    size,
                    atime,
                    mtime,
                    ctime,
                },
                dir_auth,
                version,
                popularity,
                dirty,
                softasync,
                cached_by,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(ino: u64) -> InodeExportRecord {
        let mut core = InodeCore::new(InodeNumber(ino));
        core.kind = InodeKind::Dir;
        core.mode = 0o755;
        core.size = 4096;
        core.mtime = 1234;
        InodeExportRecord {
            core,
            dir_auth: DirAuth::Parent,
            version: 7,
            popularity: 1.5,
            dirty: true,
            softasync: false,
            cached_by: vec![MdsId(2), MdsId(4)],
        }
    }

    #[test]
    fn dir_block_round_trips() {
        let hdr = DirExportHeader {
            ino: InodeNumber(42),
            nitems: 2,
            version: 9,
            state: 0b101,
            dir_rep: DirRep::List,
            dir_rep_by: vec![MdsId(1), MdsId(3)],
            popularity: 0.25,
        };

        let mut w = BlobWriter::new();
        w.push_dir_header(&hdr);
        w.push_entry("alpha", &sample_record(100));
        w.push_entry("beta", &sample_record(101));
        let bytes = w.finish();

        let mut r = BlobReader::new(&bytes);
        let got = r.read_dir_header().expect("header");
        assert_eq!(got, hdr);

        let (name_a, rec_a) = r.read_entry().expect("entry a");
        assert_eq!(name_a, "alpha");
        assert_eq!(rec_a, sample_record(100));

        let (name_b, _) = r.read_entry().expect("entry b");
        assert_eq!(name_b, "beta");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_blob_is_an_error() {
        let mut w = BlobWriter::new();
        w.push_entry("x", &sample_record(1));
        let mut bytes = w.finish();
        bytes.truncate(bytes.len() - 3);

        let mut r = BlobReader::new(&bytes);
        assert!(r.read_entry().is_err());
    }

    #[test]
    fn names_may_not_embed_nul() {
        // NUL terminates the name on the wire; the writer refuses it in
        // debug builds and the reader would mis-split it otherwise.
        let mut w = BlobWriter::new();
        w.push_entry("plain", &sample_record(5));
        let bytes = w.finish();
        let mut r = BlobReader::new(&bytes);
        let (name, _) = r.read_entry().expect("entry");
        assert_eq!(name, "plain");
    }
}
