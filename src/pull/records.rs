//! Parsers and encoders for serialized object records.
//!
//! Every object kind has a tagged binary wire form: a one-byte kind tag
//! (the `ObjectKind` discriminant), a one-byte format version, then the
//! kind-specific fields. All integers are little-endian; embedded names are
//! length-prefixed UTF-8.
//!
//! # Record Formats (version 1)
//! ```text
//! commit:   tag=1 ver parent[32] related(u32: name csum[32]...)
//!           subject ts(u64) tree_contents[32] tree_meta[32]
//! dirtree:  tag=2 ver files(u32: name csum[32]...)
//!           dirs(u32: name tree[32] meta[32]...)
//! dirmeta:  tag=3 ver uid(u32) gid(u32) mode(u32)
//!           xattrs(u32: name value(u32-len)...)
//! content:  tag=4 ver mode(u32) symlink-target xattrs(u32-len blob)
//!           payload-len(u64) payload...
//! ```
//! `name` denotes a u16 length prefix followed by that many UTF-8 bytes.
//!
//! # Parsing Assumptions
//! - Records arrive from the network; every length field is untrusted and
//!   checked against `RecordLimits` before any allocation it sizes.
//! - Metadata records must consume their buffer exactly; trailing bytes are
//!   corruption.
//! - The content parser reads only the header from its stream; the payload
//!   is consumed separately by the store's staging path.
//!
//! # Complexity
//! - Parsing is O(record size); allocation is bounded by the entry limits.

use std::io::Read;

use super::errors::RecordError;
use super::object_id::{Checksum, ObjectKind, CHECKSUM_LEN};

/// Current wire-format version for all record kinds.
pub const RECORD_VERSION: u8 = 1;

/// Limits for record parsing.
#[derive(Debug, Clone, Copy)]
pub struct RecordLimits {
    /// Maximum serialized metadata record size in bytes.
    pub max_record_bytes: usize,
    /// Maximum entries in any one list (files, dirs, related, xattrs).
    pub max_entries: usize,
    /// Maximum length of an embedded name in bytes.
    pub max_name_bytes: usize,
    /// Maximum size of a content object's xattrs blob.
    pub max_xattrs_bytes: usize,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            max_record_bytes: 16 * 1024 * 1024, // 16 MiB
            max_entries: 262_144,
            max_name_bytes: 1024,
            max_xattrs_bytes: 1024 * 1024, // 1 MiB
        }
    }
}

/// Checks that `data` begins with the header of a `kind` record.
///
/// This is the cheap validation applied to a freshly fetched metadata body
/// before it is staged: the declared kind must match the kind the object
/// was requested as, and the version must be known. Field-level parsing
/// happens later, when the object is scanned.
pub fn validate_metadata_header(data: &[u8], kind: ObjectKind) -> Result<(), RecordError> {
    debug_assert!(kind.is_meta());
    if data.len() < 2 {
        return Err(RecordError::corrupt("record shorter than header"));
    }
    if data[0] != kind as u8 {
        return Err(RecordError::KindMismatch {
            found: data[0],
            expected: kind,
        });
    }
    if data[1] != RECORD_VERSION {
        return Err(RecordError::UnsupportedVersion { found: data[1] });
    }
    Ok(())
}

/// Parsed commit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Parent commit, if any (the zero checksum encodes "none").
    pub parent: Option<Checksum>,
    /// Related commits: `(name, commit checksum)` pairs, traversed only
    /// when the pull requests the related closure.
    pub related: Vec<(String, Checksum)>,
    /// One-line commit subject.
    pub subject: String,
    /// Commit timestamp, seconds since the epoch.
    pub timestamp: u64,
    /// The dir-tree this commit points to.
    pub tree_contents_csum: Checksum,
    /// The dir-meta this commit points to.
    pub tree_meta_csum: Checksum,
}

impl CommitRecord {
    /// Parses a commit record from its serialized form.
    ///
    /// # Errors
    /// Returns `RecordError` if the record is malformed, truncated, has
    /// trailing bytes, or exceeds a limit.
    pub fn parse(data: &[u8], limits: &RecordLimits) -> Result<Self, RecordError> {
        let mut cur = Cursor::new(data, limits)?;
        cur.expect_header(ObjectKind::Commit)?;

        let parent_raw = cur.checksum()?;
        let parent = if parent_raw.is_null() {
            None
        } else {
            Some(parent_raw)
        };

        let related_count = cur.entry_count()?;
        let mut related = Vec::with_capacity(related_count);
        for _ in 0..related_count {
            let name = cur.name()?;
            let csum = cur.checksum()?;
            related.push((name, csum));
        }

        let subject = cur.name()?;
        let timestamp = cur.u64()?;
        let tree_contents_csum = cur.checksum()?;
        let tree_meta_csum = cur.checksum()?;
        cur.expect_end()?;

        Ok(Self {
            parent,
            related,
            subject,
            timestamp,
            tree_contents_csum,
            tree_meta_csum,
        })
    }

    /// Serializes the record into its wire form.
    ///
    /// # Errors
    /// Returns `RecordError::NameTooLong` if a name exceeds the u16 length
    /// prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let mut out = Vec::with_capacity(128);
        out.push(ObjectKind::Commit as u8);
        out.push(RECORD_VERSION);
        let parent = self.parent.unwrap_or_default();
        out.extend_from_slice(parent.as_slice());
        push_u32(&mut out, self.related.len() as u32);
        for (name, csum) in &self.related {
            push_name(&mut out, name)?;
            out.extend_from_slice(csum.as_slice());
        }
        push_name(&mut out, &self.subject)?;
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.tree_contents_csum.as_slice());
        out.extend_from_slice(self.tree_meta_csum.as_slice());
        Ok(out)
    }
}

/// One subdirectory entry in a dir-tree record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDirEntry {
    /// Directory name (validated by the scanner, not the parser).
    pub name: String,
    /// Checksum of the subdirectory's dir-tree.
    pub tree_csum: Checksum,
    /// Checksum of the subdirectory's dir-meta.
    pub meta_csum: Checksum,
}

/// Parsed dir-tree record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeRecord {
    /// Regular files: `(filename, content checksum)`, in tree order.
    pub files: Vec<(String, Checksum)>,
    /// Subdirectories, in tree order.
    pub dirs: Vec<TreeDirEntry>,
}

impl TreeRecord {
    /// Parses a dir-tree record from its serialized form.
    ///
    /// # Errors
    /// Returns `RecordError` if the record is malformed, truncated, has
    /// trailing bytes, or exceeds a limit.
    pub fn parse(data: &[u8], limits: &RecordLimits) -> Result<Self, RecordError> {
        let mut cur = Cursor::new(data, limits)?;
        cur.expect_header(ObjectKind::DirTree)?;

        let file_count = cur.entry_count()?;
        let mut files = Vec::with_capacity(file_count);
        for _ in 0..file_count {
            let name = cur.name()?;
            let csum = cur.checksum()?;
            files.push((name, csum));
        }

        let dir_count = cur.entry_count()?;
        let mut dirs = Vec::with_capacity(dir_count);
        for _ in 0..dir_count {
            let name = cur.name()?;
            let tree_csum = cur.checksum()?;
            let meta_csum = cur.checksum()?;
            dirs.push(TreeDirEntry {
                name,
                tree_csum,
                meta_csum,
            });
        }
        cur.expect_end()?;

        Ok(Self { files, dirs })
    }

    /// Serializes the record into its wire form.
    ///
    /// # Errors
    /// Returns `RecordError::NameTooLong` if a name exceeds the u16 length
    /// prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let mut out = Vec::with_capacity(64);
        out.push(ObjectKind::DirTree as u8);
        out.push(RECORD_VERSION);
        push_u32(&mut out, self.files.len() as u32);
        for (name, csum) in &self.files {
            push_name(&mut out, name)?;
            out.extend_from_slice(csum.as_slice());
        }
        push_u32(&mut out, self.dirs.len() as u32);
        for dir in &self.dirs {
            push_name(&mut out, &dir.name)?;
            out.extend_from_slice(dir.tree_csum.as_slice());
            out.extend_from_slice(dir.meta_csum.as_slice());
        }
        Ok(out)
    }
}

/// Parsed dir-meta record.
///
/// The pull engine treats dir-meta as an opaque leaf; this parser exists
/// for publishers and for tests that author repositories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirMetaRecord {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Extended attributes as raw `(name, value)` pairs.
    pub xattrs: Vec<(String, Vec<u8>)>,
}

impl DirMetaRecord {
    /// Parses a dir-meta record from its serialized form.
    pub fn parse(data: &[u8], limits: &RecordLimits) -> Result<Self, RecordError> {
        let mut cur = Cursor::new(data, limits)?;
        cur.expect_header(ObjectKind::DirMeta)?;
        let uid = cur.u32()?;
        let gid = cur.u32()?;
        let mode = cur.u32()?;
        let count = cur.entry_count()?;
        let mut xattrs = Vec::with_capacity(count);
        for _ in 0..count {
            let name = cur.name()?;
            let value_len = cur.u32()? as usize;
            if value_len > cur.limits.max_xattrs_bytes {
                return Err(RecordError::TooLarge {
                    size: value_len,
                    max: cur.limits.max_xattrs_bytes,
                });
            }
            let value = cur.bytes(value_len)?.to_vec();
            xattrs.push((name, value));
        }
        cur.expect_end()?;
        Ok(Self {
            uid,
            gid,
            mode,
            xattrs,
        })
    }

    /// Serializes the record into its wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let mut out = Vec::with_capacity(32);
        out.push(ObjectKind::DirMeta as u8);
        out.push(RECORD_VERSION);
        push_u32(&mut out, self.uid);
        push_u32(&mut out, self.gid);
        push_u32(&mut out, self.mode);
        push_u32(&mut out, self.xattrs.len() as u32);
        for (name, value) in &self.xattrs {
            push_name(&mut out, name)?;
            push_u32(&mut out, value.len() as u32);
            out.extend_from_slice(value);
        }
        Ok(out)
    }
}

/// Header of an archived content object, split from its payload.
///
/// "Content-stream parsing" reads this header off the front of a fetched
/// body and leaves the reader positioned at the payload. The canonical
/// content stream (the bytes the checksum covers) is the full serialized
/// object: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    /// Unix mode bits.
    pub mode: u32,
    /// Symlink target; `None` for regular files.
    pub symlink_target: Option<String>,
    /// Raw extended-attribute blob.
    pub xattrs: Vec<u8>,
    /// Length of the payload that follows the header.
    pub payload_len: u64,
    /// Serialized header length in bytes.
    pub header_len: u64,
}

impl ContentInfo {
    /// Reads a content header from the front of `reader`.
    ///
    /// On success the reader is positioned at the first payload byte.
    ///
    /// # Errors
    /// Returns `RecordError` on truncation, a wrong kind tag, an unknown
    /// version, or an oversized field.
    pub fn read_from(reader: &mut impl Read, limits: &RecordLimits) -> Result<Self, RecordError> {
        let mut consumed: u64 = 0;

        let prelude = read_array::<2>(reader, &mut consumed)?;
        if prelude[0] != ObjectKind::File as u8 {
            return Err(RecordError::KindMismatch {
                found: prelude[0],
                expected: ObjectKind::File,
            });
        }
        if prelude[1] != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion { found: prelude[1] });
        }

        let mode = u32::from_le_bytes(read_array::<4>(reader, &mut consumed)?);

        let target_len =
            u16::from_le_bytes(read_array::<2>(reader, &mut consumed)?) as usize;
        if target_len > limits.max_name_bytes {
            return Err(RecordError::NameTooLong {
                len: target_len,
                max: limits.max_name_bytes,
            });
        }
        let target_bytes = read_vec(reader, target_len, &mut consumed)?;
        let symlink_target = if target_bytes.is_empty() {
            None
        } else {
            Some(
                String::from_utf8(target_bytes).map_err(|_| RecordError::InvalidUtf8Name)?,
            )
        };

        let xattrs_len = u32::from_le_bytes(read_array::<4>(reader, &mut consumed)?) as usize;
        if xattrs_len > limits.max_xattrs_bytes {
            return Err(RecordError::TooLarge {
                size: xattrs_len,
                max: limits.max_xattrs_bytes,
            });
        }
        let xattrs = read_vec(reader, xattrs_len, &mut consumed)?;

        let payload_len = u64::from_le_bytes(read_array::<8>(reader, &mut consumed)?);

        Ok(Self {
            mode,
            symlink_target,
            xattrs,
            payload_len,
            header_len: consumed,
        })
    }

    /// Serializes a full content object: this header followed by `payload`.
    ///
    /// `payload_len` and `header_len` are derived, not read from `self`.
    pub fn encode_with_payload(&self, payload: &[u8]) -> Result<Vec<u8>, RecordError> {
        let target = self.symlink_target.as_deref().unwrap_or("");
        if target.len() > u16::MAX as usize {
            return Err(RecordError::NameTooLong {
                len: target.len(),
                max: u16::MAX as usize,
            });
        }
        let mut out = Vec::with_capacity(32 + target.len() + self.xattrs.len() + payload.len());
        out.push(ObjectKind::File as u8);
        out.push(RECORD_VERSION);
        push_u32(&mut out, self.mode);
        out.extend_from_slice(&(target.len() as u16).to_le_bytes());
        out.extend_from_slice(target.as_bytes());
        push_u32(&mut out, self.xattrs.len() as u32);
        out.extend_from_slice(&self.xattrs);
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }
}

/// Serializes a regular-file content object with the given mode.
///
/// Convenience for publishers and tests.
pub fn encode_regular_file(mode: u32, payload: &[u8]) -> Vec<u8> {
    let info = ContentInfo {
        mode,
        symlink_target: None,
        xattrs: Vec::new(),
        payload_len: payload.len() as u64,
        header_len: 0,
    };
    // Infallible: no symlink target to overflow the length prefix.
    info.encode_with_payload(payload).expect("encode regular file")
}

// --- cursor over a complete metadata record ---

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    limits: &'a RecordLimits,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], limits: &'a RecordLimits) -> Result<Self, RecordError> {
        if data.len() > limits.max_record_bytes {
            return Err(RecordError::TooLarge {
                size: data.len(),
                max: limits.max_record_bytes,
            });
        }
        Ok(Self {
            data,
            pos: 0,
            limits,
        })
    }

    fn expect_header(&mut self, kind: ObjectKind) -> Result<(), RecordError> {
        let tag = self.u8()?;
        if tag != kind as u8 {
            return Err(RecordError::KindMismatch {
                found: tag,
                expected: kind,
            });
        }
        let version = self.u8()?;
        if version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion { found: version });
        }
        Ok(())
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], RecordError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| RecordError::corrupt("length overflow"))?;
        if end > self.data.len() {
            return Err(RecordError::corrupt("record truncated"));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, RecordError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, RecordError> {
        let raw = self.bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32, RecordError> {
        let raw = self.bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64, RecordError> {
        let raw = self.bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }

    fn checksum(&mut self) -> Result<Checksum, RecordError> {
        let raw = self.bytes(CHECKSUM_LEN)?;
        Ok(Checksum::try_from_slice(raw).expect("fixed-length slice"))
    }

    /// Reads a u32 list count and checks it against the entry limit.
    fn entry_count(&mut self) -> Result<usize, RecordError> {
        let count = self.u32()? as usize;
        if count > self.limits.max_entries {
            return Err(RecordError::TooManyEntries {
                count,
                max: self.limits.max_entries,
            });
        }
        Ok(count)
    }

    /// Reads a u16-length-prefixed UTF-8 name.
    fn name(&mut self) -> Result<String, RecordError> {
        let len = self.u16()? as usize;
        if len > self.limits.max_name_bytes {
            return Err(RecordError::NameTooLong {
                len,
                max: self.limits.max_name_bytes,
            });
        }
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| RecordError::InvalidUtf8Name)
    }

    fn expect_end(&self) -> Result<(), RecordError> {
        if self.pos != self.data.len() {
            return Err(RecordError::corrupt("trailing bytes after record"));
        }
        Ok(())
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_name(out: &mut Vec<u8>, name: &str) -> Result<(), RecordError> {
    if name.len() > u16::MAX as usize {
        return Err(RecordError::NameTooLong {
            len: name.len(),
            max: u16::MAX as usize,
        });
    }
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    Ok(())
}

fn read_array<const N: usize>(
    reader: &mut impl Read,
    consumed: &mut u64,
) -> Result<[u8; N], RecordError> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|_| RecordError::corrupt("content header truncated"))?;
    *consumed += N as u64;
    Ok(buf)
}

fn read_vec(
    reader: &mut impl Read,
    len: usize,
    consumed: &mut u64,
) -> Result<Vec<u8>, RecordError> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|_| RecordError::corrupt("content header truncated"))?;
    *consumed += len as u64;
    Ok(buf)
}
