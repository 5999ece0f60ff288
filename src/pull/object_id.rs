//! Object identifiers for the pull pipeline.
//!
//! An object is named by a `(checksum, kind)` pair. Checksums are SHA-256
//! digests stored inline as fixed-size arrays; the hex rendering is the
//! canonical textual form used in refs, summaries, and object paths.
//!
//! # Ordering Semantics
//! - `Checksum` compares lexicographically on the digest bytes.
//! - `ObjectName` compares on `(checksum, kind discriminant)`.

use std::fmt;

use super::errors::ValidationError;

/// Length of a binary checksum in bytes (SHA-256).
pub const CHECKSUM_LEN: usize = 32;

/// Length of a checksum rendered as lowercase hex.
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Fixed-size storage for a SHA-256 object checksum.
///
/// This is a compact, layout-stable container that avoids heap allocation.
/// The canonical textual form is 64 lowercase hex characters.
///
/// # Invariants
/// - All 32 bytes are significant; there is no length discriminator.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Checksum([u8; CHECKSUM_LEN]);

impl Checksum {
    /// Creates a checksum from raw digest bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(bytes)
    }

    /// Creates a checksum from a slice, returning `None` for invalid lengths.
    ///
    /// Use this for untrusted input where panicking is undesirable.
    #[must_use]
    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CHECKSUM_LEN {
            return None;
        }
        let mut storage = [0u8; CHECKSUM_LEN];
        storage.copy_from_slice(bytes);
        Some(Self(storage))
    }

    /// Parses the canonical textual form: exactly 64 lowercase hex chars.
    ///
    /// Uppercase digits are rejected; the textual form is normative, not
    /// merely conventional, because checksum strings are used as dedup keys.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidChecksum` on bad length or any
    /// non-`[0-9a-f]` character.
    pub fn from_hex(hex: &str) -> Result<Self, ValidationError> {
        let bytes = hex.as_bytes();
        if bytes.len() != CHECKSUM_HEX_LEN {
            return Err(ValidationError::InvalidChecksum {
                found: hex.to_string(),
            });
        }
        let mut storage = [0u8; CHECKSUM_LEN];
        for (i, out) in storage.iter_mut().enumerate() {
            let hi = hex_nibble(bytes[2 * i]);
            let lo = hex_nibble(bytes[2 * i + 1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => *out = (hi << 4) | lo,
                _ => {
                    return Err(ValidationError::InvalidChecksum {
                        found: hex.to_string(),
                    })
                }
            }
        }
        Ok(Self(storage))
    }

    /// Returns the digest bytes as a slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Returns the digest bytes as a fixed-size array.
    #[inline]
    #[must_use]
    pub const fn to_bytes(self) -> [u8; CHECKSUM_LEN] {
        self.0
    }

    /// Returns true if all digest bytes are zero.
    ///
    /// The zero checksum is used as the "absent" marker in commit records
    /// (a root commit has a zero parent).
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Renders the canonical 64-char lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(CHECKSUM_HEX_LEN);
        for byte in &self.0 {
            out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            out.push(HEX_DIGITS[(byte & 0xf) as usize] as char);
        }
        out
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

#[inline]
fn hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The four object kinds.
///
/// `Commit`, `DirTree`, and `DirMeta` are metadata (recursively walked);
/// `File` is a content leaf. The discriminants are stable: they double as
/// the wire-format kind tag in serialized records.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    /// Commit record; references one dir-tree and one dir-meta.
    Commit = 1,
    /// Directory tree; references files and subdirectories.
    DirTree = 2,
    /// Directory metadata; opaque leaf.
    DirMeta = 3,
    /// File content; opaque leaf, never recursed.
    File = 4,
}

impl ObjectKind {
    /// Returns true for the recursively-walked metadata kinds.
    #[inline]
    #[must_use]
    pub const fn is_meta(self) -> bool {
        !matches!(self, Self::File)
    }

    /// Maps a wire-format kind tag back to a kind.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Commit),
            2 => Some(Self::DirTree),
            3 => Some(Self::DirMeta),
            4 => Some(Self::File),
            _ => None,
        }
    }

    /// Returns the object-path suffix for this kind.
    ///
    /// Content objects use the archived per-object suffix (`filec`), the
    /// only content form this engine can pull.
    #[must_use]
    pub const fn path_suffix(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::DirTree => "dirtree",
            Self::DirMeta => "dirmeta",
            Self::File => "filec",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Commit => "commit",
            Self::DirTree => "dirtree",
            Self::DirMeta => "dirmeta",
            Self::File => "file",
        };
        write!(f, "{name}")
    }
}

/// An object name: the `(checksum, kind)` pair the engine traffics in.
///
/// Names are owned values; queue messages carry them across threads without
/// any shared state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectName {
    /// Digest of the object's canonical serialized bytes.
    pub csum: Checksum,
    /// Which of the four kinds the checksum names.
    pub kind: ObjectKind,
}

impl ObjectName {
    /// Creates an object name.
    #[inline]
    #[must_use]
    pub const fn new(csum: Checksum, kind: ObjectKind) -> Self {
        Self { csum, kind }
    }

    /// Returns the store-relative path of this object.
    ///
    /// Layout: `objects/{hex[0..2]}/{hex[2..]}.{suffix}`. The remote must
    /// use the same convention; the fetch URI is formed by joining this path
    /// onto the base URL.
    #[must_use]
    pub fn relative_path(&self) -> String {
        let hex = self.csum.to_hex();
        format!(
            "objects/{}/{}.{}",
            &hex[..2],
            &hex[2..],
            self.kind.path_suffix()
        )
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectName({self})")
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.csum, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const _: () = {
        assert!(std::mem::size_of::<Checksum>() == 32);
        assert!(std::mem::size_of::<ObjectKind>() == 1);
    };

    fn csum(fill: u8) -> Checksum {
        Checksum::from_bytes([fill; 32])
    }

    #[test]
    fn hex_round_trip() {
        let c = csum(0xab);
        let hex = c.to_hex();
        assert_eq!(hex.len(), CHECKSUM_HEX_LEN);
        assert_eq!(Checksum::from_hex(&hex).unwrap(), c);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Checksum::from_hex("").is_err());
        assert!(Checksum::from_hex("abcd").is_err());
        // Uppercase is rejected: the canonical form is lowercase.
        let upper = "AB".repeat(32);
        assert!(Checksum::from_hex(&upper).is_err());
        let bad_char = format!("zz{}", "ab".repeat(31));
        assert!(Checksum::from_hex(&bad_char).is_err());
    }

    #[test]
    fn try_from_slice_lengths() {
        assert!(Checksum::try_from_slice(&[0u8; 32]).is_some());
        assert!(Checksum::try_from_slice(&[0u8; 20]).is_none());
        assert!(Checksum::try_from_slice(&[]).is_none());
    }

    #[test]
    fn null_checksum() {
        assert!(csum(0).is_null());
        assert!(!csum(1).is_null());
    }

    #[test]
    fn kind_meta_predicate() {
        assert!(ObjectKind::Commit.is_meta());
        assert!(ObjectKind::DirTree.is_meta());
        assert!(ObjectKind::DirMeta.is_meta());
        assert!(!ObjectKind::File.is_meta());
    }

    #[test]
    fn kind_tag_round_trip() {
        for kind in [
            ObjectKind::Commit,
            ObjectKind::DirTree,
            ObjectKind::DirMeta,
            ObjectKind::File,
        ] {
            assert_eq!(ObjectKind::from_tag(kind as u8), Some(kind));
        }
        assert_eq!(ObjectKind::from_tag(0), None);
        assert_eq!(ObjectKind::from_tag(5), None);
    }

    #[test]
    fn relative_path_layout() {
        let name = ObjectName::new(csum(0xab), ObjectKind::Commit);
        let path = name.relative_path();
        assert!(path.starts_with("objects/ab/"));
        assert!(path.ends_with(".commit"));
        assert_eq!(path.len(), "objects/".len() + 2 + 1 + 62 + ".commit".len());

        let file = ObjectName::new(csum(0x01), ObjectKind::File);
        assert!(file.relative_path().ends_with(".filec"));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(csum(0x00) < csum(0x01));
        assert!(csum(0x01) < csum(0xff));
    }
}
