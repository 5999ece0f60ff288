//! Error types for the pull pipeline stages.
//!
//! Errors are stage-specific to keep diagnostics precise and avoid a single
//! monolithic enum that grows unbounded. All enums are `#[non_exhaustive]`
//! to allow adding variants without breaking callers; consumers should
//! include a fallback match arm.
//!
//! The top-level `PullError` maps onto the pipeline's failure classes:
//! network (`Fetch`), validation (`Validation`, `KeyFile`), integrity
//! (`ChecksumMismatch`), structural (`MaxRecursionExceeded`), and store
//! failures propagated verbatim (`Store`). The first error captured by the
//! main loop wins; later errors are dropped.

use std::fmt;
use std::io;

use super::object_id::{Checksum, ObjectKind, ObjectName};

/// Errors from the fetch backend or the fetcher's I/O threads.
#[derive(Debug)]
#[non_exhaustive]
pub enum FetchError {
    /// I/O error writing the temp file or reading the response body.
    Io(io::Error),
    /// The resource does not exist on the remote.
    NotFound { uri: String },
    /// The server answered with a non-success HTTP status.
    Status { uri: String, status: u16 },
    /// Transport-level failure (connect, TLS, protocol).
    Transport { uri: String, detail: String },
    /// The URI could not be parsed or is not supported by the backend.
    InvalidUri { uri: String, detail: &'static str },
    /// The operation was cancelled cooperatively.
    Cancelled,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "fetch I/O error: {err}"),
            Self::NotFound { uri } => write!(f, "{uri} not found on remote"),
            Self::Status { uri, status } => {
                write!(f, "fetch of {uri} failed: HTTP {status}")
            }
            Self::Transport { uri, detail } => {
                write!(f, "fetch of {uri} failed: {detail}")
            }
            Self::InvalidUri { uri, detail } => {
                write!(f, "invalid URI {uri}: {detail}")
            }
            Self::Cancelled => write!(f, "fetch cancelled"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors from the local object store.
///
/// These are propagated upward verbatim; the pull engine never retries or
/// reinterprets a store failure.
#[derive(Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// I/O error during store operations.
    Io(io::Error),
    /// The requested object is not present in the store.
    NotFound { object: ObjectName },
    /// A staging or ref operation was issued with no open transaction.
    NoTransaction,
    /// On-disk state is malformed (bad ref contents, truncated object).
    Corrupt { detail: String },
    /// The repository config could not be parsed.
    Config(KeyFileError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "store I/O error: {err}"),
            Self::NotFound { object } => write!(f, "object not found: {object}"),
            Self::NoTransaction => write!(f, "no transaction is open"),
            Self::Corrupt { detail } => write!(f, "corrupt repository: {detail}"),
            Self::Config(err) => write!(f, "repository config: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<KeyFileError> for StoreError {
    fn from(err: KeyFileError) -> Self {
        Self::Config(err)
    }
}

/// Errors from parsing serialized object records.
///
/// Records come from the network; every length and name is untrusted.
#[derive(Debug)]
#[non_exhaustive]
pub enum RecordError {
    /// Record bytes are malformed or truncated.
    Corrupt { detail: &'static str },
    /// The kind tag does not match the declared object kind.
    KindMismatch { found: u8, expected: ObjectKind },
    /// Unknown format version.
    UnsupportedVersion { found: u8 },
    /// Record exceeds the configured size limit.
    TooLarge { size: usize, max: usize },
    /// Entry count exceeds the configured limit.
    TooManyEntries { count: usize, max: usize },
    /// An embedded name exceeds the length limit.
    NameTooLong { len: usize, max: usize },
    /// An embedded name is not valid UTF-8.
    InvalidUtf8Name,
}

impl RecordError {
    /// Constructs a corruption error with a static detail string.
    #[inline]
    pub const fn corrupt(detail: &'static str) -> Self {
        Self::Corrupt { detail }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { detail } => write!(f, "corrupt record: {detail}"),
            Self::KindMismatch { found, expected } => {
                write!(f, "record kind tag {found} does not match {expected}")
            }
            Self::UnsupportedVersion { found } => {
                write!(f, "unsupported record version: {found}")
            }
            Self::TooLarge { size, max } => {
                write!(f, "record too large: {size} bytes (max: {max})")
            }
            Self::TooManyEntries { count, max } => {
                write!(f, "too many entries: {count} (max: {max})")
            }
            Self::NameTooLong { len, max } => {
                write!(f, "name too long: {len} bytes (max: {max})")
            }
            Self::InvalidUtf8Name => write!(f, "name is not valid UTF-8"),
        }
    }
}

impl std::error::Error for RecordError {}

/// Validation failures for checksums, names, and remote metadata.
#[derive(Debug)]
#[non_exhaustive]
pub enum ValidationError {
    /// A checksum string is not 64 lowercase hex characters.
    InvalidChecksum { found: String },
    /// A ref name failed syntactic validation.
    InvalidRefName { name: String, detail: &'static str },
    /// A filename inside a tree record is unusable.
    InvalidFilename { name: String, detail: &'static str },
    /// Fetched text is not valid UTF-8.
    InvalidUtf8 { what: &'static str },
    /// A ref summary line is malformed.
    MalformedSummaryLine { line: String, detail: &'static str },
    /// The remote repository's object-storage mode cannot be pulled from.
    UnsupportedRemoteMode { mode: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChecksum { found } => {
                write!(f, "invalid checksum string '{found}'")
            }
            Self::InvalidRefName { name, detail } => {
                write!(f, "invalid ref name '{name}': {detail}")
            }
            Self::InvalidFilename { name, detail } => {
                write!(f, "invalid filename '{name}': {detail}")
            }
            Self::InvalidUtf8 { what } => write!(f, "{what} is not valid UTF-8"),
            Self::MalformedSummaryLine { line, detail } => {
                write!(f, "invalid ref summary line '{line}': {detail}")
            }
            Self::UnsupportedRemoteMode { mode } => {
                write!(f, "can't pull from remote with mode \"{mode}\"")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Errors from key-file (config text) parsing.
#[derive(Debug)]
#[non_exhaustive]
pub enum KeyFileError {
    /// A line is neither a group header, a key=value pair, nor a comment.
    MalformedLine { line_no: usize, detail: &'static str },
    /// A required group is missing.
    MissingGroup { group: String },
    /// A required key is missing from a group.
    MissingKey { group: String, key: String },
}

impl fmt::Display for KeyFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedLine { line_no, detail } => {
                write!(f, "key file line {line_no}: {detail}")
            }
            Self::MissingGroup { group } => {
                write!(f, "key file has no group [{group}]")
            }
            Self::MissingKey { group, key } => {
                write!(f, "key file group [{group}] has no key '{key}'")
            }
        }
    }
}

impl std::error::Error for KeyFileError {}

/// Top-level pull failure.
///
/// Exactly one of these is surfaced per run: the main loop captures the
/// first error and discards the rest.
#[derive(Debug)]
#[non_exhaustive]
pub enum PullError {
    /// Engine-local I/O failure (temp files, thread spawn).
    Io(io::Error),
    /// Network failure (fetch or cancellation).
    Fetch(FetchError),
    /// Store failure, propagated verbatim.
    Store(StoreError),
    /// A fetched or stored record failed to parse.
    Record { object: ObjectName, err: RecordError },
    /// Checksum, name, or remote-metadata validation failed.
    Validation(ValidationError),
    /// Config text failed to parse or lacked a required key.
    KeyFile(KeyFileError),
    /// The store returned a different checksum than the one requested.
    ///
    /// This is an integrity failure: either the remote served wrong bytes
    /// for the object's name or the store is misbehaving.
    ChecksumMismatch {
        kind: ObjectKind,
        expected: Checksum,
        actual: Checksum,
    },
    /// Metadata recursion exceeded the hard depth cap.
    MaxRecursionExceeded { max: u32 },
    /// The pull was cancelled cooperatively.
    Cancelled,
    /// An engine thread went away unexpectedly (channel closed).
    Disconnected { what: &'static str },
}

impl fmt::Display for PullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Fetch(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Record { object, err } => write!(f, "object {object}: {err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::KeyFile(err) => write!(f, "{err}"),
            Self::ChecksumMismatch {
                kind,
                expected,
                actual,
            } => write!(
                f,
                "corrupted {kind} object: expected checksum {expected}, got {actual}"
            ),
            Self::MaxRecursionExceeded { max } => {
                write!(f, "exceeded maximum recursion depth ({max})")
            }
            Self::Cancelled => write!(f, "pull cancelled"),
            Self::Disconnected { what } => {
                write!(f, "internal channel closed unexpectedly: {what}")
            }
        }
    }
}

impl std::error::Error for PullError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Fetch(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Record { err, .. } => Some(err),
            Self::Validation(err) => Some(err),
            Self::KeyFile(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PullError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<FetchError> for PullError {
    fn from(err: FetchError) -> Self {
        Self::Fetch(err)
    }
}

impl From<StoreError> for PullError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<ValidationError> for PullError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<KeyFileError> for PullError {
    fn from(err: KeyFileError) -> Self {
        Self::KeyFile(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_display() {
        let err = FetchError::Status {
            uri: "http://example/objects/ab/cd.commit".into(),
            status: 404,
        };
        let msg = format!("{err}");
        assert!(msg.contains("404"));
        assert!(msg.contains("objects/ab/cd.commit"));
    }

    #[test]
    fn record_error_display() {
        let err = RecordError::TooManyEntries { count: 10, max: 4 };
        let msg = format!("{err}");
        assert!(msg.contains("10"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn checksum_mismatch_display() {
        let err = PullError::ChecksumMismatch {
            kind: ObjectKind::File,
            expected: Checksum::from_bytes([0xaa; 32]),
            actual: Checksum::from_bytes([0xbb; 32]),
        };
        let msg = format!("{err}");
        assert!(msg.contains("aa"));
        assert!(msg.contains("bb"));
        assert!(msg.contains("file"));
    }

    #[test]
    fn pull_error_from_io_via_fetch() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let pull: PullError = FetchError::from(io_err).into();
        assert!(matches!(pull, PullError::Fetch(FetchError::Io(_))));
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError::UnsupportedRemoteMode {
            mode: "bare".into(),
        };
        assert!(format!("{err}").contains("bare"));
    }
}
