//! Content-addressed object-store synchronizer: the pull engine.
//!
//! objsync mirrors a subset of a remote repository into a local one. An
//! object is named by the SHA-256 of its serialized bytes and is one of
//! four kinds: commits, dir-trees, and dir-metas form the metadata DAG;
//! files are content leaves. A pull walks the remote DAG on demand from a
//! set of roots, fetches only objects the local side lacks, imports them
//! under a single store transaction, and finally moves the requested refs.
//!
//! High-level flow (one pull):
//! 1) Resolve roots: branch refs and raw commit ids.
//! 2) Scan worker classifies metadata, dedups, and requests what's missing.
//! 3) Main loop fetches, validates, and stages objects; staged metadata
//!    re-enters the scan.
//! 4) A two-token quiescence protocol detects completion; the transaction
//!    commits and refs are updated.
//!
//! The concurrency model is two single-threaded cooperative loops (scan
//! worker and main loop) connected by typed channels, plus small I/O and
//! staging thread pools. Dedup state is single-owner; messages carry owned
//! values.

pub mod pull;

pub use pull::{
    run_pull, CancelFlag, Checksum, DirBackend, FetchBackend, FetcherConfig, FsStore, HttpBackend,
    ObjectKind, ObjectName, ObjectStore, PullError, PullOptions, PullReport, RecordLimits,
    REPO_MODE_ARCHIVE,
};
