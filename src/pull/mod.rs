//! Pull pipeline modules.
//!
//! The pull engine mirrors a subset of a remote content-addressed
//! repository (named branches or raw commit ids) into the local store,
//! fetching only objects the local side lacks.
//!
//! Pipeline overview:
//! 1. `run` resolves roots (refs to commit ids) and opens the transaction.
//! 2. `scan_worker` classifies metadata objects, deduplicates, and emits
//!    fetch requests for missing descendants.
//! 3. `main_loop` dispatches fetches, validates fetched bodies, and routes
//!    them through `stager` into the store; freshly staged metadata is
//!    handed back to the worker for recursion.
//! 4. Quiescence (a two-token ping/pong between the loops) detects global
//!    completion; `run` then commits and writes the updated refs.
//!
//! # Invariants
//! - Each object is fetched at most once per run (dedup tables gate every
//!   fetch emission).
//! - No transaction commit before the closure is complete and both loops
//!   are quiescent.
//! - On any error the transaction is aborted and no ref is updated.

pub mod errors;
pub mod fetcher;
pub mod fs_store;
pub mod http;
pub mod keyfile;
pub mod main_loop;
pub mod messages;
pub mod object_id;
pub mod records;
pub mod refs;
pub mod run;
pub mod scan_worker;
pub mod stager;
pub mod store;

pub use errors::{
    FetchError, KeyFileError, PullError, RecordError, StoreError, ValidationError,
};
pub use fetcher::{join_uri, CancelFlag, FetchBackend, FetchCompletion, Fetcher, FetcherConfig};
pub use fs_store::FsStore;
pub use http::{DirBackend, HttpBackend};
pub use keyfile::KeyFile;
pub use main_loop::{MainLoop, MainLoopConfig};
pub use messages::{FetchMsg, FetchTarget, PullEvent, ScanMsg, StageRequest};
pub use object_id::{Checksum, ObjectKind, ObjectName, CHECKSUM_HEX_LEN, CHECKSUM_LEN};
pub use records::{
    encode_regular_file, validate_metadata_header, CommitRecord, ContentInfo, DirMetaRecord,
    RecordLimits, TreeDirEntry, TreeRecord, RECORD_VERSION,
};
pub use refs::{
    is_checksum_string, parse_branch_head, parse_checksum, parse_ref_summary, validate_filename,
    validate_ref_name,
};
pub use run::{run_pull, PullOptions, PullReport};
pub use scan_worker::{ScanWorker, ScanWorkerConfig, MAX_RECURSION};
pub use stager::Stager;
pub use store::{ObjectStore, REPO_MODE_ARCHIVE};
