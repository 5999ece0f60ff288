//! Local object store contract.
//!
//! The pull engine talks to the repository through this trait; the engine
//! itself never touches the on-disk object format beyond the record fields
//! it parses. Implementations must be shareable across the engine threads
//! (`Send + Sync`): the scan worker probes and loads, the stager stages,
//! and the orchestrator drives the transaction.
//!
//! # Contract
//! - Staged objects become visible to `has_object` and `load_variant`
//!   immediately, before `commit_transaction`. The scan worker relies on
//!   this: a freshly staged metadata object is scanned (and therefore
//!   loaded) while the transaction is still open.
//! - `stage_*` returns the checksum of the bytes actually staged; callers
//!   verify it against the expected checksum. The store does not enforce
//!   the match itself.
//! - `commit_transaction` publishes every staged object; nothing staged may
//!   survive `abort_transaction`.

use std::io::Read;
use std::path::Path;

use super::errors::StoreError;
use super::keyfile::KeyFile;
use super::object_id::{Checksum, ObjectName};

/// The object-storage mode this engine can pull from: one archived object
/// per file, individually addressable over HTTP.
pub const REPO_MODE_ARCHIVE: &str = "archive";

/// Transactional, content-addressed object store.
pub trait ObjectStore: Send + Sync {
    /// Returns the repository configuration (key-file form).
    fn config(&self) -> Result<KeyFile, StoreError>;

    /// Returns the directory fetch temp files should be created in.
    ///
    /// Keeping temp files on the same filesystem as the store lets staging
    /// consume them without cross-device copies.
    fn tmp_dir(&self) -> &Path;

    /// Returns whether the object is present (committed or staged).
    fn has_object(&self, name: &ObjectName) -> Result<bool, StoreError>;

    /// Loads the raw serialized bytes of a metadata object.
    ///
    /// # Errors
    /// `StoreError::NotFound` if the object is neither staged nor committed.
    fn load_variant(&self, name: &ObjectName) -> Result<Vec<u8>, StoreError>;

    /// Opens the staging transaction.
    fn prepare_transaction(&self) -> Result<(), StoreError>;

    /// Publishes all staged objects and closes the transaction.
    fn commit_transaction(&self) -> Result<(), StoreError>;

    /// Discards all staged objects and closes the transaction.
    ///
    /// A no-op when no transaction is open, so error paths can call it
    /// unconditionally.
    fn abort_transaction(&self) -> Result<(), StoreError>;

    /// Stages a metadata object from its serialized bytes.
    ///
    /// Returns the checksum of `data`; the caller compares it against the
    /// checksum the object was requested under.
    fn stage_metadata(&self, name: &ObjectName, data: &[u8]) -> Result<Checksum, StoreError>;

    /// Stages a content object from a stream of known length.
    ///
    /// Reads exactly `length` bytes from `stream` (the canonical serialized
    /// content object) and returns their checksum. A short stream is a
    /// store-level corruption error.
    fn stage_content(
        &self,
        expected: &Checksum,
        stream: &mut dyn Read,
        length: u64,
    ) -> Result<Checksum, StoreError>;

    /// Writes the ref `{remote}/{branch}`, overwriting any previous value.
    fn write_ref(&self, remote: &str, branch: &str, csum: &Checksum) -> Result<(), StoreError>;

    /// Resolves a `{remote}/{branch}` refspec to its stored checksum.
    ///
    /// Returns `Ok(None)` when the ref does not exist.
    fn resolve_rev(&self, refspec: &str) -> Result<Option<Checksum>, StoreError>;
}
