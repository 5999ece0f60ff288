//! File-backed object store.
//!
//! Layout under the repository root:
//!
//! ```text
//! config                      key file: [core] repo_version, mode
//! objects/xx/yyyy.<suffix>    committed objects, sharded on the first
//!                             checksum byte
//! refs/remotes/<remote>/<branch>
//! tmp/                        fetch temp files
//! tmp/staging/                open transaction; staged objects live here
//!                             flat as <hex>.<suffix>
//! ```
//!
//! Staged objects are visible to `has_object`/`load_variant` while the
//! transaction is open; `commit_transaction` renames them into `objects/`.
//! Renames stay on one filesystem, so a commit is a sequence of atomic
//! moves and an interrupted commit leaves objects either staged or
//! published, never half-written.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::errors::StoreError;
use super::keyfile::KeyFile;
use super::object_id::{Checksum, ObjectKind, ObjectName};
use super::refs::{parse_checksum, validate_ref_name};
use super::store::{ObjectStore, REPO_MODE_ARCHIVE};

/// Buffer size for streaming content into the staging area.
const COPY_CHUNK: usize = 64 * 1024;

/// File-backed `ObjectStore` implementation.
pub struct FsStore {
    root: PathBuf,
    tmp: PathBuf,
    staging: PathBuf,
    config: KeyFile,
    txn_open: Mutex<bool>,
}

impl FsStore {
    /// Initializes a new repository at `root` and opens it.
    ///
    /// # Errors
    /// Fails if the directory layout cannot be created or a config file
    /// already exists.
    pub fn create(root: &Path, mode: &str) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs/remotes"))?;
        fs::create_dir_all(root.join("tmp"))?;
        let config_path = root.join("config");
        if config_path.exists() {
            return Err(StoreError::Corrupt {
                detail: format!("repository already initialized at {}", root.display()),
            });
        }
        fs::write(
            &config_path,
            format!("[core]\nrepo_version=1\nmode={mode}\n"),
        )?;
        Self::open(root)
    }

    /// Opens an existing repository at `root`.
    ///
    /// # Errors
    /// Fails if the config file is missing or malformed.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let config_text = fs::read_to_string(root.join("config")).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::Corrupt {
                    detail: format!("no repository at {}", root.display()),
                }
            } else {
                StoreError::Io(err)
            }
        })?;
        let config = KeyFile::parse(&config_text)?;
        Ok(Self {
            root: root.to_path_buf(),
            tmp: root.join("tmp"),
            staging: root.join("tmp/staging"),
            config,
            txn_open: Mutex::new(false),
        })
    }

    /// Returns the configured repository mode (`[core] mode`).
    #[must_use]
    pub fn mode(&self) -> &str {
        self.config.string_with_default("core", "mode", REPO_MODE_ARCHIVE)
    }

    /// Committed location of an object.
    fn object_path(&self, name: &ObjectName) -> PathBuf {
        self.root.join(name.relative_path())
    }

    /// Staged (pre-commit) location of an object.
    fn staged_path(&self, name: &ObjectName) -> PathBuf {
        self.staging
            .join(format!("{}.{}", name.csum.to_hex(), name.kind.path_suffix()))
    }

    fn require_txn(&self) -> Result<(), StoreError> {
        if *self.txn_open.lock().expect("txn lock") {
            Ok(())
        } else {
            Err(StoreError::NoTransaction)
        }
    }

    /// Moves a finished temp file into the staging area under `name`.
    fn persist_staged(&self, temp: NamedTempFile, name: &ObjectName) -> Result<(), StoreError> {
        temp.persist(self.staged_path(name))
            .map_err(|err| StoreError::Io(err.error))?;
        Ok(())
    }
}

impl ObjectStore for FsStore {
    fn config(&self) -> Result<KeyFile, StoreError> {
        Ok(self.config.clone())
    }

    fn tmp_dir(&self) -> &Path {
        &self.tmp
    }

    fn has_object(&self, name: &ObjectName) -> Result<bool, StoreError> {
        if *self.txn_open.lock().expect("txn lock") && self.staged_path(name).is_file() {
            return Ok(true);
        }
        Ok(self.object_path(name).is_file())
    }

    fn load_variant(&self, name: &ObjectName) -> Result<Vec<u8>, StoreError> {
        let staged = self.staged_path(name);
        let path = if *self.txn_open.lock().expect("txn lock") && staged.is_file() {
            staged
        } else {
            self.object_path(name)
        };
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound { object: *name })
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    fn prepare_transaction(&self) -> Result<(), StoreError> {
        let mut open = self.txn_open.lock().expect("txn lock");
        if *open {
            return Err(StoreError::Corrupt {
                detail: "transaction already open".to_string(),
            });
        }
        // Stale staging from an interrupted run is discarded, not replayed.
        if self.staging.exists() {
            fs::remove_dir_all(&self.staging)?;
        }
        fs::create_dir_all(&self.staging)?;
        *open = true;
        Ok(())
    }

    fn commit_transaction(&self) -> Result<(), StoreError> {
        let mut open = self.txn_open.lock().expect("txn lock");
        if !*open {
            return Err(StoreError::NoTransaction);
        }
        for entry in fs::read_dir(&self.staging)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let staged_name = file_name.to_str().ok_or_else(|| StoreError::Corrupt {
                detail: "non-UTF-8 name in staging".to_string(),
            })?;
            let (hex, suffix) =
                staged_name
                    .split_once('.')
                    .ok_or_else(|| StoreError::Corrupt {
                        detail: format!("unrecognized staged file '{staged_name}'"),
                    })?;
            if hex.len() < 2 {
                return Err(StoreError::Corrupt {
                    detail: format!("unrecognized staged file '{staged_name}'"),
                });
            }
            let target_dir = self.root.join("objects").join(&hex[..2]);
            fs::create_dir_all(&target_dir)?;
            fs::rename(
                entry.path(),
                target_dir.join(format!("{}.{}", &hex[2..], suffix)),
            )?;
        }
        fs::remove_dir_all(&self.staging)?;
        *open = false;
        Ok(())
    }

    fn abort_transaction(&self) -> Result<(), StoreError> {
        let mut open = self.txn_open.lock().expect("txn lock");
        if *open && self.staging.exists() {
            fs::remove_dir_all(&self.staging)?;
        }
        *open = false;
        Ok(())
    }

    fn stage_metadata(&self, name: &ObjectName, data: &[u8]) -> Result<Checksum, StoreError> {
        self.require_txn()?;
        let computed = Checksum::from_bytes(Sha256::digest(data).into());
        let mut temp = NamedTempFile::new_in(&self.staging)?;
        temp.write_all(data)?;
        temp.flush()?;
        // File the object under its *computed* checksum: content addressing
        // holds even if the caller's expectation turns out to be wrong.
        self.persist_staged(temp, &ObjectName::new(computed, name.kind))?;
        Ok(computed)
    }

    fn stage_content(
        &self,
        expected: &Checksum,
        stream: &mut dyn Read,
        length: u64,
    ) -> Result<Checksum, StoreError> {
        self.require_txn()?;
        let mut temp = NamedTempFile::new_in(&self.staging)?;
        let mut hasher = Sha256::new();
        let mut remaining = length;
        let mut buf = [0u8; COPY_CHUNK];
        while remaining > 0 {
            let want = remaining.min(COPY_CHUNK as u64) as usize;
            let got = stream.read(&mut buf[..want])?;
            if got == 0 {
                return Err(StoreError::Corrupt {
                    detail: format!(
                        "content stream for {expected} ended {remaining} bytes early"
                    ),
                });
            }
            hasher.update(&buf[..got]);
            temp.write_all(&buf[..got])?;
            remaining -= got as u64;
        }
        temp.flush()?;
        let computed = Checksum::from_bytes(hasher.finalize().into());
        self.persist_staged(temp, &ObjectName::new(computed, ObjectKind::File))?;
        Ok(computed)
    }

    fn write_ref(&self, remote: &str, branch: &str, csum: &Checksum) -> Result<(), StoreError> {
        validate_ref_name(remote).map_err(|err| StoreError::Corrupt {
            detail: err.to_string(),
        })?;
        validate_ref_name(branch).map_err(|err| StoreError::Corrupt {
            detail: err.to_string(),
        })?;
        let path = self.root.join("refs/remotes").join(remote).join(branch);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{csum}\n"))?;
        Ok(())
    }

    fn resolve_rev(&self, refspec: &str) -> Result<Option<Checksum>, StoreError> {
        validate_ref_name(refspec).map_err(|err| StoreError::Corrupt {
            detail: err.to_string(),
        })?;
        let path = self.root.join("refs/remotes").join(refspec);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err)),
        };
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        parse_checksum(text.trim_end())
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                detail: format!("ref {refspec}: {err}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pull::object_id::ObjectKind;
    use crate::pull::records::encode_regular_file;
    use tempfile::TempDir;

    fn new_store() -> (TempDir, FsStore) {
        let dir = TempDir::new().unwrap();
        let store = FsStore::create(dir.path(), REPO_MODE_ARCHIVE).unwrap();
        (dir, store)
    }

    fn digest(data: &[u8]) -> Checksum {
        Checksum::from_bytes(Sha256::digest(data).into())
    }

    #[test]
    fn create_then_open() {
        let (dir, store) = new_store();
        assert_eq!(store.mode(), "archive");
        drop(store);
        let reopened = FsStore::open(dir.path()).unwrap();
        assert_eq!(reopened.mode(), "archive");
    }

    #[test]
    fn create_refuses_existing_repo() {
        let (dir, _store) = new_store();
        assert!(FsStore::create(dir.path(), REPO_MODE_ARCHIVE).is_err());
    }

    #[test]
    fn open_missing_repo_fails() {
        let dir = TempDir::new().unwrap();
        assert!(FsStore::open(dir.path()).is_err());
    }

    #[test]
    fn staged_metadata_visible_before_commit() {
        let (_dir, store) = new_store();
        let data = b"\x03\x01metadata-ish".to_vec();
        let name = ObjectName::new(digest(&data), ObjectKind::DirMeta);

        store.prepare_transaction().unwrap();
        assert!(!store.has_object(&name).unwrap());
        let computed = store.stage_metadata(&name, &data).unwrap();
        assert_eq!(computed, name.csum);
        assert!(store.has_object(&name).unwrap());
        assert_eq!(store.load_variant(&name).unwrap(), data);

        store.commit_transaction().unwrap();
        assert!(store.has_object(&name).unwrap());
        assert_eq!(store.load_variant(&name).unwrap(), data);
    }

    #[test]
    fn abort_discards_staged_objects() {
        let (_dir, store) = new_store();
        let data = b"\x03\x01gone".to_vec();
        let name = ObjectName::new(digest(&data), ObjectKind::DirMeta);

        store.prepare_transaction().unwrap();
        store.stage_metadata(&name, &data).unwrap();
        store.abort_transaction().unwrap();
        assert!(!store.has_object(&name).unwrap());
    }

    #[test]
    fn stage_requires_transaction() {
        let (_dir, store) = new_store();
        let data = b"x".to_vec();
        let name = ObjectName::new(digest(&data), ObjectKind::DirMeta);
        assert!(matches!(
            store.stage_metadata(&name, &data),
            Err(StoreError::NoTransaction)
        ));
    }

    #[test]
    fn stage_content_hashes_stream() {
        let (_dir, store) = new_store();
        let body = encode_regular_file(0o100644, b"payload bytes");
        let expected = digest(&body);

        store.prepare_transaction().unwrap();
        let computed = store
            .stage_content(&expected, &mut body.as_slice(), body.len() as u64)
            .unwrap();
        assert_eq!(computed, expected);
        assert!(store
            .has_object(&ObjectName::new(expected, ObjectKind::File))
            .unwrap());
    }

    #[test]
    fn stage_content_rejects_short_stream() {
        let (_dir, store) = new_store();
        let body = b"short".to_vec();
        store.prepare_transaction().unwrap();
        let err = store.stage_content(
            &digest(&body),
            &mut body.as_slice(),
            body.len() as u64 + 10,
        );
        assert!(matches!(err, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn refs_round_trip() {
        let (_dir, store) = new_store();
        let csum = digest(b"commit");
        assert_eq!(store.resolve_rev("origin/main").unwrap(), None);
        store.write_ref("origin", "main", &csum).unwrap();
        assert_eq!(store.resolve_rev("origin/main").unwrap(), Some(csum));

        // Overwrite
        let other = digest(b"commit2");
        store.write_ref("origin", "main", &other).unwrap();
        assert_eq!(store.resolve_rev("origin/main").unwrap(), Some(other));
    }

    #[test]
    fn write_ref_validates_names() {
        let (_dir, store) = new_store();
        let csum = digest(b"c");
        assert!(store.write_ref("origin", "../escape", &csum).is_err());
        assert!(store.write_ref("", "main", &csum).is_err());
    }

    #[test]
    fn prepare_discards_stale_staging() {
        let (dir, store) = new_store();
        store.prepare_transaction().unwrap();
        let data = b"\x03\x01stale".to_vec();
        let name = ObjectName::new(digest(&data), ObjectKind::DirMeta);
        store.stage_metadata(&name, &data).unwrap();
        drop(store);

        // Simulates a crashed run: staging dir left behind, new store opens.
        let store = FsStore::open(dir.path()).unwrap();
        store.prepare_transaction().unwrap();
        assert!(!store.has_object(&name).unwrap());
        store.abort_transaction().unwrap();
    }
}
