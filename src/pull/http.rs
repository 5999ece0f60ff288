//! Fetch backends: HTTP(S) and local directory.
//!
//! `HttpBackend` wraps a blocking reqwest client and streams response
//! bodies in bounded chunks, checking the cancel flag between reads.
//! `DirBackend` serves `file://` base URLs straight off the filesystem;
//! it exists for local mirrors and for the integration tests, which author
//! a remote repository in a temp dir and pull from it.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use super::errors::FetchError;
use super::fetcher::{CancelFlag, FetchBackend};

/// Copy chunk size for streaming bodies; also the cancellation granularity.
const BODY_CHUNK: usize = 64 * 1024;

/// Connect timeout for the HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP(S) fetch backend over a blocking reqwest client.
pub struct HttpBackend {
    client: reqwest::blocking::Client,
}

impl HttpBackend {
    /// Builds the backend with its own connection pool.
    ///
    /// # Errors
    /// Fails if the TLS stack cannot be initialized.
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| FetchError::Transport {
                uri: String::new(),
                detail: err.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl FetchBackend for HttpBackend {
    fn fetch_to(
        &self,
        uri: &str,
        dst: &mut File,
        cancel: &CancelFlag,
    ) -> Result<u64, FetchError> {
        cancel.bail()?;
        let mut response =
            self.client
                .get(uri)
                .send()
                .map_err(|err| FetchError::Transport {
                    uri: uri.to_string(),
                    detail: err.to_string(),
                })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                uri: uri.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }

        copy_body(&mut response, dst, cancel)
    }
}

/// Local-directory fetch backend for `file://` base URLs.
pub struct DirBackend;

impl DirBackend {
    /// Maps a `file://` URI to a filesystem path.
    fn uri_to_path(uri: &str) -> Result<PathBuf, FetchError> {
        let Some(path) = uri.strip_prefix("file://") else {
            return Err(FetchError::InvalidUri {
                uri: uri.to_string(),
                detail: "directory backend requires a file:// URI",
            });
        };
        Ok(PathBuf::from(path))
    }
}

impl FetchBackend for DirBackend {
    fn fetch_to(
        &self,
        uri: &str,
        dst: &mut File,
        cancel: &CancelFlag,
    ) -> Result<u64, FetchError> {
        cancel.bail()?;
        let path = Self::uri_to_path(uri)?;
        let mut src = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FetchError::NotFound {
                    uri: uri.to_string(),
                })
            }
            Err(err) => return Err(FetchError::Io(err)),
        };
        copy_body(&mut src, dst, cancel)
    }
}

/// Streams `src` into `dst`, checking `cancel` between chunks.
fn copy_body(
    src: &mut impl Read,
    dst: &mut File,
    cancel: &CancelFlag,
) -> Result<u64, FetchError> {
    let mut total: u64 = 0;
    let mut buf = [0u8; BODY_CHUNK];
    loop {
        cancel.bail()?;
        let got = src.read(&mut buf)?;
        if got == 0 {
            break;
        }
        dst.write_all(&buf[..got])?;
        total += got as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;
    use tempfile::TempDir;

    fn fetch_dir(uri: &str) -> Result<Vec<u8>, FetchError> {
        let mut dst = tempfile::tempfile().unwrap();
        DirBackend.fetch_to(uri, &mut dst, &CancelFlag::new())?;
        dst.rewind().unwrap();
        let mut body = Vec::new();
        dst.read_to_end(&mut body).unwrap();
        Ok(body)
    }

    #[test]
    fn dir_backend_serves_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config"), b"[core]\nmode=archive\n").unwrap();
        let uri = format!("file://{}/config", dir.path().display());
        assert_eq!(fetch_dir(&uri).unwrap(), b"[core]\nmode=archive\n");
    }

    #[test]
    fn dir_backend_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let uri = format!("file://{}/absent", dir.path().display());
        assert!(matches!(fetch_dir(&uri), Err(FetchError::NotFound { .. })));
    }

    #[test]
    fn dir_backend_rejects_other_schemes() {
        assert!(matches!(
            fetch_dir("http://host/config"),
            Err(FetchError::InvalidUri { .. })
        ));
    }

    #[test]
    fn dir_backend_honors_cancellation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut dst = tempfile::tempfile().unwrap();
        let uri = format!("file://{}/f", dir.path().display());
        assert!(matches!(
            DirBackend.fetch_to(&uri, &mut dst, &cancel),
            Err(FetchError::Cancelled)
        ));
    }
}
