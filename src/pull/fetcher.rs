//! Asynchronous URI fetcher: a pool of I/O threads over a fetch backend.
//!
//! The engine's main loop submits `(uri, token)` requests; each request
//! downloads into a unique temp file and posts `(token, Result<TempPath>)`
//! onto the completion channel the fetcher was constructed with. Requests
//! are not subject to caller-side backpressure: the request channel is
//! unbounded and concurrency is bounded by the I/O thread count.
//!
//! # Ownership
//! Completed temp files are owned by the completion message. `TempPath`
//! deletes the file on drop, so temp files cannot leak on any path: an
//! undelivered completion (receiver gone), a consumed-and-dropped body,
//! and an error after delivery all end in deletion.
//!
//! # Shutdown
//! Dropping the fetcher closes the request channel and joins the I/O
//! threads; in-flight requests finish (or fail) first.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;
use tempfile::{Builder as TempBuilder, TempPath};

use super::errors::FetchError;

/// Cooperative cancellation flag, threaded through all blocking calls.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a new, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns whether cancellation was requested.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns `Err(FetchError::Cancelled)` once cancellation is requested.
    #[inline]
    pub fn bail(&self) -> Result<(), FetchError> {
        if self.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Transport backend the fetcher's I/O threads call into.
///
/// # Contract
/// On success the full body of `uri` has been written to `dst` and the
/// byte count returned; a partial write must surface as an error instead.
/// Implementations check `cancel` between chunks so a cancelled pull stops
/// promptly mid-download.
pub trait FetchBackend: Send + Sync + 'static {
    /// Downloads `uri` into `dst`, returning the number of bytes written.
    fn fetch_to(&self, uri: &str, dst: &mut File, cancel: &CancelFlag)
        -> Result<u64, FetchError>;
}

/// Joins a relative resource path onto a base URL.
#[must_use]
pub fn join_uri(base: &str, rel: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        rel.trim_start_matches('/')
    )
}

/// A finished fetch: the caller's token plus the downloaded temp file.
pub struct FetchCompletion<T> {
    /// The token the request was submitted with.
    pub token: T,
    /// The downloaded body, owned by the receiver.
    pub result: Result<TempPath, FetchError>,
}

/// Fetcher configuration.
#[derive(Debug, Clone, Copy)]
pub struct FetcherConfig {
    /// Number of concurrent I/O threads (the HTTP concurrency cap).
    pub io_threads: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self { io_threads: 8 }
    }
}

struct FetchRequest<T> {
    uri: String,
    token: T,
}

/// Pool of I/O threads downloading URIs into temp files.
pub struct Fetcher<T: Send + 'static> {
    requests: Option<chan::Sender<FetchRequest<T>>>,
    threads: Vec<JoinHandle<()>>,
    bytes_transferred: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Fetcher<T> {
    /// Spawns the I/O threads.
    ///
    /// `tmp_dir` is where temp files are created (the store's tmp dir, so
    /// staging never crosses filesystems). Completions are posted to
    /// `completions`; if the receiver is gone they are dropped, deleting
    /// the temp file.
    pub fn new(
        backend: Arc<dyn FetchBackend>,
        tmp_dir: PathBuf,
        completions: chan::Sender<FetchCompletion<T>>,
        cancel: CancelFlag,
        config: FetcherConfig,
    ) -> std::io::Result<Self> {
        let (req_tx, req_rx) = chan::unbounded::<FetchRequest<T>>();
        let bytes_transferred = Arc::new(AtomicU64::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::with_capacity(config.io_threads.max(1));
        for idx in 0..config.io_threads.max(1) {
            let rx = req_rx.clone();
            let tx = completions.clone();
            let backend = Arc::clone(&backend);
            let tmp_dir = tmp_dir.clone();
            let cancel = cancel.clone();
            let bytes = Arc::clone(&bytes_transferred);
            let active = Arc::clone(&active);

            let handle = thread::Builder::new()
                .name(format!("pull-io-{idx}"))
                .spawn(move || {
                    for req in rx.iter() {
                        active.fetch_add(1, Ordering::Relaxed);
                        let result =
                            fetch_one(backend.as_ref(), &tmp_dir, &req.uri, &cancel, &bytes);
                        active.fetch_sub(1, Ordering::Relaxed);
                        // A closed receiver means the engine is tearing
                        // down; the dropped TempPath deletes the file.
                        let _ = tx.send(FetchCompletion {
                            token: req.token,
                            result,
                        });
                    }
                })?;
            threads.push(handle);
        }

        Ok(Self {
            requests: Some(req_tx),
            threads,
            bytes_transferred,
            active,
        })
    }

    /// Submits a request. Completions arrive in whatever order the I/O
    /// threads finish, each carrying its token back.
    pub fn request(&self, uri: String, token: T) {
        let sender = self.requests.as_ref().expect("fetcher running");
        // The request channel outlives all senders until drop; a failure
        // here means the pool is gone and the run is already tearing down.
        let _ = sender.send(FetchRequest { uri, token });
    }

    /// Total body bytes transferred so far.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// One-line textual state summary for status rendering.
    #[must_use]
    pub fn state_text(&self) -> String {
        match self.active.load(Ordering::Relaxed) {
            0 => "idle".to_string(),
            n => format!("{n} transfers in progress"),
        }
    }
}

impl<T: Send + 'static> Drop for Fetcher<T> {
    fn drop(&mut self) {
        // Close the request channel, then wait for in-flight work.
        self.requests.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn fetch_one(
    backend: &dyn FetchBackend,
    tmp_dir: &Path,
    uri: &str,
    cancel: &CancelFlag,
    bytes: &AtomicU64,
) -> Result<TempPath, FetchError> {
    cancel.bail()?;
    let mut temp = TempBuilder::new().prefix("fetch-").tempfile_in(tmp_dir)?;
    let written = backend.fetch_to(uri, temp.as_file_mut(), cancel)?;
    bytes.fetch_add(written, Ordering::Relaxed);
    Ok(temp.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Backend that serves fixed bytes for any URI ending in a known name.
    struct StubBackend;

    impl FetchBackend for StubBackend {
        fn fetch_to(
            &self,
            uri: &str,
            dst: &mut File,
            cancel: &CancelFlag,
        ) -> Result<u64, FetchError> {
            cancel.bail()?;
            if uri.ends_with("missing") {
                return Err(FetchError::NotFound { uri: uri.into() });
            }
            let body = format!("body-of:{uri}");
            dst.write_all(body.as_bytes())?;
            Ok(body.len() as u64)
        }
    }

    fn new_fetcher(
        cancel: CancelFlag,
    ) -> (TempDir, Fetcher<u32>, chan::Receiver<FetchCompletion<u32>>) {
        let tmp = TempDir::new().unwrap();
        let (tx, rx) = chan::unbounded();
        let fetcher = Fetcher::new(
            Arc::new(StubBackend),
            tmp.path().to_path_buf(),
            tx,
            cancel,
            FetcherConfig { io_threads: 2 },
        )
        .unwrap();
        (tmp, fetcher, rx)
    }

    #[test]
    fn join_uri_normalizes_slashes() {
        assert_eq!(join_uri("http://x/repo", "config"), "http://x/repo/config");
        assert_eq!(join_uri("http://x/repo/", "config"), "http://x/repo/config");
        assert_eq!(
            join_uri("http://x/repo/", "/refs/heads/main"),
            "http://x/repo/refs/heads/main"
        );
    }

    #[test]
    fn completion_carries_token_and_body() {
        let (_tmp, fetcher, rx) = new_fetcher(CancelFlag::new());
        fetcher.request("http://r/objects/ab.commit".into(), 7);

        let done = rx.recv().unwrap();
        assert_eq!(done.token, 7);
        let path = done.result.unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "body-of:http://r/objects/ab.commit");
        assert!(fetcher.bytes_transferred() > 0);
    }

    #[test]
    fn temp_file_deleted_on_drop() {
        let (_tmp, fetcher, rx) = new_fetcher(CancelFlag::new());
        fetcher.request("http://r/x".into(), 0);
        let done = rx.recv().unwrap();
        let path_buf = done.result.as_ref().unwrap().to_path_buf();
        assert!(path_buf.exists());
        drop(done);
        assert!(!path_buf.exists());
    }

    #[test]
    fn error_result_carries_no_temp_file() {
        let (_tmp, fetcher, rx) = new_fetcher(CancelFlag::new());
        fetcher.request("http://r/missing".into(), 1);
        let done = rx.recv().unwrap();
        assert!(matches!(done.result, Err(FetchError::NotFound { .. })));
    }

    #[test]
    fn cancelled_flag_fails_new_requests() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let (_tmp, fetcher, rx) = new_fetcher(cancel);
        fetcher.request("http://r/x".into(), 2);
        let done = rx.recv().unwrap();
        assert!(matches!(done.result, Err(FetchError::Cancelled)));
    }

    #[test]
    fn bytes_accumulate_across_requests() {
        let (_tmp, fetcher, rx) = new_fetcher(CancelFlag::new());
        fetcher.request("http://r/a".into(), 0);
        fetcher.request("http://r/b".into(), 1);
        let _a = rx.recv().unwrap();
        let _b = rx.recv().unwrap();
        let expected = "body-of:http://r/a".len() + "body-of:http://r/b".len();
        assert_eq!(fetcher.bytes_transferred(), expected as u64);
    }
}
