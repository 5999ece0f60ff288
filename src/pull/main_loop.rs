//! Main loop: fetch dispatch, staging continuations, and termination.
//!
//! The loop runs on the orchestrator's thread and owns the fetcher, the
//! stager handle, the outstanding counters, and the quiescence state. Each
//! turn handles exactly one message from `to_fetch` or one completion
//! event, then re-evaluates termination.
//!
//! # Quiescence
//! A bare "both queues empty and nothing outstanding" check is racy: the
//! worker can report idle at the same moment a fetch completion is about
//! to hand it fresh work. The two-round token closes the race:
//!
//! 1. On `ScanIdle` (and not already idle), bump `idle_serial` and send
//!    `MainIdle(idle_serial)` to the worker.
//! 2. The worker drains its queue and echoes the token back.
//! 3. An echo matching the current serial proves the worker saw nothing
//!    after the last `Scan` this loop could have sent; stale serials are
//!    ignored.
//!
//! Any `Scan` posted by a stage completion clears `metadata_scan_idle`
//! first, so the flag can only be true while no fetch-driven work can
//! still appear. Termination requires the flag plus all four outstanding
//! counters at zero.
//!
//! # Error capture
//! The first error wins (`caught_error`); later errors are dropped, the
//! cancel flag is raised so I/O threads stop early, and the loop exits.

use std::fs::{self, File};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel as chan;
use memmap2::Mmap;
use tempfile::TempPath;

use super::errors::{FetchError, PullError, ValidationError};
use super::fetcher::{join_uri, CancelFlag, FetchCompletion, Fetcher};
use super::messages::{FetchMsg, FetchTarget, PullEvent, ScanMsg, StageRequest};
use super::object_id::ObjectName;
use super::records::{validate_metadata_header, ContentInfo, RecordLimits};
use super::stager::Stager;

/// Construction parameters for the main loop.
pub struct MainLoopConfig {
    pub fetcher: Fetcher<FetchTarget>,
    pub fetch_done: chan::Receiver<FetchCompletion<FetchTarget>>,
    pub events: chan::Receiver<PullEvent>,
    pub stager: Stager,
    pub to_scan: chan::Sender<ScanMsg>,
    pub to_fetch: chan::Receiver<FetchMsg>,
    pub base_url: String,
    pub limits: RecordLimits,
    pub verbose: bool,
    pub cancel: CancelFlag,
    pub n_scanned_metadata: Arc<AtomicU32>,
}

/// The engine's main event loop.
pub struct MainLoop {
    fetcher: Fetcher<FetchTarget>,
    fetch_done: chan::Receiver<FetchCompletion<FetchTarget>>,
    events: chan::Receiver<PullEvent>,
    stager: Stager,
    to_scan: chan::Sender<ScanMsg>,
    to_fetch: chan::Receiver<FetchMsg>,
    base_url: String,
    limits: RecordLimits,
    verbose: bool,
    cancel: CancelFlag,
    n_scanned_metadata: Arc<AtomicU32>,

    idle_serial: u32,
    metadata_scan_idle: bool,
    caught_error: Option<PullError>,

    outstanding_uri_requests: u32,
    next_plain_serial: u64,

    n_outstanding_metadata_fetches: u32,
    n_outstanding_metadata_stage_requests: u32,
    n_outstanding_content_fetches: u32,
    n_outstanding_content_stage_requests: u32,
    n_requested_metadata: u32,
    n_requested_content: u32,
    n_fetched_metadata: u32,
    n_fetched_content: u32,
}

impl MainLoop {
    pub fn new(config: MainLoopConfig) -> Self {
        Self {
            fetcher: config.fetcher,
            fetch_done: config.fetch_done,
            events: config.events,
            stager: config.stager,
            to_scan: config.to_scan,
            to_fetch: config.to_fetch,
            base_url: config.base_url,
            limits: config.limits,
            verbose: config.verbose,
            cancel: config.cancel,
            n_scanned_metadata: config.n_scanned_metadata,
            idle_serial: 0,
            metadata_scan_idle: false,
            caught_error: None,
            outstanding_uri_requests: 0,
            next_plain_serial: 0,
            n_outstanding_metadata_fetches: 0,
            n_outstanding_metadata_stage_requests: 0,
            n_outstanding_content_fetches: 0,
            n_outstanding_content_stage_requests: 0,
            n_requested_metadata: 0,
            n_requested_content: 0,
            n_fetched_metadata: 0,
            n_fetched_content: 0,
        }
    }

    /// Phase 1: fetches a single URI and returns its body as UTF-8 text.
    ///
    /// Used for the remote config, branch heads, and the ref summary. This
    /// phase terminates when `outstanding_uri_requests` drops to zero; the
    /// object-name queues play no part in it.
    pub fn fetch_uri_text(&mut self, rel_path: &str) -> Result<String, PullError> {
        let uri = join_uri(&self.base_url, rel_path);
        let serial = self.next_plain_serial;
        self.next_plain_serial += 1;
        self.outstanding_uri_requests += 1;
        self.fetcher.request(uri, FetchTarget::Plain(serial));

        let fetch_done = self.fetch_done.clone();
        let mut body: Option<TempPath> = None;
        let mut first_error: Option<FetchError> = None;
        while self.outstanding_uri_requests > 0 {
            let done = fetch_done
                .recv()
                .map_err(|_| PullError::Disconnected { what: "fetcher" })?;
            match done.token {
                FetchTarget::Plain(done_serial) => {
                    self.outstanding_uri_requests -= 1;
                    match done.result {
                        Ok(temp) if done_serial == serial => body = Some(temp),
                        Ok(_stale) => {}
                        Err(err) => first_error = first_error.or(Some(err)),
                    }
                }
                FetchTarget::Object(_) => {
                    // Object completions belong to phase 2 and cannot be in
                    // flight yet.
                    debug_assert!(false, "object completion during ref fetch");
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err.into());
        }

        let temp = body.ok_or(PullError::Disconnected {
            what: "uri fetch completion",
        })?;
        let bytes = fs::read(&temp)?;
        String::from_utf8(bytes)
            .map_err(|_| ValidationError::InvalidUtf8 { what: "fetched text" }.into())
    }

    /// Phase 2: runs the scan/fetch pipeline to quiescence or first error.
    ///
    /// Primes the quiescence protocol, then handles one message or event
    /// per turn until the termination condition holds.
    pub fn run(&mut self) -> Result<(), PullError> {
        self.idle_serial += 1;
        self.send_scan(ScanMsg::MainIdle(self.idle_serial));

        let to_fetch = self.to_fetch.clone();
        let fetch_done = self.fetch_done.clone();
        let events = self.events.clone();

        loop {
            if self.caught_error.is_some() || self.termination_reached() {
                break;
            }
            chan::select! {
                recv(to_fetch) -> msg => match msg {
                    Ok(msg) => self.handle_fetch_msg(msg),
                    Err(_) => self.throw(PullError::Disconnected { what: "to_fetch" }),
                },
                recv(fetch_done) -> done => match done {
                    Ok(done) => self.handle_fetch_completion(done),
                    Err(_) => self.throw(PullError::Disconnected { what: "fetcher" }),
                },
                recv(events) -> event => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => self.throw(PullError::Disconnected { what: "events" }),
                },
            }
        }

        match self.caught_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Total body bytes transferred by the fetcher.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.fetcher.bytes_transferred()
    }

    /// Metadata objects fetched and staged this run.
    #[must_use]
    pub fn n_fetched_metadata(&self) -> u32 {
        self.n_fetched_metadata
    }

    /// Content objects fetched and staged this run.
    #[must_use]
    pub fn n_fetched_content(&self) -> u32 {
        self.n_fetched_content
    }

    /// Metadata objects scanned this run (worker-owned atomic).
    #[must_use]
    pub fn n_scanned_metadata(&self) -> u32 {
        self.n_scanned_metadata.load(Ordering::Relaxed)
    }

    /// One-line progress summary in the classic status format.
    #[must_use]
    pub fn status_line(&self) -> String {
        let mut status = String::new();
        if !self.metadata_scan_idle {
            status.push_str(&format!("scan: {} metadata; ", self.n_scanned_metadata()));
        }
        let outstanding_stages = self.n_outstanding_metadata_stage_requests
            + self.n_outstanding_content_stage_requests;
        if outstanding_stages > 0 {
            status.push_str(&format!("writing: {outstanding_stages} objects; "));
        }
        let outstanding_fetches =
            self.n_outstanding_metadata_fetches + self.n_outstanding_content_fetches;
        if outstanding_fetches > 0 {
            status.push_str(&format!(
                "fetch: {}/{} metadata {}/{} content; {}",
                self.n_fetched_metadata,
                self.n_requested_metadata,
                self.n_fetched_content,
                self.n_requested_content,
                self.fetcher.state_text()
            ));
        }
        status
    }

    fn termination_reached(&self) -> bool {
        self.metadata_scan_idle
            && self.n_outstanding_metadata_fetches == 0
            && self.n_outstanding_content_fetches == 0
            && self.n_outstanding_metadata_stage_requests == 0
            && self.n_outstanding_content_stage_requests == 0
    }

    /// At-most-once error capture; the first error also raises the cancel
    /// flag so in-flight downloads stop early.
    fn throw(&mut self, err: PullError) {
        if self.caught_error.is_none() {
            self.cancel.cancel();
            self.caught_error = Some(err);
        }
    }

    fn send_scan(&mut self, msg: ScanMsg) {
        if self.to_scan.send(msg).is_err() {
            self.throw(PullError::Disconnected { what: "to_scan" });
        }
    }

    fn handle_fetch_msg(&mut self, msg: FetchMsg) {
        match msg {
            FetchMsg::Fetch(name) => self.dispatch_fetch(name),
            FetchMsg::ScanIdle => {
                if !self.metadata_scan_idle {
                    self.idle_serial += 1;
                    self.send_scan(ScanMsg::MainIdle(self.idle_serial));
                }
            }
            FetchMsg::MainIdle(serial) => {
                if serial == self.idle_serial {
                    debug_assert!(!self.metadata_scan_idle);
                    self.metadata_scan_idle = true;
                    if self.verbose {
                        eprintln!("pull: metadata scan is idle");
                    }
                }
            }
        }
    }

    fn dispatch_fetch(&mut self, name: ObjectName) {
        let uri = join_uri(&self.base_url, &name.relative_path());
        if name.kind.is_meta() {
            self.n_outstanding_metadata_fetches += 1;
            self.n_requested_metadata += 1;
        } else {
            self.n_outstanding_content_fetches += 1;
            self.n_requested_content += 1;
        }
        self.fetcher.request(uri, FetchTarget::Object(name));
    }

    fn handle_fetch_completion(&mut self, done: FetchCompletion<FetchTarget>) {
        let name = match done.token {
            FetchTarget::Object(name) => name,
            FetchTarget::Plain(_) => {
                // Ref-phase completions never reach the main phase.
                debug_assert!(false, "plain completion during object pull");
                return;
            }
        };
        if name.kind.is_meta() {
            self.n_outstanding_metadata_fetches -= 1;
        } else {
            self.n_outstanding_content_fetches -= 1;
        }

        let result = match done.result {
            Ok(temp) => {
                if self.verbose {
                    eprintln!("pull: fetch of {name} complete");
                }
                if name.kind.is_meta() {
                    self.on_metadata_fetched(name, temp)
                } else {
                    self.on_content_fetched(name, temp)
                }
            }
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            self.throw(err);
        }
    }

    /// Metadata continuation: map the body, validate the record header
    /// against the declared kind, and hand it to the stager.
    fn on_metadata_fetched(&mut self, name: ObjectName, temp: TempPath) -> Result<(), PullError> {
        let file = File::open(&temp)?;
        // SAFETY: the temp file is exclusively owned by this run and not
        // resized while mapped.
        let data = unsafe { Mmap::map(&file)? };
        validate_metadata_header(&data, name.kind)
            .map_err(|err| PullError::Record { object: name, err })?;

        self.n_outstanding_metadata_stage_requests += 1;
        self.stager
            .submit(StageRequest::Metadata { name, data, temp });
        Ok(())
    }

    /// Content continuation: split the body into file-info, xattrs, and
    /// payload, then hand the canonical stream to the stager.
    fn on_content_fetched(&mut self, name: ObjectName, temp: TempPath) -> Result<(), PullError> {
        let mut file = File::open(&temp)?;
        let info = ContentInfo::read_from(&mut file, &self.limits)
            .map_err(|err| PullError::Record { object: name, err })?;
        let file_len = file.metadata()?.len();
        if info.header_len.checked_add(info.payload_len) != Some(file_len) {
            return Err(PullError::Record {
                object: name,
                err: super::errors::RecordError::corrupt("content length mismatch"),
            });
        }

        self.n_outstanding_content_stage_requests += 1;
        self.stager.submit(StageRequest::Content {
            name,
            temp,
            length: file_len,
        });
        Ok(())
    }

    fn handle_event(&mut self, event: PullEvent) {
        match event {
            PullEvent::Staged { name, result } => {
                if name.kind.is_meta() {
                    self.n_outstanding_metadata_stage_requests -= 1;
                } else {
                    self.n_outstanding_content_stage_requests -= 1;
                }
                match result {
                    Err(err) => self.throw(err.into()),
                    Ok(actual) if actual != name.csum => {
                        self.throw(PullError::ChecksumMismatch {
                            kind: name.kind,
                            expected: name.csum,
                            actual,
                        });
                    }
                    Ok(_) => {
                        if self.verbose {
                            eprintln!("pull: stage of {name} complete");
                        }
                        if name.kind.is_meta() {
                            self.n_fetched_metadata += 1;
                            // The freshly staged object can generate new
                            // scan work: leave idle state before the worker
                            // sees the message.
                            self.metadata_scan_idle = false;
                            self.send_scan(ScanMsg::Scan(name));
                        } else {
                            self.n_fetched_content += 1;
                        }
                    }
                }
            }
            PullEvent::ScanError(err) => self.throw(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pull::errors::StoreError;
    use crate::pull::fetcher::FetcherConfig;
    use crate::pull::fs_store::FsStore;
    use crate::pull::http::DirBackend;
    use crate::pull::object_id::{Checksum, ObjectKind};
    use crate::pull::store::{ObjectStore, REPO_MODE_ARCHIVE};
    use tempfile::TempDir;

    struct Fixture {
        _local: TempDir,
        remote: TempDir,
        main_loop: MainLoop,
        to_scan_rx: chan::Receiver<ScanMsg>,
        // Keep the worker-side channel ends alive for the loop under test.
        _to_fetch_tx: chan::Sender<FetchMsg>,
        _events_tx: chan::Sender<PullEvent>,
    }

    fn fixture() -> Fixture {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let store = Arc::new(FsStore::create(local.path(), REPO_MODE_ARCHIVE).unwrap());
        let cancel = CancelFlag::new();

        let (to_scan_tx, to_scan_rx) = chan::unbounded();
        let (to_fetch_tx, to_fetch_rx) = chan::unbounded();
        let (fetch_tx, fetch_rx) = chan::unbounded();
        let (events_tx, events_rx) = chan::unbounded();

        let fetcher = Fetcher::new(
            Arc::new(DirBackend),
            store.tmp_dir().to_path_buf(),
            fetch_tx,
            cancel.clone(),
            FetcherConfig { io_threads: 2 },
        )
        .unwrap();
        let stager = Stager::new(store.clone(), events_tx.clone()).unwrap();

        let main_loop = MainLoop::new(MainLoopConfig {
            fetcher,
            fetch_done: fetch_rx,
            events: events_rx,
            stager,
            to_scan: to_scan_tx,
            to_fetch: to_fetch_rx,
            base_url: format!("file://{}", remote.path().display()),
            limits: RecordLimits::default(),
            verbose: false,
            cancel,
            n_scanned_metadata: Arc::new(AtomicU32::new(0)),
        });

        Fixture {
            _local: local,
            remote,
            main_loop,
            to_scan_rx,
            _to_fetch_tx: to_fetch_tx,
            _events_tx: events_tx,
        }
    }

    #[test]
    fn scan_idle_bumps_serial_and_sends_token() {
        let mut fx = fixture();
        fx.main_loop.handle_fetch_msg(FetchMsg::ScanIdle);
        assert_eq!(fx.main_loop.idle_serial, 1);
        assert!(matches!(
            fx.to_scan_rx.try_recv().unwrap(),
            ScanMsg::MainIdle(1)
        ));

        // While not idle, another ScanIdle starts a fresh round.
        fx.main_loop.handle_fetch_msg(FetchMsg::ScanIdle);
        assert_eq!(fx.main_loop.idle_serial, 2);
    }

    #[test]
    fn matching_echo_sets_idle_and_stale_echo_is_ignored() {
        let mut fx = fixture();
        fx.main_loop.handle_fetch_msg(FetchMsg::ScanIdle);

        // A stale serial from an earlier round does nothing.
        fx.main_loop.handle_fetch_msg(FetchMsg::MainIdle(0));
        assert!(!fx.main_loop.metadata_scan_idle);

        fx.main_loop.handle_fetch_msg(FetchMsg::MainIdle(1));
        assert!(fx.main_loop.metadata_scan_idle);

        // Once idle, further ScanIdle messages do not start new rounds.
        fx.main_loop.handle_fetch_msg(FetchMsg::ScanIdle);
        assert_eq!(fx.main_loop.idle_serial, 1);
    }

    #[test]
    fn staged_metadata_reenters_scan_and_clears_idle() {
        let mut fx = fixture();
        fx.main_loop.metadata_scan_idle = true;
        fx.main_loop.n_outstanding_metadata_stage_requests = 1;

        let name = ObjectName::new(Checksum::from_bytes([7; 32]), ObjectKind::Commit);
        fx.main_loop.handle_event(PullEvent::Staged {
            name,
            result: Ok(name.csum),
        });

        assert!(!fx.main_loop.metadata_scan_idle);
        assert_eq!(fx.main_loop.n_fetched_metadata(), 1);
        assert_eq!(fx.main_loop.n_outstanding_metadata_stage_requests, 0);
        assert!(matches!(
            fx.to_scan_rx.try_recv().unwrap(),
            ScanMsg::Scan(scanned) if scanned == name
        ));
    }

    #[test]
    fn checksum_mismatch_is_fatal() {
        let mut fx = fixture();
        fx.main_loop.n_outstanding_content_stage_requests = 1;
        let name = ObjectName::new(Checksum::from_bytes([7; 32]), ObjectKind::File);
        fx.main_loop.handle_event(PullEvent::Staged {
            name,
            result: Ok(Checksum::from_bytes([8; 32])),
        });
        assert!(matches!(
            fx.main_loop.caught_error,
            Some(PullError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn first_error_wins() {
        let mut fx = fixture();
        fx.main_loop
            .handle_event(PullEvent::ScanError(PullError::MaxRecursionExceeded {
                max: 256,
            }));
        fx.main_loop
            .handle_event(PullEvent::ScanError(PullError::Store(
                StoreError::NoTransaction,
            )));
        assert!(matches!(
            fx.main_loop.caught_error,
            Some(PullError::MaxRecursionExceeded { .. })
        ));
        assert!(fx.main_loop.cancel.is_cancelled());
    }

    #[test]
    fn termination_requires_idle_and_zero_counters() {
        let mut fx = fixture();
        assert!(!fx.main_loop.termination_reached());
        fx.main_loop.metadata_scan_idle = true;
        assert!(fx.main_loop.termination_reached());
        fx.main_loop.n_outstanding_content_fetches = 1;
        assert!(!fx.main_loop.termination_reached());
        fx.main_loop.n_outstanding_content_fetches = 0;
        fx.main_loop.n_outstanding_metadata_stage_requests = 1;
        assert!(!fx.main_loop.termination_reached());
    }

    #[test]
    fn fetch_uri_text_reads_remote_body() {
        let mut fx = fixture();
        std::fs::write(fx.remote.path().join("config"), b"[core]\nmode=archive\n").unwrap();
        let body = fx.main_loop.fetch_uri_text("config").unwrap();
        assert_eq!(body, "[core]\nmode=archive\n");
        assert!(fx.main_loop.bytes_transferred() > 0);
    }

    #[test]
    fn fetch_uri_text_surfaces_not_found() {
        let mut fx = fixture();
        let err = fx.main_loop.fetch_uri_text("refs/heads/absent").unwrap_err();
        assert!(matches!(
            err,
            PullError::Fetch(FetchError::NotFound { .. })
        ));
    }

    #[test]
    fn status_line_tracks_engine_state() {
        let mut fx = fixture();
        let status = fx.main_loop.status_line();
        assert!(status.contains("scan: 0 metadata"));

        fx.main_loop.metadata_scan_idle = true;
        fx.main_loop.n_outstanding_metadata_stage_requests = 2;
        fx.main_loop.n_outstanding_content_fetches = 1;
        fx.main_loop.n_requested_content = 3;
        let status = fx.main_loop.status_line();
        assert!(!status.contains("scan:"));
        assert!(status.contains("writing: 2 objects"));
        assert!(status.contains("0/3 content"));
    }

    #[test]
    fn fetch_uri_text_rejects_invalid_utf8() {
        let mut fx = fixture();
        std::fs::write(fx.remote.path().join("config"), [0xff, 0xfe, 0x00]).unwrap();
        let err = fx.main_loop.fetch_uri_text("config").unwrap_err();
        assert!(matches!(
            err,
            PullError::Validation(ValidationError::InvalidUtf8 { .. })
        ));
    }
}
