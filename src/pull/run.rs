//! Pull orchestration: root resolution, transaction lifecycle, ref updates.
//!
//! `run_pull` drives one complete pull:
//!
//! 1. Read `remote "NAME"` from the local repo config (base URL).
//! 2. Fetch and validate the remote `/config` (archive mode required).
//! 3. Resolve roots: raw commit ids are taken as-is; branch names resolve
//!    through `refs/heads/{branch}`; with no arguments, the locally
//!    configured branch list or the remote `refs/summary` is used.
//! 4. Compare each ref against the stored `{remote}/{branch}` value; equal
//!    refs are skipped ("no changes"), the rest become scan roots.
//! 5. Open the transaction, start the scan worker, prime quiescence, and
//!    run the main loop to completion.
//! 6. On success commit the transaction and write the updated refs; on any
//!    error abort the transaction and leave every ref untouched.
//!
//! Root resolution (phase 1) and the scan/fetch pipeline (phase 2) have
//! separate termination rules and never share state beyond the fetcher.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use super::errors::{PullError, ValidationError};
use super::fetcher::{CancelFlag, FetchBackend, Fetcher, FetcherConfig};
use super::keyfile::KeyFile;
use super::main_loop::{MainLoop, MainLoopConfig};
use super::messages::ScanMsg;
use super::object_id::{Checksum, ObjectKind, ObjectName};
use super::records::RecordLimits;
use super::refs::{is_checksum_string, parse_branch_head, parse_checksum, parse_ref_summary, validate_ref_name};
use super::scan_worker::{ScanWorker, ScanWorkerConfig};
use super::stager::Stager;
use super::store::{ObjectStore, REPO_MODE_ARCHIVE};

/// Options for one pull invocation.
pub struct PullOptions {
    /// Remote name; `remote "NAME"` must exist in the local repo config.
    pub remote: String,
    /// Branch names and/or raw commit checksums. Empty means "use the
    /// configured branch list, or else the remote summary".
    pub refs: Vec<String>,
    /// Follow each commit's `related` edges.
    pub related: bool,
    /// Emit per-event diagnostics to stderr.
    pub verbose: bool,
    pub fetcher: FetcherConfig,
    pub limits: RecordLimits,
    pub cancel: CancelFlag,
}

impl PullOptions {
    /// Options with defaults for everything but the remote name.
    #[must_use]
    pub fn new(remote: &str) -> Self {
        Self {
            remote: remote.to_string(),
            refs: Vec::new(),
            related: false,
            verbose: false,
            fetcher: FetcherConfig::default(),
            limits: RecordLimits::default(),
            cancel: CancelFlag::new(),
        }
    }
}

/// Outcome of a successful pull.
#[derive(Debug)]
pub struct PullReport {
    /// Metadata objects fetched and imported.
    pub n_fetched_metadata: u32,
    /// Content objects fetched and imported.
    pub n_fetched_content: u32,
    /// Metadata objects scanned (closure size for a warm pull by id).
    pub n_scanned_metadata: u32,
    /// Total body bytes transferred.
    pub bytes_transferred: u64,
    /// Refs written as `{remote}/{branch}`, with their new checksums.
    pub updated_refs: Vec<(String, Checksum)>,
    /// Refs skipped because the remote value matched the local one.
    pub unchanged_refs: Vec<String>,
    /// Wall-clock duration of the pull.
    pub elapsed: Duration,
}

/// Runs one pull against `store` using `backend` for transport.
///
/// # Errors
/// Returns the first fatal error: network, validation, integrity,
/// structural, or store. On any error the transaction is aborted and no
/// ref is updated.
pub fn run_pull(
    store: Arc<dyn ObjectStore>,
    backend: Arc<dyn FetchBackend>,
    options: PullOptions,
) -> Result<PullReport, PullError> {
    let start = Instant::now();

    let config = store.config()?;
    let remote_section = format!("remote \"{}\"", options.remote);
    let base_url = config.require_string(&remote_section, "url")?.to_string();

    let (to_scan_tx, to_scan_rx) = chan::unbounded();
    let (to_fetch_tx, to_fetch_rx) = chan::unbounded();
    let (fetch_tx, fetch_rx) = chan::unbounded();
    let (events_tx, events_rx) = chan::unbounded();
    let n_scanned_metadata = Arc::new(AtomicU32::new(0));

    let fetcher = Fetcher::new(
        backend,
        store.tmp_dir().to_path_buf(),
        fetch_tx,
        options.cancel.clone(),
        options.fetcher,
    )?;
    let stager = Stager::new(Arc::clone(&store), events_tx.clone())?;
    let mut main_loop = MainLoop::new(MainLoopConfig {
        fetcher,
        fetch_done: fetch_rx,
        events: events_rx,
        stager,
        to_scan: to_scan_tx.clone(),
        to_fetch: to_fetch_rx,
        base_url,
        limits: options.limits,
        verbose: options.verbose,
        cancel: options.cancel.clone(),
        n_scanned_metadata: Arc::clone(&n_scanned_metadata),
    });

    // Phase 1: remote config, then roots.
    let remote_config = KeyFile::parse(&main_loop.fetch_uri_text("config")?)?;
    let remote_mode = remote_config.string_with_default("core", "mode", "bare");
    if remote_mode != REPO_MODE_ARCHIVE {
        return Err(ValidationError::UnsupportedRemoteMode {
            mode: remote_mode.to_string(),
        }
        .into());
    }

    let mut commits_to_fetch: Vec<Checksum> = Vec::new();
    let mut requested_refs: BTreeMap<String, Checksum> = BTreeMap::new();

    if !options.refs.is_empty() {
        for arg in &options.refs {
            if is_checksum_string(arg) {
                commits_to_fetch.push(parse_checksum(arg)?);
            } else {
                validate_ref_name(arg)?;
                let body = main_loop.fetch_uri_text(&format!("refs/heads/{arg}"))?;
                requested_refs.insert(arg.clone(), parse_branch_head(&body)?);
            }
        }
    } else if let Some(branches) = config.string_list(&remote_section, "branches") {
        if branches.is_empty() && options.verbose {
            eprintln!(
                "pull: no configured branches for remote {}",
                options.remote
            );
        }
        for branch in &branches {
            validate_ref_name(branch)?;
            let body = main_loop.fetch_uri_text(&format!("refs/heads/{branch}"))?;
            requested_refs.insert(branch.clone(), parse_branch_head(&body)?);
        }
    } else {
        let body = main_loop.fetch_uri_text("refs/summary")?;
        for (ref_name, csum) in parse_ref_summary(&body)? {
            requested_refs.insert(ref_name, csum);
        }
    }

    // Skip refs whose stored value already matches the remote.
    let mut updated_refs: Vec<(String, Checksum)> = Vec::new();
    let mut unchanged_refs: Vec<String> = Vec::new();
    let mut roots = commits_to_fetch;
    for (branch, csum) in &requested_refs {
        let refspec = format!("{}/{}", options.remote, branch);
        if store.resolve_rev(&refspec)? == Some(*csum) {
            if options.verbose {
                eprintln!("pull: no changes in {refspec}");
            }
            unchanged_refs.push(branch.clone());
        } else {
            roots.push(*csum);
            updated_refs.push((branch.clone(), *csum));
        }
    }

    // Phase 2: the scan/fetch pipeline, inside the transaction.
    store.prepare_transaction()?;

    let run_result = (|| {
        let worker = ScanWorker::spawn(ScanWorkerConfig {
            store: Arc::clone(&store),
            to_scan: to_scan_rx,
            to_fetch: to_fetch_tx,
            events: events_tx,
            related: options.related,
            limits: options.limits,
            cancel: options.cancel.clone(),
            n_scanned_metadata: Arc::clone(&n_scanned_metadata),
        })?;

        for csum in &roots {
            let msg = ScanMsg::Scan(ObjectName::new(*csum, ObjectKind::Commit));
            if to_scan_tx.send(msg).is_err() {
                break;
            }
        }

        let result = main_loop.run();
        let _ = to_scan_tx.send(ScanMsg::Quit);
        let _ = worker.join();
        result
    })();

    if let Err(err) = run_result {
        let _ = store.abort_transaction();
        return Err(err);
    }
    if let Err(err) = store.commit_transaction() {
        let _ = store.abort_transaction();
        return Err(err.into());
    }

    for (branch, csum) in &updated_refs {
        store.write_ref(&options.remote, branch, csum)?;
        if options.verbose {
            eprintln!("pull: remote {}/{branch} is now {csum}", options.remote);
        }
    }

    Ok(PullReport {
        n_fetched_metadata: main_loop.n_fetched_metadata(),
        n_fetched_content: main_loop.n_fetched_content(),
        n_scanned_metadata: main_loop.n_scanned_metadata(),
        bytes_transferred: main_loop.bytes_transferred(),
        updated_refs,
        unchanged_refs,
        elapsed: start.elapsed(),
    })
}
