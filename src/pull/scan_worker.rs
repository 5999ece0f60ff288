//! Scan worker: classifies metadata objects and emits fetch requests.
//!
//! The worker runs on its own thread and owns the dedup tables outright;
//! no other thread ever sees them. Each turn it drains `to_scan`,
//! recursing synchronously into every stored metadata object it is handed
//! and emitting `Fetch` messages for missing descendants. After the drain
//! it forwards the last quiescence token it saw (older tokens from the
//! same turn are dropped) and always reports `ScanIdle`.
//!
//! # Invariants
//! - An object checksum enters `requested_metadata`/`requested_content`
//!   strictly before its `Fetch` message is sent, and only once per run.
//! - An object name enters `scanned_metadata` only after its children have
//!   been classified; it is never classified again.
//! - Recursion depth is capped at `MAX_RECURSION`; the object graph is
//!   content-addressed and acyclic by construction, but depth is untrusted.
//!
//! Errors are posted to the Main Loop's event channel; the worker then
//! abandons the turn (without reporting idle) and waits for `Quit`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;

use super::errors::PullError;
use super::fetcher::CancelFlag;
use super::messages::{FetchMsg, PullEvent, ScanMsg};
use super::object_id::{Checksum, ObjectKind, ObjectName};
use super::records::{CommitRecord, RecordLimits, TreeRecord};
use super::refs::validate_filename;
use super::store::ObjectStore;

/// Hard cap on metadata recursion depth.
///
/// Guards against maliciously deep tree chains; exceeding it fails the
/// pull rather than exhausting the stack.
pub const MAX_RECURSION: u32 = 256;

/// Construction parameters for the scan worker.
pub struct ScanWorkerConfig {
    pub store: Arc<dyn ObjectStore>,
    pub to_scan: chan::Receiver<ScanMsg>,
    pub to_fetch: chan::Sender<FetchMsg>,
    pub events: chan::Sender<PullEvent>,
    /// Follow each commit's `related` edges.
    pub related: bool,
    pub limits: RecordLimits,
    pub cancel: CancelFlag,
    /// Scanned-object counter, readable by the status renderer.
    pub n_scanned_metadata: Arc<AtomicU32>,
}

/// The scan worker's thread state: dedup tables plus its channel ends.
pub struct ScanWorker {
    store: Arc<dyn ObjectStore>,
    to_scan: chan::Receiver<ScanMsg>,
    to_fetch: chan::Sender<FetchMsg>,
    events: chan::Sender<PullEvent>,
    related: bool,
    limits: RecordLimits,
    cancel: CancelFlag,
    n_scanned_metadata: Arc<AtomicU32>,

    scanned_metadata: HashSet<ObjectName>,
    requested_metadata: HashSet<Checksum>,
    requested_content: HashSet<Checksum>,
}

impl ScanWorker {
    /// Spawns the worker thread.
    pub fn spawn(config: ScanWorkerConfig) -> std::io::Result<JoinHandle<()>> {
        let worker = Self::new(config);
        thread::Builder::new()
            .name("pull-scan".to_string())
            .spawn(move || worker.run())
    }

    fn new(config: ScanWorkerConfig) -> Self {
        Self {
            store: config.store,
            to_scan: config.to_scan,
            to_fetch: config.to_fetch,
            events: config.events,
            related: config.related,
            limits: config.limits,
            cancel: config.cancel,
            n_scanned_metadata: config.n_scanned_metadata,
            scanned_metadata: HashSet::new(),
            requested_metadata: HashSet::new(),
            requested_content: HashSet::new(),
        }
    }

    /// Turn loop: block for the first message, then drain without blocking.
    fn run(mut self) {
        loop {
            let Ok(first) = self.to_scan.recv() else {
                // Channel closed: the engine is gone.
                return;
            };

            let mut last_idle: Option<u32> = None;
            let mut failed = false;
            let mut msg = Some(first);
            while let Some(current) = msg {
                match current {
                    ScanMsg::Scan(name) => {
                        if let Err(err) = self.scan_one(&name, 0) {
                            let _ = self.events.send(PullEvent::ScanError(err));
                            failed = true;
                            break;
                        }
                    }
                    ScanMsg::MainIdle(serial) => last_idle = Some(serial),
                    ScanMsg::Quit => return,
                }
                msg = self.to_scan.try_recv().ok();
            }

            if failed {
                // The Main Loop is about to quit; wait for it to say so.
                continue;
            }
            if let Some(serial) = last_idle {
                let _ = self.to_fetch.send(FetchMsg::MainIdle(serial));
            }
            let _ = self.to_fetch.send(FetchMsg::ScanIdle);
        }
    }

    /// Classifies one metadata object.
    ///
    /// Missing objects are requested (gated on the dedup tables); stored
    /// objects are recursed into and marked scanned.
    fn scan_one(&mut self, name: &ObjectName, depth: u32) -> Result<(), PullError> {
        if self.scanned_metadata.contains(name) {
            return Ok(());
        }
        if depth > MAX_RECURSION {
            return Err(PullError::MaxRecursionExceeded {
                max: MAX_RECURSION,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(PullError::Cancelled);
        }

        let is_requested = self.requested_metadata.contains(&name.csum);
        let is_stored = self.store.has_object(name)?;

        if !is_stored && !is_requested {
            self.requested_metadata.insert(name.csum);
            let _ = self.to_fetch.send(FetchMsg::Fetch(*name));
        } else if is_stored {
            match name.kind {
                ObjectKind::Commit => self.scan_commit(name, depth)?,
                ObjectKind::DirTree => self.scan_dirtree(name, depth)?,
                ObjectKind::DirMeta => {}
                ObjectKind::File => unreachable!("content objects are never scanned"),
            }
            self.scanned_metadata.insert(*name);
            self.n_scanned_metadata.fetch_add(1, Ordering::Relaxed);
        }
        // Stored-and-requested was fetched earlier this run: handled above.
        Ok(())
    }

    fn scan_commit(&mut self, name: &ObjectName, depth: u32) -> Result<(), PullError> {
        let data = self.store.load_variant(name)?;
        let commit = CommitRecord::parse(&data, &self.limits).map_err(|err| {
            PullError::Record {
                object: *name,
                err,
            }
        })?;

        self.scan_one(
            &ObjectName::new(commit.tree_contents_csum, ObjectKind::DirTree),
            depth + 1,
        )?;
        self.scan_one(
            &ObjectName::new(commit.tree_meta_csum, ObjectKind::DirMeta),
            depth + 1,
        )?;

        if self.related {
            for (_related_name, csum) in &commit.related {
                self.scan_one(&ObjectName::new(*csum, ObjectKind::Commit), depth + 1)?;
            }
        }
        Ok(())
    }

    fn scan_dirtree(&mut self, name: &ObjectName, depth: u32) -> Result<(), PullError> {
        let data = self.store.load_variant(name)?;
        let tree = TreeRecord::parse(&data, &self.limits).map_err(|err| PullError::Record {
            object: *name,
            err,
        })?;

        for (filename, file_csum) in &tree.files {
            validate_filename(filename)?;
            let file_name = ObjectName::new(*file_csum, ObjectKind::File);
            let is_stored = self.store.has_object(&file_name)?;
            if !is_stored && !self.requested_content.contains(file_csum) {
                self.requested_content.insert(*file_csum);
                let _ = self.to_fetch.send(FetchMsg::Fetch(file_name));
            }
        }

        for dir in &tree.dirs {
            validate_filename(&dir.name)?;
            self.scan_one(
                &ObjectName::new(dir.tree_csum, ObjectKind::DirTree),
                depth + 1,
            )?;
            self.scan_one(
                &ObjectName::new(dir.meta_csum, ObjectKind::DirMeta),
                depth + 1,
            )?;
        }
        Ok(())
    }
}
