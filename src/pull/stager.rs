//! Staging thread: transactional import of fetched objects.
//!
//! Staging hashes and writes object bytes, which is CPU-and-disk work; it
//! runs on its own thread so the Main Loop stays responsive and the
//! outstanding-stage counters reflect genuinely asynchronous requests.
//! Completions are posted onto the engine's event channel; the Main Loop
//! verifies the returned checksum against the expected one.
//!
//! The request owns the fetch temp file. It is deleted when the request is
//! dropped after staging completes, or unprocessed during teardown.

use std::fs::File;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;

use super::errors::StoreError;
use super::messages::{PullEvent, StageRequest};
use super::object_id::{Checksum, ObjectName};
use super::store::ObjectStore;

/// Handle to the staging thread.
pub struct Stager {
    requests: Option<chan::Sender<StageRequest>>,
    thread: Option<JoinHandle<()>>,
}

impl Stager {
    /// Spawns the staging thread.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        events: chan::Sender<PullEvent>,
    ) -> std::io::Result<Self> {
        let (req_tx, req_rx) = chan::unbounded::<StageRequest>();
        let thread = thread::Builder::new()
            .name("pull-stage".to_string())
            .spawn(move || {
                for req in req_rx.iter() {
                    let (name, result) = stage_one(store.as_ref(), req);
                    // A closed receiver means the engine is tearing down.
                    let _ = events.send(PullEvent::Staged { name, result });
                }
            })?;
        Ok(Self {
            requests: Some(req_tx),
            thread: Some(thread),
        })
    }

    /// Submits a stage request; its completion arrives on the event channel.
    pub fn submit(&self, request: StageRequest) {
        let sender = self.requests.as_ref().expect("stager running");
        let _ = sender.send(request);
    }
}

impl Drop for Stager {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn stage_one(
    store: &dyn ObjectStore,
    request: StageRequest,
) -> (ObjectName, Result<Checksum, StoreError>) {
    match request {
        StageRequest::Metadata { name, data, temp } => {
            let result = store.stage_metadata(&name, &data);
            // Unmap before the temp file is deleted.
            drop(data);
            drop(temp);
            (name, result)
        }
        StageRequest::Content { name, temp, length } => {
            let result = File::open(&temp)
                .map_err(StoreError::Io)
                .and_then(|mut file| store.stage_content(&name.csum, &mut file, length));
            drop(temp);
            (name, result)
        }
    }
}
