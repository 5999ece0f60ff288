//! Message types connecting the pull engine's loops.
//!
//! Two typed queues link the Scan Worker and the Main Loop:
//!
//! - `to_scan` carries `ScanMsg` (Main Loop → Scan Worker)
//! - `to_fetch` carries `FetchMsg` (Scan Worker → Main Loop)
//!
//! A third channel carries `PullEvent` completions and worker errors onto
//! the Main Loop; it plays the role of "post to the main context" and keeps
//! the two object-name queues free of anything but pipeline traffic.
//!
//! All payloads are owned values; nothing here shares mutable state across
//! threads.

use tempfile::TempPath;

use super::errors::{PullError, StoreError};
use super::object_id::{Checksum, ObjectName};

/// Messages consumed by the Scan Worker.
#[derive(Debug)]
pub enum ScanMsg {
    /// Recurse into this (already staged) metadata object.
    Scan(ObjectName),
    /// Quiescence token; the worker echoes the last one it saw per turn
    /// back on `to_fetch` after draining its queue.
    MainIdle(u32),
    /// Shut the worker down.
    Quit,
}

/// Messages consumed by the Main Loop from the Scan Worker.
#[derive(Debug)]
pub enum FetchMsg {
    /// Fetch this object from the remote.
    Fetch(ObjectName),
    /// The worker drained its queue this turn.
    ScanIdle,
    /// Echoed quiescence token.
    MainIdle(u32),
}

/// Token attached to each fetch request so the completion can be routed.
#[derive(Debug)]
pub enum FetchTarget {
    /// An object fetch from the scan pipeline (phase 2).
    Object(ObjectName),
    /// A plain URI fetch during root resolution (phase 1), identified by
    /// a per-run serial.
    Plain(u64),
}

/// Completions and errors posted onto the Main Loop.
#[derive(Debug)]
pub enum PullEvent {
    /// The stager finished an object; `result` is the checksum the store
    /// computed for the staged bytes.
    Staged {
        name: ObjectName,
        result: Result<Checksum, StoreError>,
    },
    /// The Scan Worker hit a fatal error.
    ScanError(PullError),
}

/// Work submitted to the staging thread.
///
/// Both variants own the fetch temp file; it is deleted when the request
/// is dropped after staging (or dropped unprocessed during teardown).
pub enum StageRequest {
    /// Stage a metadata object from its mapped bytes.
    Metadata {
        name: ObjectName,
        data: memmap2::Mmap,
        temp: TempPath,
    },
    /// Stage a content object by streaming `length` bytes from the temp
    /// file (the canonical serialized content object).
    Content {
        name: ObjectName,
        temp: TempPath,
        length: u64,
    },
}
