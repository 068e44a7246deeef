//! Overload Watch
//!
//! This crate captures evidence of overloaded (illegal) vehicles from a live video stream.
//!
//! # Architecture
//!
//! The pipeline enforces three properties by construction:
//!
//! 1. **One record per vehicle**: a violation is keyed by its tracker id and stored at most once.
//! 2. **One stream worker**: the coordinator stops and joins the previous worker before starting another.
//! 3. **One analysis in flight**: the analysis queue invokes the external analyzer strictly one record at a time.
//!
//! # Module Structure
//!
//! - `ingest`: Frame sources (synthetic, image directory, GStreamer)
//! - `detect`: Detector backends and the violation rule
//! - `track`: Tracker capability and the reference IoU tracker
//! - `matcher`: Violation box to track id association
//! - `evidence`: Margin expansion, crop, enhancement, JPEG evidence files
//! - `storage`: Violation record store (SQLite + in-memory)
//! - `worker`: Stream worker thread and the per-frame pipeline
//! - `analysis`: Single in-flight analysis queue and vision analyzer clients
//! - `coordinator`: Session ownership and notification routing
//! - `api`: Read-only loopback record API
//! - `catalog`: Public CCTV stream catalog

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};

pub mod analysis;
pub mod api;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod evidence;
pub mod frame;
pub mod ingest;
pub mod matcher;
pub mod storage;
pub mod track;
pub mod worker;

pub use analysis::{AnalysisQueue, HttpVisionAnalyzer, QueueSettings, StepOutcome, VisionAnalyzer};
pub use coordinator::{ConfiguredFactory, Coordinator, PipelineFactory, SessionState, StreamSession};
pub use detect::{BoundingBox, Detection, DetectionResult, DetectorBackend, StubBackend, ViolationRule};
pub use evidence::{EvidenceWriter, PixelBox, ResizeEnhancer};
pub use frame::Frame;
pub use ingest::{FrameSource, IngestSettings, ScriptedSource};
pub use matcher::{MatchPolicy, Matcher};
pub use storage::{InMemoryViolationStore, SqliteViolationStore, StoreError, ViolationRecord, ViolationStore};
pub use track::{IouTracker, Track, Tracker};
pub use worker::{FramePipeline, StreamWorker, WorkerStats};

/// Fire-and-forget notifications routed from the stream worker and analysis queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// A violation record was inserted.
    NewRecord { track_id: u64, image_path: String },
    /// A record's analysis result was written.
    AnalysisUpdated { track_id: u64, image_path: String },
    /// A stream worker loop exited.
    WorkerStopped { label: String },
}

/// URI for a private shared-cache in-memory database.
///
/// Every connection opened with the same URI sees the same database for as long as one
/// connection stays open.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:overload_watch_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
