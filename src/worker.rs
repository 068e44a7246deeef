//! Stream worker.
//!
//! One worker owns one stream: it opens the frame source and its own store connection on
//! its thread, runs every frame through `FramePipeline`, and releases both when the loop
//! exits. `stop()` only raises a flag; `join()` waits for the release.

use anyhow::{anyhow, Result};
use chrono::Local;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::coordinator::PipelineFactory;
use crate::detect::DetectorBackend;
use crate::evidence::EvidenceWriter;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::matcher::Matcher;
use crate::storage::{is_conflict, ViolationRecord, ViolationStore};
use crate::track::Tracker;
use crate::Notification;

const SOURCE_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);
/// Consecutive read failures between warn-level log lines.
const READ_FAILURE_WARN_EVERY: u64 = 100;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames_read: u64,
    pub read_failures: u64,
    pub detections: u64,
    pub flagged: u64,
    /// Flagged boxes no track could be attributed to.
    pub unmatched: u64,
    pub inserted: u64,
    pub conflicts: u64,
    pub evidence_failures: u64,
}

/// Detect, track, match, dedup and persist for one frame at a time.
pub struct FramePipeline {
    label: String,
    detector: Box<dyn DetectorBackend>,
    tracker: Box<dyn Tracker>,
    matcher: Matcher,
    evidence: EvidenceWriter,
}

impl FramePipeline {
    pub fn new(
        label: impl Into<String>,
        detector: Box<dyn DetectorBackend>,
        tracker: Box<dyn Tracker>,
        matcher: Matcher,
        evidence: EvidenceWriter,
    ) -> Self {
        Self {
            label: label.into(),
            detector,
            tracker,
            matcher,
            evidence,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.detector.warm_up()
    }

    /// Run one frame through the pipeline and return the records it inserted.
    ///
    /// Detector, tracker and store lookup failures abort the frame with an error. Evidence
    /// failures and insert conflicts skip only the affected violation.
    pub fn process_frame(
        &mut self,
        frame: &Frame,
        store: &mut dyn ViolationStore,
        stats: &mut WorkerStats,
    ) -> Result<Vec<ViolationRecord>> {
        let result = self.detector.detect(frame)?;
        stats.detections += result.detections.len() as u64;
        stats.flagged += result.flagged.len() as u64;

        let tracks = self.tracker.update(&result.detections)?;

        let mut inserted = Vec::new();
        for violation in &result.flagged {
            let Some(track_id) = self.matcher.match_track(&violation.bbox, &tracks) else {
                stats.unmatched += 1;
                log::debug!(
                    "[{}] frame {}: flagged box {:?} matched no track",
                    self.label,
                    frame.index,
                    violation.bbox
                );
                continue;
            };
            if store.exists(track_id)? {
                continue;
            }

            let evidence = match self.evidence.capture(frame, &violation.bbox, track_id, Local::now()) {
                Ok(evidence) => evidence,
                Err(e) => {
                    stats.evidence_failures += 1;
                    log::warn!("[{}] evidence for track {} failed: {:#}", self.label, track_id, e);
                    continue;
                }
            };

            let record = ViolationRecord {
                track_id,
                timestamp: evidence.timestamp,
                class_label: violation.class_label.clone(),
                bbox: evidence.bbox,
                image_path: evidence.image_path.to_string_lossy().to_string(),
                source_label: self.label.clone(),
                analysis_result: None,
            };
            match store.insert(&record) {
                Ok(()) => {
                    stats.inserted += 1;
                    log::info!(
                        "[{}] violation track={} saved to {}",
                        self.label,
                        track_id,
                        record.image_path
                    );
                    inserted.push(record);
                }
                Err(e) => {
                    discard_evidence(&evidence.image_path);
                    if !is_conflict(&e) {
                        return Err(e);
                    }
                    stats.conflicts += 1;
                    log::debug!("[{}] {}", self.label, e);
                }
            }
        }
        Ok(inserted)
    }
}

/// Remove an evidence file that no record points to.
fn discard_evidence(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("could not remove orphaned evidence {}: {}", path.display(), e);
    }
}

pub struct StreamWorker {
    label: String,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<WorkerStats>>,
    join: Option<JoinHandle<Result<()>>>,
}

impl StreamWorker {
    /// Spawn the worker thread. Source and store are opened on that thread.
    pub fn start(
        factory: Arc<dyn PipelineFactory>,
        url: &str,
        label: &str,
        notify: Option<Sender<Notification>>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let ctx = WorkerContext {
            factory,
            url: url.to_string(),
            label: label.to_string(),
            stop: stop.clone(),
            stats: stats.clone(),
            notify,
        };
        let join = std::thread::Builder::new()
            .name(format!("stream-{}", label))
            .spawn(move || ctx.run())
            .map_err(|e| anyhow!("failed to spawn stream worker: {}", e))?;

        Ok(Self {
            label: label.to_string(),
            stop,
            stats,
            join: Some(join),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ask the loop to exit. Returns immediately.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the loop to exit and its resources to be released.
    pub fn join(&mut self) -> Result<()> {
        match self.join.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("stream worker '{}' panicked", self.label))?,
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        match self.stats.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.join() {
            log::warn!("stream worker '{}' exited with error: {:#}", self.label, e);
        }
    }
}

struct WorkerContext {
    factory: Arc<dyn PipelineFactory>,
    url: String,
    label: String,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<WorkerStats>>,
    notify: Option<Sender<Notification>>,
}

impl WorkerContext {
    fn run(self) -> Result<()> {
        let result = self.run_loop();
        match &result {
            Ok(()) => log::info!("[{}] stream worker stopped", self.label),
            Err(e) => log::error!("[{}] stream worker failed: {:#}", self.label, e),
        }
        self.send(Notification::WorkerStopped {
            label: self.label.clone(),
        });
        result
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn send(&self, notification: Notification) {
        if let Some(tx) = &self.notify {
            let _ = tx.send(notification);
        }
    }

    fn publish(&self, stats: WorkerStats) {
        match self.stats.lock() {
            Ok(mut guard) => *guard = stats,
            Err(poisoned) => *poisoned.into_inner() = stats,
        }
    }

    fn open_source(&self) -> Option<Box<dyn FrameSource>> {
        let mut attempts = 0u64;
        while !self.stopped() {
            match self.factory.open_source(&self.url) {
                Ok(source) => {
                    log::info!("[{}] reading {}", self.label, source.describe());
                    return Some(source);
                }
                Err(e) => {
                    attempts += 1;
                    if attempts == 1 || attempts % READ_FAILURE_WARN_EVERY == 0 {
                        log::warn!("[{}] cannot open {} (attempt {}): {:#}", self.label, self.url, attempts, e);
                    }
                    std::thread::sleep(SOURCE_RETRY_INTERVAL);
                }
            }
        }
        None
    }

    fn run_loop(&self) -> Result<()> {
        let mut store = self.factory.open_store()?;
        let first_id = store.max_track_id()?.map_or(1, |id| id + 1);
        let mut pipeline = FramePipeline::new(
            self.label.clone(),
            self.factory.detector()?,
            self.factory.tracker(first_id)?,
            self.factory.matcher(),
            self.factory.evidence_writer()?,
        );
        pipeline.warm_up()?;

        let Some(mut source) = self.open_source() else {
            return Ok(());
        };

        let mut stats = WorkerStats::default();
        let mut consecutive_failures = 0u64;
        let mut last_stats_log = Instant::now();

        while !self.stopped() {
            match source.next_frame() {
                Ok(Some(frame)) => {
                    consecutive_failures = 0;
                    stats.frames_read += 1;
                    match pipeline.process_frame(&frame, store.as_mut(), &mut stats) {
                        Ok(records) => {
                            for record in records {
                                self.send(Notification::NewRecord {
                                    track_id: record.track_id,
                                    image_path: record.image_path,
                                });
                            }
                        }
                        Err(e) => log::warn!("[{}] frame {} skipped: {:#}", self.label, frame.index, e),
                    }
                }
                Ok(None) => std::thread::yield_now(),
                Err(e) => {
                    stats.read_failures += 1;
                    consecutive_failures += 1;
                    log::debug!("[{}] read failed: {:#}", self.label, e);
                    if consecutive_failures % READ_FAILURE_WARN_EVERY == 0 {
                        log::warn!("[{}] {} consecutive read failures", self.label, consecutive_failures);
                    }
                }
            }
            self.publish(stats);

            if last_stats_log.elapsed() >= STATS_LOG_INTERVAL {
                let source_stats = source.stats();
                log::info!(
                    "[{}] health={} frames={} flagged={} unmatched={} inserted={} read_failures={}",
                    self.label,
                    source.is_healthy(),
                    source_stats.frames_captured,
                    stats.flagged,
                    stats.unmatched,
                    stats.inserted,
                    stats.read_failures
                );
                last_stats_log = Instant::now();
            }
        }
        Ok(())
    }
}
