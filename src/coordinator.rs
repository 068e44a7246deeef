//! Session coordinator.
//!
//! Owns at most one `StreamWorker`. Starting a stream always stops and joins the previous
//! worker first, so two workers never write concurrently. Worker and queue notifications
//! arrive on one channel; `pump` routes them and advances the analysis queue by one step.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use crate::analysis::{AnalysisQueue, HttpVisionAnalyzer, QueueSettings, StepOutcome, VisionAnalyzer};
use crate::config::AppConfig;
use crate::detect::{self, DetectorBackend};
use crate::evidence::{EvidenceWriter, ResizeEnhancer};
use crate::ingest::{self, FrameSource};
use crate::matcher::Matcher;
use crate::storage::{SqliteViolationStore, ViolationStore};
use crate::track::{IouTracker, Tracker};
use crate::worker::{StreamWorker, WorkerStats};
use crate::Notification;

/// Builds the collaborators of one stream worker. Called on the worker thread.
pub trait PipelineFactory: Send + Sync {
    fn open_source(&self, url: &str) -> Result<Box<dyn FrameSource>>;

    fn open_store(&self) -> Result<Box<dyn ViolationStore>>;

    fn detector(&self) -> Result<Box<dyn DetectorBackend>>;

    /// Tracker whose first id is `first_id`.
    fn tracker(&self, first_id: u64) -> Result<Box<dyn Tracker>>;

    fn evidence_writer(&self) -> Result<EvidenceWriter>;

    fn matcher(&self) -> Matcher;
}

/// Factory driven by `AppConfig`.
pub struct ConfiguredFactory {
    config: AppConfig,
}

impl ConfiguredFactory {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// HTTP analyzer, or `None` while no endpoint is configured.
    pub fn analyzer(&self) -> Result<Option<Box<dyn VisionAnalyzer>>> {
        if self.config.analysis.endpoint.is_none() {
            return Ok(None);
        }
        Ok(Some(Box::new(HttpVisionAnalyzer::new(&self.config.analysis)?)))
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_attempts: self.config.analysis.max_attempts,
            yield_interval: self.config.analysis.yield_interval(),
        }
    }
}

impl PipelineFactory for ConfiguredFactory {
    fn open_source(&self, url: &str) -> Result<Box<dyn FrameSource>> {
        ingest::open_source(url, &self.config.source.ingest())
    }

    fn open_store(&self) -> Result<Box<dyn ViolationStore>> {
        Ok(Box::new(SqliteViolationStore::open(&self.config.db_path)?))
    }

    fn detector(&self) -> Result<Box<dyn DetectorBackend>> {
        detect::build_backend(&self.config.detection)
    }

    fn tracker(&self, first_id: u64) -> Result<Box<dyn Tracker>> {
        let settings = &self.config.tracking;
        Ok(Box::new(
            IouTracker::new(settings.iou_threshold, settings.max_age).starting_at(first_id),
        ))
    }

    fn evidence_writer(&self) -> Result<EvidenceWriter> {
        let settings = &self.config.evidence;
        let mut writer = EvidenceWriter::new(&self.config.evidence_dir)
            .with_margin(settings.margin)
            .with_jpeg_quality(settings.jpeg_quality);
        if settings.upscale_factor > 1 {
            writer = writer.with_enhancer(Box::new(ResizeEnhancer {
                factor: settings.upscale_factor,
            }));
        }
        Ok(writer)
    }

    fn matcher(&self) -> Matcher {
        Matcher::new(self.config.matcher.policy, self.config.matcher.min_score)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamSession {
    pub source: String,
    pub label: String,
    pub state: SessionState,
}

pub struct Coordinator {
    factory: Arc<dyn PipelineFactory>,
    store: Box<dyn ViolationStore>,
    queue: Option<AnalysisQueue<Box<dyn VisionAnalyzer>>>,
    worker: Option<StreamWorker>,
    session: Option<StreamSession>,
    tx: Sender<Notification>,
    rx: Receiver<Notification>,
    events: Vec<Notification>,
}

impl Coordinator {
    /// Open the coordinator's own store connection and, with an analyzer, queue every
    /// stored record for analysis.
    pub fn new(
        factory: Arc<dyn PipelineFactory>,
        analyzer: Option<Box<dyn VisionAnalyzer>>,
        settings: QueueSettings,
    ) -> Result<Self> {
        let (tx, rx) = channel();
        let mut store = factory.open_store()?;
        let queue = match analyzer {
            Some(analyzer) => {
                let mut queue = AnalysisQueue::new(analyzer, settings).with_notifier(tx.clone());
                queue.enqueue_existing(store.as_mut())?;
                Some(queue)
            }
            None => {
                log::info!("analysis disabled: no analyzer configured");
                None
            }
        };
        Ok(Self {
            factory,
            store,
            queue,
            worker: None,
            session: None,
            tx,
            rx,
            events: Vec::new(),
        })
    }

    /// Stop and join any running worker, then start one for `url`.
    ///
    /// The previous worker's own exit error is logged; it does not block the new stream.
    pub fn start_stream(&mut self, url: &str, label: &str) -> Result<()> {
        if let Err(e) = self.stop_stream() {
            let previous = self.session.as_ref().map_or("", |s| s.label.as_str());
            log::warn!("previous stream '{}' exited with error: {:#}", previous, e);
        }

        self.session = Some(StreamSession {
            source: url.to_string(),
            label: label.to_string(),
            state: SessionState::Starting,
        });
        let worker = StreamWorker::start(self.factory.clone(), url, label, Some(self.tx.clone()))
            .map_err(|e| {
                self.set_state(SessionState::Stopped);
                e
            })?;
        self.worker = Some(worker);
        self.set_state(SessionState::Running);
        log::info!("stream '{}' started: {}", label, url);
        Ok(())
    }

    /// Stop and join the current worker. A no-op without one.
    pub fn stop_stream(&mut self) -> Result<()> {
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        self.set_state(SessionState::Stopping);
        worker.stop();
        let joined = worker.join();
        self.set_state(SessionState::Stopped);
        log::info!("stream '{}' stopped", worker.label());
        // Consume the joined worker's final notifications before any successor starts.
        self.drain_notifications();
        joined
    }

    pub fn session(&self) -> Option<&StreamSession> {
        self.session.as_ref()
    }

    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.worker.as_ref().map(|w| w.stats())
    }

    pub fn has_analysis(&self) -> bool {
        self.queue.is_some()
    }

    pub fn analysis_pending(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.pending_len())
    }

    pub fn store(&mut self) -> &mut dyn ViolationStore {
        self.store.as_mut()
    }

    /// Route pending notifications, then advance the queue by one step if it is due.
    pub fn pump(&mut self) -> Result<Option<StepOutcome>> {
        self.drain_notifications();
        let Some(queue) = self.queue.as_mut() else {
            return Ok(None);
        };
        if queue.is_idle() || !queue.step_due() {
            return Ok(None);
        }
        let outcome = queue.step(self.store.as_mut())?;
        Ok(Some(outcome))
    }

    /// Drain the analysis queue on the calling thread.
    pub fn run_queue_until_idle(&mut self) -> Result<Vec<StepOutcome>> {
        self.drain_notifications();
        let queue = self
            .queue
            .as_mut()
            .ok_or_else(|| anyhow!("no analyzer configured"))?;
        let outcomes = queue.run_until_idle(self.store.as_mut())?;
        self.drain_notifications();
        Ok(outcomes)
    }

    /// Notifications observed since the previous call, oldest first.
    pub fn take_events(&mut self) -> Vec<Notification> {
        self.drain_notifications();
        std::mem::take(&mut self.events)
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.drain_notifications();
        self.stop_stream()
    }

    fn set_state(&mut self, state: SessionState) {
        if let Some(session) = self.session.as_mut() {
            session.state = state;
        }
    }

    fn drain_notifications(&mut self) {
        while let Ok(notification) = self.rx.try_recv() {
            match &notification {
                Notification::NewRecord {
                    track_id,
                    image_path,
                } => {
                    if let Some(queue) = self.queue.as_mut() {
                        if Path::new(image_path).exists() {
                            queue.enqueue(*track_id, image_path);
                        }
                    }
                }
                Notification::WorkerStopped { label } => {
                    let exited_on_its_own = self.session.as_ref().is_some_and(|s| {
                        &s.label == label && s.state == SessionState::Running
                    });
                    if exited_on_its_own {
                        log::warn!("stream '{}' exited unexpectedly", label);
                        if let Some(mut worker) = self.worker.take() {
                            if let Err(e) = worker.join() {
                                log::warn!("stream '{}': {:#}", label, e);
                            }
                        }
                        self.set_state(SessionState::Stopped);
                    }
                }
                Notification::AnalysisUpdated { .. } => {}
            }
            self.events.push(notification);
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Err(e) = self.stop_stream() {
            log::warn!("coordinator shutdown: {:#}", e);
        }
    }
}
