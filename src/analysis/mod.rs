//! Analysis queue.
//!
//! Backfills `analysis_result` for persisted records through a `VisionAnalyzer`. The queue
//! is driven cooperatively by its owner (`step` / `run_until_idle`), so at most one
//! analyzer call is ever in flight. Results are cached in the store by image path: a
//! record that already has a result is never sent to the analyzer again.

mod client;

use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use crate::storage::ViolationStore;
use crate::Notification;

pub use client::{summary_line, HttpVisionAnalyzer, VisionAnalyzer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Analyzing,
    /// Terminal: the result is in the store and the entry leaves the queue.
    Cached,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnalysisEntry {
    pub track_id: u64,
    pub image_path: String,
    pub state: EntryState,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub struct QueueSettings {
    /// Failed analyses per entry before it is dropped from the queue.
    pub max_attempts: u32,
    /// Pause between consecutive steps.
    pub yield_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            yield_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing pending.
    Idle,
    /// The store already held a result; the analyzer was not called.
    CacheHit { track_id: u64 },
    /// The analyzer produced a result and it was written back.
    Analyzed { track_id: u64 },
    /// The attempt failed; the entry went back to the tail.
    Retry { track_id: u64, attempts: u32 },
    /// The attempt failed for the last time; the entry left the queue.
    Abandoned { track_id: u64 },
}

pub struct AnalysisQueue<A: VisionAnalyzer> {
    analyzer: A,
    settings: QueueSettings,
    pending: VecDeque<AnalysisEntry>,
    /// Image paths currently in the queue. Cached entries leave it.
    known: HashMap<String, EntryState>,
    notify: Option<Sender<Notification>>,
    last_step: Option<Instant>,
}

impl<A: VisionAnalyzer> AnalysisQueue<A> {
    pub fn new(analyzer: A, settings: QueueSettings) -> Self {
        Self {
            analyzer,
            settings,
            pending: VecDeque::new(),
            known: HashMap::new(),
            notify: None,
            last_step: None,
        }
    }

    pub fn with_notifier(mut self, notify: Sender<Notification>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Queue every stored record whose evidence file still exists, oldest first.
    ///
    /// Returns the number of entries added.
    pub fn enqueue_existing(&mut self, store: &mut dyn ViolationStore) -> Result<usize> {
        let mut added = 0;
        for record in store.list_all()?.into_iter().rev() {
            if !Path::new(&record.image_path).exists() {
                log::debug!("analysis: skipping track {}, {} is gone", record.track_id, record.image_path);
                continue;
            }
            if self.enqueue(record.track_id, &record.image_path) {
                added += 1;
            }
        }
        if added > 0 {
            log::info!("analysis: queued {} stored records", added);
        }
        Ok(added)
    }

    /// Append to the tail. Returns false when the image path is already queued.
    pub fn enqueue(&mut self, track_id: u64, image_path: &str) -> bool {
        if self.known.contains_key(image_path) {
            return false;
        }
        self.known.insert(image_path.to_string(), EntryState::Pending);
        self.pending.push_back(AnalysisEntry {
            track_id,
            image_path: image_path.to_string(),
            state: EntryState::Pending,
            attempts: 0,
        });
        true
    }

    /// Queue the newest stored record, if its evidence file exists.
    pub fn enqueue_latest(&mut self, store: &mut dyn ViolationStore) -> Result<bool> {
        let Some(record) = store.latest()? else {
            return Ok(false);
        };
        if !Path::new(&record.image_path).exists() {
            return Ok(false);
        }
        Ok(self.enqueue(record.track_id, &record.image_path))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending entries in queue order.
    pub fn entries(&self) -> impl Iterator<Item = &AnalysisEntry> {
        self.pending.iter()
    }

    pub fn state_of(&self, image_path: &str) -> Option<EntryState> {
        self.known.get(image_path).copied()
    }

    /// True once `yield_interval` has passed since the previous step.
    pub fn step_due(&self) -> bool {
        self.last_step
            .map_or(true, |at| at.elapsed() >= self.settings.yield_interval)
    }

    /// Process the head entry.
    ///
    /// A store read failure leaves the entry at the head and returns the error.
    pub fn step(&mut self, store: &mut dyn ViolationStore) -> Result<StepOutcome> {
        let Some(mut entry) = self.pending.pop_front() else {
            return Ok(StepOutcome::Idle);
        };
        self.last_step = Some(Instant::now());

        let cached = match store.analysis_for(&entry.image_path) {
            Ok(cached) => cached,
            Err(e) => {
                self.pending.push_front(entry);
                return Err(e);
            }
        };
        if cached.is_some() {
            log::debug!("analysis: track {} already analyzed", entry.track_id);
            let entry = self.retire(entry);
            return Ok(StepOutcome::CacheHit {
                track_id: entry.track_id,
            });
        }

        entry.state = EntryState::Analyzing;
        self.known.insert(entry.image_path.clone(), EntryState::Analyzing);

        match self.analyze_and_store(&entry, store) {
            Ok(()) => {
                log::info!("analysis: track {} analyzed by {}", entry.track_id, self.analyzer.name());
                let entry = self.retire(entry);
                if let Some(tx) = &self.notify {
                    let _ = tx.send(Notification::AnalysisUpdated {
                        track_id: entry.track_id,
                        image_path: entry.image_path,
                    });
                }
                Ok(StepOutcome::Analyzed {
                    track_id: entry.track_id,
                })
            }
            Err(e) => {
                entry.attempts += 1;
                log::warn!(
                    "analysis: track {} attempt {}/{} failed: {:#}",
                    entry.track_id,
                    entry.attempts,
                    self.settings.max_attempts,
                    e
                );
                if entry.attempts >= self.settings.max_attempts {
                    self.known.remove(&entry.image_path);
                    return Ok(StepOutcome::Abandoned {
                        track_id: entry.track_id,
                    });
                }
                let outcome = StepOutcome::Retry {
                    track_id: entry.track_id,
                    attempts: entry.attempts,
                };
                entry.state = EntryState::Pending;
                self.known.insert(entry.image_path.clone(), EntryState::Pending);
                self.pending.push_back(entry);
                Ok(outcome)
            }
        }
    }

    fn retire(&mut self, mut entry: AnalysisEntry) -> AnalysisEntry {
        entry.state = EntryState::Cached;
        self.known.remove(&entry.image_path);
        log::debug!("analysis: track {} is {:?}", entry.track_id, entry.state);
        entry
    }

    fn analyze_and_store(&mut self, entry: &AnalysisEntry, store: &mut dyn ViolationStore) -> Result<()> {
        let jpeg = std::fs::read(&entry.image_path)?;
        let text = self.analyzer.analyze(&jpeg)?;
        let text = text.trim();
        if text.is_empty() {
            anyhow::bail!("analyzer returned empty text");
        }
        store.update_analysis(&entry.image_path, text)?;
        Ok(())
    }

    /// Step until nothing is pending, pausing `yield_interval` between steps.
    ///
    /// Returns the outcomes in order.
    pub fn run_until_idle(&mut self, store: &mut dyn ViolationStore) -> Result<Vec<StepOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            match self.step(store)? {
                StepOutcome::Idle => return Ok(outcomes),
                outcome => outcomes.push(outcome),
            }
            if !self.pending.is_empty() {
                std::thread::sleep(self.settings.yield_interval);
            }
        }
    }
}
