use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use overload_watch::{
    BoundingBox, Coordinator, Detection, DetectorBackend, EvidenceWriter, Frame, FrameSource,
    IouTracker, Matcher, Notification, PipelineFactory, QueueSettings, ScriptedSource,
    SqliteViolationStore, StepOutcome, StubBackend, Tracker, ViolationRule, ViolationStore,
    VisionAnalyzer,
};

const FRAMES: u64 = 10;

/// One vehicle crossing the frame, labelled "illegal" in frames 3, 5 and 9.
struct ScriptedFactory {
    db_path: String,
    evidence_dir: PathBuf,
    min_first_id: u64,
}

impl ScriptedFactory {
    fn new(dir: &Path, min_first_id: u64) -> Self {
        Self {
            db_path: dir.join("violations.db").to_string_lossy().to_string(),
            evidence_dir: dir.join("captures"),
            min_first_id,
        }
    }

    fn script() -> HashMap<u64, Vec<Detection>> {
        (1..=FRAMES)
            .map(|i| {
                let label = if matches!(i, 3 | 5 | 9) { "illegal" } else { "truck" };
                let x = 20.0 + i as f32 * 3.0;
                let det = Detection::new(BoundingBox::new(x, 40.0, x + 60.0, 100.0), label, 0.9);
                (i, vec![det])
            })
            .collect()
    }
}

impl PipelineFactory for ScriptedFactory {
    fn open_source(&self, _url: &str) -> Result<Box<dyn FrameSource>> {
        let frames = (1..=FRAMES)
            .map(|i| Frame::solid(240, 160, [60, 60, 60], i).map(Some))
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(ScriptedSource::new(frames)))
    }

    fn open_store(&self) -> Result<Box<dyn ViolationStore>> {
        Ok(Box::new(SqliteViolationStore::open(&self.db_path)?))
    }

    fn detector(&self) -> Result<Box<dyn DetectorBackend>> {
        Ok(Box::new(StubBackend::scripted(ViolationRule::default(), Self::script())))
    }

    fn tracker(&self, first_id: u64) -> Result<Box<dyn Tracker>> {
        Ok(Box::new(IouTracker::default().starting_at(first_id.max(self.min_first_id))))
    }

    fn evidence_writer(&self) -> Result<EvidenceWriter> {
        Ok(EvidenceWriter::new(&self.evidence_dir))
    }

    fn matcher(&self) -> Matcher {
        Matcher::default()
    }
}

struct CountingAnalyzer {
    calls: Arc<AtomicUsize>,
}

impl VisionAnalyzer for CountingAnalyzer {
    fn name(&self) -> &str {
        "counting"
    }

    fn analyze(&mut self, _jpeg: &[u8]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("Dump truck with an uncovered, overfilled bed".to_string())
    }
}

fn quick() -> QueueSettings {
    QueueSettings {
        max_attempts: 3,
        yield_interval: Duration::from_millis(0),
    }
}

fn coordinator(factory: Arc<ScriptedFactory>, calls: &Arc<AtomicUsize>) -> Result<Coordinator> {
    let analyzer: Box<dyn VisionAnalyzer> = Box::new(CountingAnalyzer {
        calls: calls.clone(),
    });
    Coordinator::new(factory, Some(analyzer), quick())
}

fn run_all_frames(coordinator: &mut Coordinator, label: &str) -> Result<()> {
    coordinator.start_stream("scripted://", label)?;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let read = coordinator.worker_stats().map_or(0, |s| s.frames_read);
        if read >= FRAMES {
            break;
        }
        if Instant::now() > deadline {
            return Err(anyhow!("worker read only {} frames", read));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    coordinator.stop_stream()
}

#[test]
fn one_record_per_vehicle_and_one_analysis_per_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let factory = Arc::new(ScriptedFactory::new(dir.path(), 7));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut first = coordinator(factory.clone(), &calls)?;
    run_all_frames(&mut first, "cam-7")?;

    let new_records: Vec<u64> = first
        .take_events()
        .into_iter()
        .filter_map(|event| match event {
            Notification::NewRecord { track_id, .. } => Some(track_id),
            _ => None,
        })
        .collect();
    assert_eq!(new_records, vec![7]);

    let records = first.store().list_all()?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].track_id, 7);
    assert_eq!(records[0].source_label, "cam-7");
    assert!(Path::new(&records[0].image_path).exists());

    assert_eq!(first.run_queue_until_idle()?, vec![StepOutcome::Analyzed { track_id: 7 }]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    drop(first);

    // A later session finds the cached result and never calls the analyzer.
    let second_calls = Arc::new(AtomicUsize::new(0));
    let mut second = coordinator(factory, &second_calls)?;
    assert_eq!(second.run_queue_until_idle()?, vec![StepOutcome::CacheHit { track_id: 7 }]);
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn restarted_stream_never_reuses_stored_track_ids() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let factory = Arc::new(ScriptedFactory::new(dir.path(), 1));
    let calls = Arc::new(AtomicUsize::new(0));
    let mut coordinator = coordinator(factory, &calls)?;

    run_all_frames(&mut coordinator, "cam-a")?;
    run_all_frames(&mut coordinator, "cam-a")?;

    let mut ids: Vec<u64> = coordinator
        .store()
        .list_all()?
        .iter()
        .map(|r| r.track_id)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);
    Ok(())
}
