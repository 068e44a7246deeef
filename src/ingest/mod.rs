//! Frame ingestion sources.
//!
//! Every source yields `Ok(Some(frame))`, `Ok(None)` ("nothing this time") or an error.
//! The stream worker treats the last two the same way: skip the iteration and ask again.
//!
//! Sources by URL scheme:
//! - `stub://...`: synthetic road scene (tests, demos)
//! - `dir://<path>`: replay of still images in a directory, sorted by file name
//! - anything else: GStreamer `uridecodebin` (feature: ingest-gstreamer)
//!
//! Closing a source is dropping it.

mod dir;
#[cfg(feature = "ingest-gstreamer")]
mod gstreamer;
mod synthetic;

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::frame::Frame;

pub use dir::DirSource;
#[cfg(feature = "ingest-gstreamer")]
pub use self::gstreamer::GstreamerSource;
pub use synthetic::SyntheticSource;

/// Decode parameters shared by all sources.
#[derive(Clone, Debug)]
pub struct IngestSettings {
    /// Synthetic frame width.
    pub width: u32,
    /// Synthetic frame height.
    pub height: u32,
    /// Upper bound on delivered frames per second. 0 disables pacing.
    pub target_fps: u32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

pub trait FrameSource: Send {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats;
}

/// Sleeps just enough to keep delivery at or under `target_fps`.
pub(crate) struct Pacer {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(target_fps: u32) -> Self {
        Self {
            interval: (target_fps > 0).then(|| Duration::from_millis(1000 / target_fps as u64)),
            last: None,
        }
    }

    pub(crate) fn wait(&mut self) {
        if let (Some(interval), Some(last)) = (self.interval, self.last) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

/// Open the source named by `url`.
pub fn open_source(url: &str, settings: &IngestSettings) -> Result<Box<dyn FrameSource>> {
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(url, settings.clone())));
    }
    if let Some(path) = url.strip_prefix("dir://") {
        return Ok(Box::new(DirSource::open(path, settings.target_fps)?));
    }

    #[cfg(feature = "ingest-gstreamer")]
    {
        Ok(Box::new(GstreamerSource::open(url, settings.target_fps)?))
    }
    #[cfg(not(feature = "ingest-gstreamer"))]
    {
        Err(anyhow!(
            "source '{}' requires the ingest-gstreamer feature",
            url
        ))
    }
}

/// Source that replays a fixed script of reads, then reports "no frame" forever.
pub struct ScriptedSource {
    script: VecDeque<Result<Option<Frame>>>,
    frames_captured: u64,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Option<Frame>>) -> Self {
        Self::from_results(frames.into_iter().map(Ok).collect())
    }

    /// Script that can include read failures.
    pub fn from_results(script: Vec<Result<Option<Frame>>>) -> Self {
        Self {
            script: script.into(),
            frames_captured: 0,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let next = self.script.pop_front().unwrap_or(Ok(None));
        if let Ok(Some(_)) = &next {
            self.frames_captured += 1;
        }
        next
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frames_captured,
            url: "scripted://".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_source_replays_then_idles() -> Result<()> {
        let mut source = ScriptedSource::from_results(vec![
            Ok(Some(Frame::solid(2, 2, [0, 0, 0], 1)?)),
            Err(anyhow!("decoder hiccup")),
            Ok(None),
            Ok(Some(Frame::solid(2, 2, [0, 0, 0], 2)?)),
        ]);
        assert_eq!(source.next_frame()?.map(|f| f.index), Some(1));
        assert!(source.next_frame().is_err());
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.next_frame()?.map(|f| f.index), Some(2));
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }

    #[test]
    fn unknown_scheme_without_decoder_fails() {
        if cfg!(feature = "ingest-gstreamer") {
            return;
        }
        assert!(open_source("rtsp://camera/stream", &IngestSettings::default()).is_err());
    }

    #[test]
    fn stub_scheme_opens_synthetic_source() -> Result<()> {
        let settings = IngestSettings {
            width: 64,
            height: 48,
            target_fps: 0,
        };
        let mut source = open_source("stub://road", &settings)?;
        let frame = source.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        assert_eq!((frame.width, frame.height), (64, 48));
        Ok(())
    }
}
