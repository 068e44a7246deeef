//! GStreamer-backed decoder for RTSP, HTTP(S) and file URLs.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::{Duration, Instant};

use super::{FrameSource, Pacer, SourceStats};
use crate::frame::Frame;

pub struct GstreamerSource {
    url: String,
    target_fps: u32,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    pacer: Pacer,
    frame_count: u64,
    started_at: Instant,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl GstreamerSource {
    /// Build `uridecodebin ! videoconvert ! appsink(RGB)` and start playing.
    pub fn open(url: &str, target_fps: u32) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let uri = if url.contains("://") {
            url.to_string()
        } else {
            format!("file://{}", url)
        };
        let description = format!(
            "uridecodebin uri=\"{}\" ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            uri
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build decode pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("decode pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start decoding {}", url))?;
        log::info!("GstreamerSource: playing {}", url);

        Ok(Self {
            url: url.to_string(),
            target_fps,
            pipeline,
            appsink,
            pacer: Pacer::new(target_fps),
            frame_count: 0,
            started_at: Instant::now(),
            last_frame_at: None,
            last_error: None,
        })
    }

    fn frame_timeout(&self) -> Duration {
        let ms = if self.target_fps == 0 {
            500
        } else {
            (1000 / self.target_fps as u64).saturating_mul(4)
        };
        Duration::from_millis(ms.max(500))
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl FrameSource for GstreamerSource {
    fn describe(&self) -> String {
        format!("gstreamer {}", self.url)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }
        self.pacer.wait();

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            return Ok(None);
        };
        let (pixels, width, height) = sample_to_pixels(&sample)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::from_rgb(pixels, width, height, self.frame_count).map(Some)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        match self.last_frame_at {
            Some(at) => at.elapsed() <= Duration::from_secs(2),
            None => self.started_at.elapsed() <= Duration::from_secs(5),
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.url.clone(),
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerSource: failed to stop {}: {}", self.url, e);
        }
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();
    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("sample buffer shorter than its caps")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("sample row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
