use anyhow::Result;

use super::{FrameSource, IngestSettings, Pacer, SourceStats};
use crate::detect::{MARKER_ILLEGAL_RGB, MARKER_VEHICLE_RGB};
use crate::frame::Frame;

const ROAD_RGB: [u8; 3] = [90, 90, 90];
const LANE_RGB: [u8; 3] = [230, 230, 230];
/// Horizontal pixels per frame for the moving vehicle.
const SPEED: u32 = 4;

/// Synthetic road scene for `stub://` URLs.
///
/// A gray road with a lane stripe, one overloaded vehicle (marker red) driving left to
/// right and wrapping around, and one ordinary vehicle (marker blue) parked on the
/// shoulder. The `StubBackend` marker detector recognises both.
pub struct SyntheticSource {
    url: String,
    settings: IngestSettings,
    pacer: Pacer,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(url: &str, settings: IngestSettings) -> Self {
        log::info!("SyntheticSource: {} ({}x{})", url, settings.width, settings.height);
        Self {
            url: url.to_string(),
            pacer: Pacer::new(settings.target_fps),
            settings,
            frame_count: 0,
        }
    }

    fn render(&self) -> Result<Frame> {
        let (w, h) = (self.settings.width.max(8), self.settings.height.max(8));
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        let lane_y = h / 2;
        for y in 0..h {
            let rgb = if y == lane_y { LANE_RGB } else { ROAD_RGB };
            for _ in 0..w {
                pixels.extend_from_slice(&rgb);
            }
        }

        let vehicle_w = (w / 8).max(2);
        let vehicle_h = (h / 8).max(2);
        let travel = w.saturating_sub(vehicle_w).max(1);
        let offset = ((self.frame_count - 1) * SPEED as u64 % travel as u64) as u32;
        fill(&mut pixels, w, offset, lane_y + 2, vehicle_w, vehicle_h, MARKER_ILLEGAL_RGB);
        fill(&mut pixels, w, w - vehicle_w - 1, 1, vehicle_w, vehicle_h, MARKER_VEHICLE_RGB);

        Frame::from_rgb(pixels, w, h, self.frame_count)
    }
}

fn fill(pixels: &mut [u8], width: u32, x: u32, y: u32, w: u32, h: u32, rgb: [u8; 3]) {
    let height = pixels.len() as u32 / (width * 3);
    for row in y..(y + h).min(height) {
        for col in x..(x + w).min(width) {
            let idx = ((row * width + col) * 3) as usize;
            pixels[idx..idx + 3].copy_from_slice(&rgb);
        }
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("synthetic {}", self.url)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.pacer.wait();
        self.frame_count += 1;
        self.render().map(Some)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorBackend, StubBackend, ViolationRule};

    fn source() -> SyntheticSource {
        SyntheticSource::new(
            "stub://road",
            IngestSettings {
                width: 160,
                height: 120,
                target_fps: 0,
            },
        )
    }

    #[test]
    fn frames_are_numbered_from_one() -> Result<()> {
        let mut src = source();
        let a = src.next_frame()?.map(|f| f.index);
        let b = src.next_frame()?.map(|f| f.index);
        assert_eq!((a, b), (Some(1), Some(2)));
        assert_eq!(src.stats().frames_captured, 2);
        Ok(())
    }

    #[test]
    fn marker_detector_flags_the_moving_vehicle() -> Result<()> {
        let mut src = source();
        let mut detector = StubBackend::markers(ViolationRule::default());
        let mut xs = Vec::new();
        for _ in 0..3 {
            let frame = src.next_frame()?.ok_or_else(|| anyhow::anyhow!("no frame"))?;
            let result = detector.detect(&frame)?;
            assert_eq!(result.detections.len(), 2);
            assert_eq!(result.flagged.len(), 1);
            xs.push(result.flagged[0].bbox.x1);
        }
        assert_eq!(xs, vec![0.0, 4.0, 8.0]);
        Ok(())
    }
}
