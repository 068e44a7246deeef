use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, DetectionResult, ViolationRule};
use crate::frame::Frame;

/// Pixel color the synthetic scene uses for an overloaded truck.
pub const MARKER_ILLEGAL_RGB: [u8; 3] = [220, 20, 20];
/// Pixel color the synthetic scene uses for an ordinary vehicle.
pub const MARKER_VEHICLE_RGB: [u8; 3] = [20, 20, 220];

const MARKER_CONFIDENCE: f32 = 0.9;

/// Stub backend for tests and demos.
///
/// `markers` finds the solid marker colors drawn by the `stub://` source.
/// `scripted` replays fixed detections keyed by frame index.
pub struct StubBackend {
    mode: StubMode,
    rule: ViolationRule,
    fail_on: HashSet<u64>,
}

enum StubMode {
    Markers,
    Scripted(HashMap<u64, Vec<Detection>>),
}

impl StubBackend {
    pub fn markers(rule: ViolationRule) -> Self {
        Self {
            mode: StubMode::Markers,
            rule,
            fail_on: HashSet::new(),
        }
    }

    pub fn scripted(rule: ViolationRule, script: HashMap<u64, Vec<Detection>>) -> Self {
        Self {
            mode: StubMode::Scripted(script),
            rule,
            fail_on: HashSet::new(),
        }
    }

    /// Return an error instead of a result for the given frame index.
    pub fn with_failure_on(mut self, frame_index: u64) -> Self {
        self.fail_on.insert(frame_index);
        self
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        if self.fail_on.contains(&frame.index) {
            return Err(anyhow!("stub detector failure on frame {}", frame.index));
        }

        let raw = match &self.mode {
            StubMode::Markers => find_markers(frame),
            StubMode::Scripted(script) => script.get(&frame.index).cloned().unwrap_or_default(),
        };
        Ok(self.rule.apply(raw))
    }
}

fn find_markers(frame: &Frame) -> Vec<Detection> {
    let markers = [
        (MARKER_ILLEGAL_RGB, "illegal"),
        (MARKER_VEHICLE_RGB, "truck"),
    ];
    let mut out = Vec::new();
    for (rgb, label) in markers {
        if let Some(bbox) = marker_bounds(frame, rgb) {
            out.push(Detection::new(bbox, label, MARKER_CONFIDENCE));
        }
    }
    out
}

fn marker_bounds(frame: &Frame, rgb: [u8; 3]) -> Option<BoundingBox> {
    let width = frame.width as usize;
    let mut min_x = usize::MAX;
    let mut min_y = usize::MAX;
    let mut max_x = 0usize;
    let mut max_y = 0usize;
    let mut found = false;

    for (i, px) in frame.pixels().chunks_exact(3).enumerate() {
        if px == rgb {
            let (x, y) = (i % width, i / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            found = true;
        }
    }

    found.then(|| {
        BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_marker(rgb: [u8; 3]) -> Frame {
        let (w, h) = (20u32, 10u32);
        let mut data = vec![100u8; (w * h * 3) as usize];
        for y in 2..5 {
            for x in 4..9 {
                let offset = ((y * w + x) * 3) as usize;
                data[offset..offset + 3].copy_from_slice(&rgb);
            }
        }
        Frame::from_rgb(data, w, h, 1).unwrap()
    }

    #[test]
    fn markers_mode_finds_illegal_box() {
        let mut backend = StubBackend::markers(ViolationRule::default());
        let result = backend.detect(&frame_with_marker(MARKER_ILLEGAL_RGB)).unwrap();
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.flagged.len(), 1);
        assert_eq!(result.flagged[0].bbox, BoundingBox::new(4.0, 2.0, 9.0, 5.0));
    }

    #[test]
    fn markers_mode_does_not_flag_ordinary_vehicle() {
        let mut backend = StubBackend::markers(ViolationRule::default());
        let result = backend.detect(&frame_with_marker(MARKER_VEHICLE_RGB)).unwrap();
        assert_eq!(result.detections.len(), 1);
        assert!(result.flagged.is_empty());
    }

    #[test]
    fn scripted_mode_replays_and_fails_on_request() {
        let mut script = HashMap::new();
        script.insert(
            2,
            vec![Detection::new(BoundingBox::new(0.0, 0.0, 4.0, 4.0), "illegal", 0.7)],
        );
        let mut backend =
            StubBackend::scripted(ViolationRule::default(), script).with_failure_on(3);

        let f1 = Frame::solid(8, 8, [0, 0, 0], 1).unwrap();
        let f2 = Frame::solid(8, 8, [0, 0, 0], 2).unwrap();
        let f3 = Frame::solid(8, 8, [0, 0, 0], 3).unwrap();
        assert!(backend.detect(&f1).unwrap().detections.is_empty());
        assert_eq!(backend.detect(&f2).unwrap().flagged.len(), 1);
        assert!(backend.detect(&f3).is_err());
    }
}
