//! Tracking capability.
//!
//! A `Tracker` turns per-frame detections into stable identities. The stream worker owns
//! exactly one tracker for its lifetime. A restarted stream gets a fresh tracker whose ids
//! start above the highest id already stored, so an old record never shadows a new vehicle.

mod iou_tracker;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detect::{BoundingBox, Detection};

pub use iou_tracker::{IouTracker, DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_AGE};

/// A tracker-assigned identity and its box in the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: u64,
    pub bbox: BoundingBox,
}

pub trait Tracker: Send {
    /// Feed the current frame's detections; returns the tracks visible in this frame.
    fn update(&mut self, detections: &[Detection]) -> Result<Vec<Track>>;
}
