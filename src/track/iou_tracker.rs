use anyhow::Result;

use super::{Track, Tracker};
use crate::detect::{BoundingBox, Detection};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
pub const DEFAULT_MAX_AGE: u32 = 30;

struct TrackState {
    id: u64,
    bbox: BoundingBox,
    /// Consecutive frames without an associated detection.
    misses: u32,
}

/// Greedy IoU tracker.
///
/// Each frame, detection/track pairs are associated best-IoU first. Unmatched detections
/// open new tracks with monotonically increasing ids; tracks unmatched for more than
/// `max_age` frames are dropped.
pub struct IouTracker {
    iou_threshold: f32,
    max_age: u32,
    next_id: u64,
    tracks: Vec<TrackState>,
}

impl IouTracker {
    pub fn new(iou_threshold: f32, max_age: u32) -> Self {
        Self {
            iou_threshold,
            max_age,
            next_id: 1,
            tracks: Vec::new(),
        }
    }

    /// Begin the id space at `first_id`, e.g. above ids already persisted by earlier sessions.
    pub fn starting_at(mut self, first_id: u64) -> Self {
        self.next_id = first_id.max(1);
        self
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_AGE)
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, detections: &[Detection]) -> Result<Vec<Track>> {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.iou_threshold && iou > 0.0 {
                    pairs.push((iou, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(self.tracks[a.1].id.cmp(&self.tracks[b.1].id))
                .then(a.2.cmp(&b.2))
        });

        let mut track_taken = vec![false; self.tracks.len()];
        let mut det_taken = vec![false; detections.len()];
        let mut visible = Vec::new();

        for (_, ti, di) in pairs {
            if track_taken[ti] || det_taken[di] {
                continue;
            }
            track_taken[ti] = true;
            det_taken[di] = true;
            let track = &mut self.tracks[ti];
            track.bbox = detections[di].bbox;
            track.misses = 0;
            visible.push(Track {
                track_id: track.id,
                bbox: track.bbox,
            });
        }

        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if !track_taken[ti] {
                track.misses += 1;
            }
        }
        let max_age = self.max_age;
        self.tracks.retain(|t| t.misses <= max_age);

        for (di, det) in detections.iter().enumerate() {
            if det_taken[di] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(TrackState {
                id,
                bbox: det.bbox,
                misses: 0,
            });
            visible.push(Track {
                track_id: id,
                bbox: det.bbox,
            });
        }

        visible.sort_by_key(|t| t.track_id);
        Ok(visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32) -> Detection {
        Detection::new(BoundingBox::new(x, 10.0, x + 40.0, 50.0), "truck", 0.9)
    }

    #[test]
    fn keeps_identity_across_small_motion() -> Result<()> {
        let mut tracker = IouTracker::default();
        let first = tracker.update(&[det(0.0)])?;
        let second = tracker.update(&[det(4.0)])?;
        assert_eq!(first[0].track_id, second[0].track_id);
        Ok(())
    }

    #[test]
    fn distant_detection_opens_new_track() -> Result<()> {
        let mut tracker = IouTracker::default();
        let first = tracker.update(&[det(0.0)])?;
        let second = tracker.update(&[det(200.0)])?;
        assert_ne!(first[0].track_id, second[0].track_id);
        Ok(())
    }

    #[test]
    fn stale_tracks_are_evicted() -> Result<()> {
        let mut tracker = IouTracker::new(0.3, 2);
        tracker.update(&[det(0.0)])?;
        for _ in 0..3 {
            tracker.update(&[])?;
        }
        assert_eq!(tracker.live_tracks(), 0);
        // Returning to the old position gets a fresh id.
        let again = tracker.update(&[det(0.0)])?;
        assert_eq!(again[0].track_id, 2);
        Ok(())
    }

    #[test]
    fn seeded_tracker_starts_above_previous_ids() -> Result<()> {
        let mut tracker = IouTracker::default().starting_at(42);
        assert_eq!(tracker.update(&[det(0.0)])?[0].track_id, 42);
        assert_eq!(tracker.update(&[det(0.0), det(300.0)])?[1].track_id, 43);
        Ok(())
    }
}
