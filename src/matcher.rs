//! Violation box to track association.
//!
//! The detector flags a box; the tracker knows identities. The matcher attributes each
//! flagged box to at most one track by geometric score.

use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;
use crate::track::Track;

pub const DEFAULT_MIN_SCORE: f32 = 0.3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Intersection over Union.
    #[default]
    Iou,
    /// `1 / (1 + center distance in pixels)`.
    CenterDistance,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Matcher {
    pub policy: MatchPolicy,
    pub min_score: f32,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            policy: MatchPolicy::Iou,
            min_score: DEFAULT_MIN_SCORE,
        }
    }
}

impl Matcher {
    pub fn new(policy: MatchPolicy, min_score: f32) -> Self {
        Self { policy, min_score }
    }

    pub fn score(&self, violation: &BoundingBox, track: &BoundingBox) -> f32 {
        match self.policy {
            MatchPolicy::Iou => violation.iou(track),
            MatchPolicy::CenterDistance => 1.0 / (1.0 + violation.center_distance(track)),
        }
    }

    /// Best-scoring track id, or `None` when no track clears `min_score`.
    ///
    /// Exact score ties resolve to the lowest track id.
    pub fn match_track(&self, violation: &BoundingBox, tracks: &[Track]) -> Option<u64> {
        let mut best: Option<(f32, u64)> = None;
        for track in tracks {
            let score = self.score(violation, &track.bbox);
            if !score.is_finite() || score <= 0.0 || score < self.min_score {
                continue;
            }
            best = match best {
                Some((best_score, best_id))
                    if best_score > score || (best_score == score && best_id <= track.track_id) =>
                {
                    Some((best_score, best_id))
                }
                _ => Some((score, track.track_id)),
            };
        }
        best.map(|(_, id)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: u64, x: f32) -> Track {
        Track {
            track_id: id,
            bbox: BoundingBox::new(x, 0.0, x + 100.0, 100.0),
        }
    }

    #[test]
    fn picks_best_overlap() {
        let matcher = Matcher::default();
        let tracks = [track(1, 0.0), track(2, 40.0), track(3, 500.0)];
        let violation = BoundingBox::new(45.0, 0.0, 145.0, 100.0);
        assert_eq!(matcher.match_track(&violation, &tracks), Some(2));
    }

    #[test]
    fn below_threshold_is_no_match() {
        let matcher = Matcher::default();
        let tracks = [track(1, 90.0)];
        let violation = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        assert_eq!(matcher.match_track(&violation, &tracks), None);
    }

    #[test]
    fn empty_track_list_is_no_match() {
        let matcher = Matcher::default();
        let violation = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(matcher.match_track(&violation, &[]), None);
    }

    #[test]
    fn exact_tie_resolves_to_lowest_id_regardless_of_order() {
        let matcher = Matcher::default();
        let violation = BoundingBox::new(0.0, 0.0, 100.0, 100.0);
        let forward = [track(4, 0.0), track(9, 0.0)];
        let reversed = [track(9, 0.0), track(4, 0.0)];
        assert_eq!(matcher.match_track(&violation, &forward), Some(4));
        assert_eq!(matcher.match_track(&violation, &reversed), Some(4));
    }

    #[test]
    fn repeated_calls_are_deterministic() {
        let matcher = Matcher::new(MatchPolicy::CenterDistance, 0.01);
        let tracks = [track(1, 0.0), track(2, 30.0), track(3, 60.0)];
        let violation = BoundingBox::new(25.0, 0.0, 125.0, 100.0);
        let first = matcher.match_track(&violation, &tracks);
        for _ in 0..10 {
            assert_eq!(matcher.match_track(&violation, &tracks), first);
        }
        assert_eq!(first, Some(2));
    }
}
