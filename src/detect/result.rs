use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame pixel coordinates (top-left, bottom-right).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// Intersection over Union with another box. Zero when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Euclidean distance between box centers.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class_label: &str, confidence: f32) -> Self {
        Self {
            bbox,
            class_label: class_label.to_string(),
            confidence,
        }
    }
}

/// Result of running detection on a frame.
#[derive(Clone, Debug, Default)]
pub struct DetectionResult {
    /// Every detection that cleared the confidence threshold.
    pub detections: Vec<Detection>,
    /// Subset of `detections` that breaks the violation rule, in detection order.
    pub flagged: Vec<Detection>,
}

/// Which detections count as violations.
#[derive(Clone, Debug, PartialEq)]
pub struct ViolationRule {
    pub violation_classes: Vec<String>,
    pub min_confidence: f32,
}

impl Default for ViolationRule {
    fn default() -> Self {
        Self {
            violation_classes: vec!["illegal".to_string()],
            min_confidence: 0.5,
        }
    }
}

impl ViolationRule {
    pub fn is_violation(&self, detection: &Detection) -> bool {
        self.violation_classes
            .iter()
            .any(|class| class.eq_ignore_ascii_case(&detection.class_label))
    }

    /// Drop low-confidence detections and split out the flagged subset.
    pub fn apply(&self, raw: Vec<Detection>) -> DetectionResult {
        let detections: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.confidence >= self.min_confidence && d.bbox.is_finite())
            .collect();
        let flagged = detections
            .iter()
            .filter(|d| self.is_violation(d))
            .cloned()
            .collect();
        DetectionResult {
            detections,
            flagged,
        }
    }
}
