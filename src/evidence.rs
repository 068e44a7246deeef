//! Evidence capture.
//!
//! Turns a flagged box on a frame into a JPEG on disk:
//! 1. Expand the raw box by a relative margin on every side
//! 2. Clip to the frame so the stored box is always in bounds
//! 3. Crop, optionally enhance (upscale), encode
//! 4. Write under `<root>/<YYYY-MM-DD>/illegal_<track_id>_<HHMMSS>.jpg`

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::detect::BoundingBox;
use crate::frame::Frame;

pub const DEFAULT_MARGIN: f32 = 0.1;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Integer box that always satisfies `x1 < x2 <= width`, `y1 < y2 <= height` for its frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelBox {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }
}

/// Expand `raw` by `margin` of its width/height per side and clip to the frame.
///
/// Coordinates are truncated toward zero. A box that collapses after clipping is widened
/// to one pixel inside the frame. Returns `None` for an empty frame or non-finite input.
pub fn expand_and_clip(raw: &BoundingBox, margin: f32, width: u32, height: u32) -> Option<PixelBox> {
    if width == 0 || height == 0 || !raw.is_finite() || !margin.is_finite() {
        return None;
    }
    let (x1, x2) = expand_axis(raw.x1, raw.x2, margin, width);
    let (y1, y2) = expand_axis(raw.y1, raw.y2, margin, height);
    Some(PixelBox { x1, y1, x2, y2 })
}

fn expand_axis(a: f32, b: f32, margin: f32, limit: u32) -> (u32, u32) {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let pad = (hi - lo) * margin.max(0.0);
    let limit = limit as i64;

    let start = ((lo - pad) as i64).clamp(0, limit - 1);
    let end = ((hi + pad) as i64).clamp(start + 1, limit);
    (start as u32, end as u32)
}

/// Resolution enhancement applied to a crop before encoding.
pub trait Enhancer: Send {
    fn name(&self) -> &'static str;

    fn enhance(&self, crop: RgbImage) -> Result<RgbImage>;
}

/// Integer-factor upscale with a Lanczos filter.
#[derive(Clone, Copy, Debug)]
pub struct ResizeEnhancer {
    pub factor: u32,
}

impl Enhancer for ResizeEnhancer {
    fn name(&self) -> &'static str {
        "resize"
    }

    fn enhance(&self, crop: RgbImage) -> Result<RgbImage> {
        if self.factor <= 1 {
            return Ok(crop);
        }
        let (w, h) = crop.dimensions();
        let new_w = w
            .checked_mul(self.factor)
            .ok_or_else(|| anyhow!("upscaled width overflows"))?;
        let new_h = h
            .checked_mul(self.factor)
            .ok_or_else(|| anyhow!("upscaled height overflows"))?;
        Ok(image::imageops::resize(&crop, new_w, new_h, FilterType::Lanczos3))
    }
}

/// An evidence file that has been written.
#[derive(Clone, Debug, PartialEq)]
pub struct Evidence {
    pub bbox: PixelBox,
    pub image_path: PathBuf,
    pub timestamp: String,
}

pub struct EvidenceWriter {
    root: PathBuf,
    margin: f32,
    jpeg_quality: u8,
    enhancer: Option<Box<dyn Enhancer>>,
}

impl EvidenceWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            margin: DEFAULT_MARGIN,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            enhancer: None,
        }
    }

    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn with_enhancer(mut self, enhancer: Box<dyn Enhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    /// Crop, enhance, encode and write one evidence image.
    pub fn capture(
        &self,
        frame: &Frame,
        raw: &BoundingBox,
        track_id: u64,
        now: DateTime<Local>,
    ) -> Result<Evidence> {
        let bbox = expand_and_clip(raw, self.margin, frame.width, frame.height)
            .ok_or_else(|| anyhow!("cannot clip box {:?} to {}x{} frame", raw, frame.width, frame.height))?;

        let mut crop = frame.crop(bbox)?;
        if let Some(enhancer) = &self.enhancer {
            crop = enhancer
                .enhance(crop)
                .with_context(|| format!("{} enhancer failed", enhancer.name()))?;
        }

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality)
            .encode_image(&crop)
            .context("encode evidence jpeg")?;

        let image_path = self.path_for(track_id, now);
        if let Some(dir) = image_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create evidence dir {}", dir.display()))?;
        }
        std::fs::write(&image_path, &jpeg)
            .with_context(|| format!("write evidence {}", image_path.display()))?;

        Ok(Evidence {
            bbox,
            image_path,
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
        })
    }

    pub fn path_for(&self, track_id: u64, now: DateTime<Local>) -> PathBuf {
        self.root
            .join(now.format("%Y-%m-%d").to_string())
            .join(format!("illegal_{}_{}.jpg", track_id, now.format("%H%M%S")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn assert_in_bounds(b: PixelBox, w: u32, h: u32) {
        assert!(b.x1 < b.x2 && b.x2 <= w, "{:?} x out of {}", b, w);
        assert!(b.y1 < b.y2 && b.y2 <= h, "{:?} y out of {}", b, h);
    }

    #[test]
    fn margin_expands_by_ten_percent() {
        let raw = BoundingBox::new(100.0, 100.0, 200.0, 150.0);
        let b = expand_and_clip(&raw, 0.1, 640, 480).unwrap();
        assert_eq!(
            b,
            PixelBox {
                x1: 90,
                y1: 95,
                x2: 210,
                y2: 155
            }
        );
    }

    #[test]
    fn expansion_is_clipped_to_frame() {
        let raw = BoundingBox::new(2.0, 3.0, 638.0, 479.0);
        let b = expand_and_clip(&raw, 0.1, 640, 480).unwrap();
        assert_eq!(
            b,
            PixelBox {
                x1: 0,
                y1: 0,
                x2: 640,
                y2: 480
            }
        );
    }

    #[test]
    fn clipping_holds_for_hostile_boxes() {
        let cases = [
            BoundingBox::new(-50.0, -50.0, -10.0, -10.0),
            BoundingBox::new(700.0, 500.0, 900.0, 800.0),
            BoundingBox::new(300.0, 200.0, 300.0, 200.0),
            BoundingBox::new(400.0, 300.0, 100.0, 50.0),
            BoundingBox::new(639.9, 479.9, 1e9, 1e9),
        ];
        for raw in cases {
            let b = expand_and_clip(&raw, 0.1, 640, 480).unwrap();
            assert_in_bounds(b, 640, 480);
        }
    }

    #[test]
    fn rejects_non_finite_and_empty_frames() {
        let nan = BoundingBox::new(f32::NAN, 0.0, 10.0, 10.0);
        assert!(expand_and_clip(&nan, 0.1, 640, 480).is_none());
        let ok = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!(expand_and_clip(&ok, 0.1, 0, 480).is_none());
    }

    #[test]
    fn capture_writes_dated_jpeg() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = EvidenceWriter::new(dir.path()).with_enhancer(Box::new(ResizeEnhancer { factor: 2 }));
        let frame = Frame::solid(64, 48, [200, 10, 10], 1)?;
        let now = Local
            .with_ymd_and_hms(2024, 5, 17, 13, 4, 5)
            .single()
            .ok_or_else(|| anyhow!("ambiguous local time"))?;

        let ev = writer.capture(&frame, &BoundingBox::new(10.0, 10.0, 30.0, 30.0), 7, now)?;

        assert_eq!(ev.timestamp, "2024-05-17 13:04:05");
        assert_eq!(
            ev.image_path,
            dir.path().join("2024-05-17").join("illegal_7_130405.jpg")
        );
        let decoded = image::open(&ev.image_path)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (ev.bbox.width() * 2, ev.bbox.height() * 2));
        Ok(())
    }
}
