//! Decoded frame container.
//!
//! Every frame source hands the pipeline a `Frame`: tightly packed RGB24 pixels plus the
//! dimensions and a per-source sequence number. Frames are transient; the only pixels
//! that outlive a loop iteration are evidence crops written by `evidence`.

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::evidence::PixelBox;

/// RGB24 frame. Pixel bytes are owned and never shared across threads.
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// 1-based sequence number assigned by the source.
    pub index: u64,
}

impl Frame {
    /// Wrap packed RGB24 pixels. The byte length must match the dimensions exactly.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))? as usize;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            index,
        })
    }

    /// Frame filled with a single color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], index: u64) -> Result<Self> {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take((width as usize) * (height as usize) * 3)
            .collect();
        Self::from_rgb(pixels, width, height, index)
    }

    pub fn from_image(image: RgbImage, index: u64) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::from_rgb(image.into_raw(), width, height, index)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Copy a region out as an owned image. The region must lie inside the frame.
    pub fn crop(&self, region: PixelBox) -> Result<RgbImage> {
        if region.x2 > self.width || region.y2 > self.height {
            return Err(anyhow!(
                "crop region {:?} exceeds frame {}x{}",
                region,
                self.width,
                self.height
            ));
        }
        let crop_w = region.width();
        let crop_h = region.height();
        if crop_w == 0 || crop_h == 0 {
            return Err(anyhow!("crop region {:?} is empty", region));
        }

        let stride = self.width as usize * 3;
        let mut out = Vec::with_capacity(crop_w as usize * crop_h as usize * 3);
        for row in region.y1..region.y2 {
            let start = row as usize * stride + region.x1 as usize * 3;
            let end = start + crop_w as usize * 3;
            out.extend_from_slice(&self.data[start..end]);
        }
        RgbImage::from_raw(crop_w, crop_h, out)
            .ok_or_else(|| anyhow!("crop buffer does not match {}x{}", crop_w, crop_h))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_length_mismatch() {
        assert!(Frame::from_rgb(vec![0u8; 10], 2, 2, 1).is_err());
    }

    #[test]
    fn crop_copies_expected_pixels() -> Result<()> {
        // 3x2 frame, pixel value encodes its column.
        let mut data = Vec::new();
        for _row in 0..2 {
            for col in 0..3u8 {
                data.extend_from_slice(&[col, col, col]);
            }
        }
        let frame = Frame::from_rgb(data, 3, 2, 1)?;
        let crop = frame.crop(PixelBox {
            x1: 1,
            y1: 0,
            x2: 3,
            y2: 2,
        })?;
        assert_eq!(crop.dimensions(), (2, 2));
        assert_eq!(crop.get_pixel(0, 0).0, [1, 1, 1]);
        assert_eq!(crop.get_pixel(1, 1).0, [2, 2, 2]);
        Ok(())
    }

    #[test]
    fn crop_outside_frame_fails() -> Result<()> {
        let frame = Frame::solid(4, 4, [9, 9, 9], 1)?;
        let region = PixelBox {
            x1: 2,
            y1: 2,
            x2: 5,
            y2: 4,
        };
        assert!(frame.crop(region).is_err());
        Ok(())
    }
}
