#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, DetectionResult, ViolationRule};
use crate::frame::Frame;

/// Tract-based backend for ONNX vehicle detection.
///
/// The model takes a `1x3xHxW` float RGB tensor in `0..1` and returns rows of
/// `[x1, y1, x2, y2, score, class_id]` in model-input pixels (a YOLO export with NMS
/// folded in). Boxes are scaled back to frame coordinates before the rule is applied.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    class_names: Vec<String>,
    rule: ViolationRule,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        class_names: Vec<String>,
        rule: ViolationRule,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            class_names,
            rule,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = if frame.width == self.width && frame.height == self.height {
            image
        } else {
            image::imageops::resize(&image, self.width, self.height, FilterType::Triangle)
        };

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let rows = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = rows.shape().to_vec();
        let cols = *shape.last().ok_or_else(|| anyhow!("model output has no shape"))?;
        if cols < 6 {
            return Err(anyhow!("expected at least 6 values per row, got {}", cols));
        }

        let scale_x = frame.width as f32 / self.width as f32;
        let scale_y = frame.height as f32 / self.height as f32;
        let flat: Vec<f32> = rows.iter().copied().collect();

        let mut out = Vec::new();
        for row in flat.chunks_exact(cols) {
            let class_id = row[5].max(0.0) as usize;
            let label = self
                .class_names
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", class_id));
            out.push(Detection {
                bbox: BoundingBox::new(
                    row[0] * scale_x,
                    row[1] * scale_y,
                    row[2] * scale_x,
                    row[3] * scale_y,
                ),
                class_label: label,
                confidence: row[4],
            });
        }
        Ok(out)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let raw = self.decode(outputs, frame)?;
        Ok(self.rule.apply(raw))
    }
}
