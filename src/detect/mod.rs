mod backend;
mod backends;
mod result;

pub use backend::DetectorBackend;
pub use backends::{StubBackend, MARKER_ILLEGAL_RGB, MARKER_VEHICLE_RGB};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{BoundingBox, Detection, DetectionResult, ViolationRule};

use anyhow::{anyhow, Result};

use crate::config::DetectionSettings;

/// Build the backend named in configuration.
pub fn build_backend(settings: &DetectionSettings) -> Result<Box<dyn DetectorBackend>> {
    let rule = ViolationRule {
        violation_classes: settings.violation_classes.clone(),
        min_confidence: settings.confidence_threshold,
    };
    match settings.backend.as_str() {
        "stub" => Ok(Box::new(StubBackend::markers(rule))),
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract backend requires detection.model_path"))?;
            let backend = TractBackend::new(
                model_path,
                settings.input_width,
                settings.input_height,
                settings.class_names.clone(),
                rule,
            )?;
            Ok(Box::new(backend))
        }
        other => Err(anyhow!(
            "detector backend '{}' is not available in this build",
            other
        )),
    }
}
