use anyhow::Result;

use crate::detect::result::DetectionResult;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend owns its model state and applies the configured `ViolationRule` itself, so
/// callers receive both the full detection set and the flagged subset from one call.
/// One backend instance belongs to one stream worker; it is never shared across threads.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// An error skips the frame; it never stops the worker.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
