use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawDetection;

/// Object detector backend.
///
/// Backends receive a decoded RGB frame and report every object at or above
/// `confidence_threshold`, with boxes in the frame's own pixel space. Mapping
/// labels onto PPE kinds happens in [`crate::detect::PpeDetector`], not here.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &RgbImage, confidence_threshold: f32)
        -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
