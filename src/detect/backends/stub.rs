use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;

/// Stub backend. Reports the same fixed detections for every frame.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    detections: Vec<RawDetection>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(detections: Vec<RawDetection>) -> Self {
        Self { detections }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &RgbImage, confidence_threshold: f32) -> Result<Vec<RawDetection>> {
        Ok(self
            .detections
            .iter()
            .filter(|det| det.confidence >= confidence_threshold)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_applies_threshold() {
        let mut backend = StubBackend::with_detections(vec![
            RawDetection::new("no-vest", 0.9, [0.0, 0.0, 4.0, 4.0]),
            RawDetection::new("no-mask", 0.2, [1.0, 1.0, 2.0, 2.0]),
        ]);
        let frame = RgbImage::new(8, 8);

        let all = backend.detect(&frame, 0.0).unwrap();
        assert_eq!(all.len(), 2);

        let strong = backend.detect(&frame, 0.5).unwrap();
        assert_eq!(strong.len(), 1);
        assert_eq!(strong[0].label, "no-vest");

        assert!(StubBackend::new().detect(&frame, 0.0).unwrap().is_empty());
    }
}
