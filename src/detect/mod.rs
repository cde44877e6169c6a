mod backend;
mod backends;
mod result;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use image::{ImageReader, RgbImage};

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{BoundingBox, Detection, RawDetection};

use crate::ppe::PpeKind;

/// Class names assumed when no labels file is configured.
///
/// Only correct for a model trained with exactly this class order; the tract
/// backend refuses to start when the model's class count differs.
pub const DEFAULT_CLASS_LABELS: &[&str] = &[
    "hardhat",
    "gloves",
    "vest",
    "mask",
    "goggles",
    "earplugs",
    "no-hardhat",
    "no-gloves",
    "no-vest",
    "no-mask",
    "no-goggles",
    "no-earplugs",
    "person",
];

/// Read class names from a labels file, one per line. Blank lines and `#`
/// comments are skipped.
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read labels file {}", path.display()))?;
    let labels: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        return Err(anyhow!("labels file {} is empty", path.display()));
    }
    Ok(labels)
}

/// Missing-PPE detection adapter.
///
/// Decodes a stored frame, runs the shared backend and keeps only negative-PPE
/// classes at or above the configured threshold. The backend sits behind a
/// mutex since `DetectorBackend::detect` takes `&mut self`.
#[derive(Clone)]
pub struct PpeDetector {
    backend: Arc<Mutex<dyn DetectorBackend>>,
    confidence_threshold: f32,
}

impl PpeDetector {
    pub fn new<B: DetectorBackend + 'static>(backend: B, confidence_threshold: f32) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            confidence_threshold,
        }
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn backend_name(&self) -> Result<&'static str> {
        let guard = self
            .backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?;
        Ok(guard.name())
    }

    pub fn warm_up(&self) -> Result<()> {
        let mut guard = self
            .backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?;
        guard.warm_up()
    }

    /// Detect missing PPE in the image stored at `path`.
    pub fn detect_path(&self, path: &Path) -> Result<Vec<Detection>> {
        let frame = decode_frame(path)?;
        self.detect(&frame)
    }

    /// Detect missing PPE in a decoded frame.
    pub fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let raw = {
            let mut guard = self
                .backend
                .lock()
                .map_err(|_| anyhow!("detector backend lock poisoned"))?;
            guard
                .detect(frame, self.confidence_threshold)
                .with_context(|| format!("{} detector failed", guard.name()))?
        };
        Ok(normalize(raw, self.confidence_threshold))
    }
}

/// Decode an image file, sniffing the format from its content.
pub fn decode_frame(path: &Path) -> Result<RgbImage> {
    let image = ImageReader::open(path)
        .with_context(|| format!("failed to open frame {}", path.display()))?
        .with_guessed_format()
        .context("failed to read frame header")?
        .decode()
        .with_context(|| format!("failed to decode frame {}", path.display()))?;
    Ok(image.to_rgb8())
}

fn normalize(raw: Vec<RawDetection>, confidence_threshold: f32) -> Vec<Detection> {
    raw.into_iter()
        .filter_map(|det| {
            let kind = PpeKind::from_negative_label(&det.label)?;
            if det.confidence < confidence_threshold {
                return None;
            }
            Some(Detection {
                missing_ppe: kind,
                confidence: det.confidence,
                bbox: BoundingBox::from_corners(det.x1, det.y1, det.x2, det.y2),
            })
        })
        .collect()
}
