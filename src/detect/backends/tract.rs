#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;

const LETTERBOX_FILL: u8 = 114;
const DEFAULT_IOU_THRESHOLD: f32 = 0.7;

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Expects a single square input `[1, 3, S, S]` and a `[1, 4 + classes, anchors]`
/// output (the transposed layout is accepted too), rows being
/// `cx, cy, w, h` followed by per-class scores.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>,
    input_size: u32,
    labels: Vec<String>,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, labels: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?;
        let output = model
            .output_fact(0)
            .context("ONNX model has no output")?;
        match output.shape.as_concrete() {
            Some(shape) => check_labels(shape, &labels)?,
            None => log::warn!(
                "output shape of {} is symbolic; class labels cannot be checked",
                model_path.display()
            ),
        }
        let model = model
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            labels,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// Override the default NMS IoU threshold.
    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &RgbImage) -> Result<(Tensor, Letterbox)> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("frame has no pixels ({}x{})", width, height));
        }
        let letterbox = Letterbox::fit(width, height, self.input_size);
        let resized = imageops::resize(
            frame,
            letterbox.width,
            letterbox.height,
            FilterType::Triangle,
        );
        let mut canvas = RgbImage::from_pixel(
            self.input_size,
            self.input_size,
            Rgb([LETTERBOX_FILL; 3]),
        );
        imageops::replace(
            &mut canvas,
            &resized,
            letterbox.pad_x as i64,
            letterbox.pad_y as i64,
        );

        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        });
        Ok((input.into_tensor(), letterbox))
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        letterbox: Letterbox,
        frame_size: (u32, u32),
        confidence_threshold: f32,
    ) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output must have rank 3")?;
        let shape = view.shape();
        if shape[0] != 1 {
            return Err(anyhow!("expected batch size 1, got {}", shape[0]));
        }
        let channels_first = shape[1] <= shape[2];
        let (channels, anchors) = if channels_first {
            (shape[1], shape[2])
        } else {
            (shape[2], shape[1])
        };
        if channels < 5 {
            return Err(anyhow!(
                "model output has {} channels; expected box + class scores",
                channels
            ));
        }
        let at = |channel: usize, anchor: usize| {
            if channels_first {
                view[[0, channel, anchor]]
            } else {
                view[[0, anchor, channel]]
            }
        };

        let (frame_w, frame_h) = (frame_size.0 as f32, frame_size.1 as f32);
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (4..channels)
                .map(|c| (c - 4, at(c, anchor)))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if score.is_nan() || score < confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
            let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
            let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);
            candidates.push(Candidate {
                class_id,
                score,
                corners: [
                    x1.clamp(0.0, frame_w),
                    y1.clamp(0.0, frame_h),
                    x2.clamp(0.0, frame_w),
                    y2.clamp(0.0, frame_h),
                ],
            });
        }

        Ok(non_max_suppression(candidates, self.iou_threshold)
            .into_iter()
            .map(|c| RawDetection::new(self.label_for(c.class_id), c.score, c.corners))
            .collect())
    }

    fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &RgbImage, confidence_threshold: f32) -> Result<Vec<RawDetection>> {
        let (input, letterbox) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, letterbox, frame.dimensions(), confidence_threshold)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::from_pixel(self.input_size, self.input_size, Rgb([LETTERBOX_FILL; 3]));
        self.detect(&blank, 1.0).map(|_| ())
    }
}

/// Number of classes in a `[1, 4 + classes, anchors]` output (or its
/// transpose).
fn class_count(shape: &[usize]) -> Result<usize> {
    let [batch, a, b] = shape else {
        return Err(anyhow!("model output must have rank 3, got {:?}", shape));
    };
    if *batch != 1 {
        return Err(anyhow!("expected batch size 1, got {}", batch));
    }
    let channels = if a <= b { *a } else { *b };
    if channels < 5 {
        return Err(anyhow!(
            "model output has {} channels; expected box + class scores",
            channels
        ));
    }
    Ok(channels - 4)
}

fn check_labels(output_shape: &[usize], labels: &[String]) -> Result<()> {
    let classes = class_count(output_shape)?;
    if classes != labels.len() {
        return Err(anyhow!(
            "model predicts {} classes but {} labels are configured; set MODEL_LABELS_PATH to the model's class list",
            classes,
            labels.len()
        ));
    }
    Ok(())
}

/// Uniform resize plus centered padding into a square model input.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Letterbox {
    scale: f32,
    width: u32,
    height: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, side: u32) -> Self {
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, side);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, side);
        Self {
            scale,
            width: scaled_w,
            height: scaled_h,
            pad_x: (side - scaled_w) / 2,
            pad_y: (side - scaled_h) / 2,
        }
    }

    /// Model-input coordinates back to original-frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Candidate {
    class_id: usize,
    score: f32,
    corners: [f32; 4],
}

/// Greedy per-class NMS, highest score first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let overlaps = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.corners, &candidate.corners) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}
