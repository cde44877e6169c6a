//! Frame annotation for human review.
//!
//! Boxes are stroked with raqote; labels use the 8x8 bitmap glyphs from
//! `font8x8` blitted straight into the draw target, so no system fonts are
//! needed.

use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use raqote::{DrawOptions, DrawTarget, LineJoin, PathBuilder, SolidSource, Source, StrokeStyle};

use crate::artifact::TransientArtifact;
use crate::detect::{decode_frame, BoundingBox, Detection};

const GLYPH_SIZE: i32 = 8;
const LABEL_BASELINE: i32 = 3;
const LABEL_PADDING: i32 = 4;
const BOX_STROKE_WIDTH: f32 = 2.0;
const TEXT_COLOR: u32 = 0xFFFF_FFFF;
const JPEG_QUALITY: u8 = 90;
const DRAW_MARGIN: i32 = 64;

/// Label drawn above each box.
pub fn label_for(detection: &Detection) -> String {
    format!("No {}: {:.2}", detection.missing_ppe, detection.confidence)
}

#[derive(Clone, Debug)]
pub struct Annotator {
    work_dir: std::path::PathBuf,
}

impl Annotator {
    pub fn new(work_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// Write an annotated copy of the frame at `frame`.
    ///
    /// Returns `None` when the frame cannot be decoded or the copy cannot be
    /// written; callers then fall back to the original upload.
    pub fn annotate(&self, frame: &Path, detections: &[Detection]) -> Option<TransientArtifact> {
        let image = match decode_frame(frame) {
            Ok(image) => image,
            Err(err) => {
                log::error!("cannot open image {}: {:#}", frame.display(), err);
                return None;
            }
        };
        let annotated = draw_detections(&image, detections);
        match self.write_jpeg(&annotated) {
            Ok(artifact) => Some(artifact),
            Err(err) => {
                log::error!("failed to write annotated frame: {:#}", err);
                None
            }
        }
    }

    fn write_jpeg(&self, image: &RgbImage) -> Result<TransientArtifact> {
        let (artifact, file) = TransientArtifact::create(&self.work_dir, "annotated_", ".jpg")?;
        let mut writer = BufWriter::new(file);
        image
            .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY))
            .context("failed to encode annotated frame")?;
        writer.flush().context("failed to flush annotated frame")?;
        Ok(artifact)
    }
}

/// Render boxes and labels onto a copy of `image`.
pub fn draw_detections(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut dt = DrawTarget::new(width as i32, height as i32);
    for (dst, px) in dt.get_data_mut().iter_mut().zip(image.pixels()) {
        *dst = pack_argb(px.0);
    }

    for detection in detections {
        let [r, g, b] = detection.missing_ppe.color();
        let color = Source::Solid(SolidSource { r, g, b, a: 0xFF });
        let (x, y, box_w, box_h) = visible_rect(detection.bbox, width as i32, height as i32);

        let mut pb = PathBuilder::new();
        pb.rect(x as f32, y as f32, box_w as f32, box_h as f32);
        dt.stroke(
            &pb.finish(),
            &color,
            &StrokeStyle {
                join: LineJoin::Miter,
                width: BOX_STROKE_WIDTH,
                ..StrokeStyle::default()
            },
            &DrawOptions::new(),
        );

        let label = label_for(detection);
        let text_w = GLYPH_SIZE.saturating_mul(label.chars().count() as i32);
        let background_h = GLYPH_SIZE + LABEL_BASELINE + LABEL_PADDING;
        dt.fill_rect(
            x as f32,
            (y - background_h) as f32,
            text_w as f32,
            background_h as f32,
            &color,
            &DrawOptions::new(),
        );
        draw_text(
            &mut dt,
            &label,
            x,
            y - LABEL_BASELINE - LABEL_PADDING / 2 - GLYPH_SIZE,
        );
    }

    let mut out = RgbImage::new(width, height);
    for (px, &argb) in out.pixels_mut().zip(dt.get_data()) {
        *px = Rgb(unpack_rgb(argb));
    }
    out
}

/// Clamp a box to the frame plus a margin, so the rasterizer only ever sees
/// coordinates near the image. Returns `(x, y, width, height)`.
fn visible_rect(bbox: BoundingBox, width: i32, height: i32) -> (i32, i32, i32, i32) {
    let x1 = bbox.x.clamp(-DRAW_MARGIN, width + DRAW_MARGIN);
    let y1 = bbox.y.clamp(-DRAW_MARGIN, height + DRAW_MARGIN);
    let x2 = bbox
        .x
        .saturating_add(bbox.width)
        .clamp(-DRAW_MARGIN, width + DRAW_MARGIN);
    let y2 = bbox
        .y
        .saturating_add(bbox.height)
        .clamp(-DRAW_MARGIN, height + DRAW_MARGIN);
    (x1, y1, x2 - x1, y2 - y1)
}

fn draw_text(dt: &mut DrawTarget, text: &str, x: i32, y: i32) {
    let (width, height) = (dt.width(), dt.height());
    let data = dt.get_data_mut();
    for (i, ch) in text.chars().enumerate() {
        let Some(glyph) = BASIC_FONTS.get(ch) else {
            continue;
        };
        let origin_x = x.saturating_add((i as i32).saturating_mul(GLYPH_SIZE));
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                if bits & (1 << col) == 0 {
                    continue;
                }
                let (px, py) = (origin_x.saturating_add(col), y.saturating_add(row as i32));
                if px < 0 || py < 0 || px >= width || py >= height {
                    continue;
                }
                data[(py * width + px) as usize] = TEXT_COLOR;
            }
        }
    }
}

// raqote stores premultiplied ARGB; frames are opaque so no scaling is needed.
fn pack_argb([r, g, b]: [u8; 3]) -> u32 {
    0xFF00_0000 | (r as u32) << 16 | (g as u32) << 8 | b as u32
}

fn unpack_rgb(argb: u32) -> [u8; 3] {
    [(argb >> 16) as u8, (argb >> 8) as u8, argb as u8]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppe::PpeKind;
    use tempfile::tempdir;

    fn detection(kind: PpeKind, confidence: f32) -> Detection {
        Detection {
            missing_ppe: kind,
            confidence,
            bbox: BoundingBox {
                x: 20,
                y: 30,
                width: 40,
                height: 20,
            },
        }
    }

    #[test]
    fn label_has_two_decimals() {
        assert_eq!(label_for(&detection(PpeKind::Hardhat, 0.75)), "No hardhat: 0.75");
        assert_eq!(label_for(&detection(PpeKind::Gloves, 0.4567)), "No gloves: 0.46");
    }

    #[test]
    fn draws_box_in_kind_color_and_leaves_input_untouched() {
        let frame = RgbImage::from_pixel(100, 80, Rgb([0, 0, 0]));
        let out = draw_detections(&frame, &[detection(PpeKind::Gloves, 0.9)]);

        assert_eq!(out.dimensions(), (100, 80));
        assert_eq!(frame.get_pixel(20, 40), &Rgb([0, 0, 0]));
        let edge = out.get_pixel(20, 40);
        assert!(edge[1] > 200 && edge[0] < 50 && edge[2] < 50);
        // inside the box stays untouched
        assert_eq!(out.get_pixel(40, 40), &Rgb([0, 0, 0]));
        // label background sits above the box
        assert!(out.get_pixel(21, 16).0 != [0, 0, 0]);
    }

    #[test]
    fn extreme_boxes_do_not_overflow() {
        let frame = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        let mut huge = detection(PpeKind::Hardhat, 0.9);
        huge.bbox = BoundingBox::from_corners(-3e9, -3e9, 3e9, 3e9);
        let mut edge = detection(PpeKind::Mask, 0.9);
        edge.bbox = BoundingBox {
            x: i32::MAX - 4,
            y: i32::MIN + 2,
            width: 10,
            height: 10,
        };

        let out = draw_detections(&frame, &[huge, edge]);
        assert_eq!(out.dimensions(), (32, 32));

        let wide = BoundingBox {
            x: -10,
            y: 5,
            width: i32::MAX,
            height: 20,
        };
        assert_eq!(visible_rect(wide, 32, 32), (-10, 5, 106, 20));
    }

    #[test]
    fn round_trips_pixels_without_detections() {
        let frame = RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 7]));
        assert_eq!(draw_detections(&frame, &[]), frame);
    }

    #[test]
    fn writes_a_new_jpeg() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input.png");
        RgbImage::from_pixel(64, 64, Rgb([200, 200, 200]))
            .save(&input)
            .unwrap();
        let before = std::fs::read(&input).unwrap();

        let annotator = Annotator::new(dir.path());
        let artifact = annotator
            .annotate(&input, &[detection(PpeKind::Vest, 0.5)])
            .expect("annotated artifact");

        assert_ne!(artifact.path(), input.as_path());
        let written = image::open(artifact.path()).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (64, 64));
        assert_eq!(std::fs::read(&input).unwrap(), before);

        let path = artifact.path().to_path_buf();
        drop(artifact);
        assert!(!path.exists());
    }

    #[test]
    fn undecodable_frame_is_skipped() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("broken.jpg");
        std::fs::write(&input, b"\x00\x01garbage").unwrap();

        let annotator = Annotator::new(dir.path());
        assert!(annotator.annotate(&input, &[detection(PpeKind::Mask, 0.9)]).is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
