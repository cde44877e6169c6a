use serde::{Deserialize, Serialize};

use crate::ppe::PpeKind;

/// Detection as reported by a backend, in corner form and original-frame pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl RawDetection {
    pub fn new(label: impl Into<String>, confidence: f32, corners: [f32; 4]) -> Self {
        let [x1, y1, x2, y2] = corners;
        Self {
            label: label.into(),
            confidence,
            x1,
            y1,
            x2,
            y2,
        }
    }
}

/// Axis-aligned box in integer pixels, origin top-left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    /// Build from corner coordinates. Each corner is truncated to whole pixels
    /// before the extent is computed; out-of-range values saturate.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        let (x1, y1, x2, y2) = (x1 as i32, y1 as i32, x2 as i32, y2 as i32);
        Self {
            x: x1,
            y: y1,
            width: x2.saturating_sub(x1),
            height: y2.saturating_sub(y1),
        }
    }
}

/// A missing-PPE finding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub missing_ppe: PpeKind,
    pub confidence: f32,
    pub bbox: BoundingBox,
}
