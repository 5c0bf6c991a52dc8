// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Core data model shared by the curation stages

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// A 2D point in source-image pixel space
pub type Point = [f32; 2];

/// Per-image pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detection,
    Selection,
    Quality,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Detection, Stage::Selection, Stage::Quality];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detection => "detection",
            Stage::Selection => "selection",
            Stage::Quality => "quality",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source image enumerated at pipeline start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceImage {
    /// File stem, unique within the source directory
    pub id: String,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Float rectangle used for polygon bounds and overlap tests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Rect {
    pub fn width(&self) -> f32 {
        (self.max_x - self.min_x).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.max_y - self.min_y).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Intersection over union; 0.0 when either rectangle is empty
    pub fn iou(&self, other: &Rect) -> f32 {
        let ix = (self.max_x.min(other.max_x) - self.min_x.max(other.min_x)).max(0.0);
        let iy = (self.max_y.min(other.max_y) - self.min_y.max(other.min_y)).max(0.0);
        let intersection = ix * iy;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// A text instance reported by the detection model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Position in the detector's output order
    pub index: usize,
    pub polygon: Vec<Point>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Detection {
    /// Bounding rectangle of the polygon
    pub fn bounds(&self) -> Rect {
        let mut rect = Rect {
            min_x: f32::MAX,
            min_y: f32::MAX,
            max_x: f32::MIN,
            max_y: f32::MIN,
        };
        for [x, y] in &self.polygon {
            rect.min_x = rect.min_x.min(*x);
            rect.min_y = rect.min_y.min(*y);
            rect.max_x = rect.max_x.max(*x);
            rect.max_y = rect.max_y.max(*y);
        }
        if self.polygon.is_empty() {
            rect = Rect {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 0.0,
                max_y: 0.0,
            };
        }
        rect
    }
}

/// A selected region around one detection, rendered at a fixed size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropCandidate {
    /// `<image_id>_<rank>`
    pub crop_id: String,
    pub image_id: String,
    /// Position in confidence-descending selection order
    pub rank: usize,
    pub detection_index: usize,
    pub confidence: f32,
    /// Window in source-image pixels, always inside the image bounds
    pub window: BoundingBox,
    pub output_size: u32,
    /// Crop file path relative to the output directory
    pub crop_file: String,
    /// Text found by a second detector pass over the rendered crop, in crop pixels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crop_detections: Vec<Detection>,
}

/// Where the scaled window sits inside the rendered square
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPlacement {
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
}

impl CropCandidate {
    /// Aspect-preserving fit of the window into `output_size`, centered
    pub fn placement(&self) -> CropPlacement {
        let target = self.output_size;
        let (w, h) = (self.window.width, self.window.height);
        if w == 0 || h == 0 {
            return CropPlacement {
                scaled_width: 0,
                scaled_height: 0,
                offset_x: 0,
                offset_y: 0,
            };
        }

        let scale = target as f32 / w.max(h) as f32;
        let scaled_width = ((w as f32 * scale).round() as u32).clamp(1, target);
        let scaled_height = ((h as f32 * scale).round() as u32).clamp(1, target);
        CropPlacement {
            scaled_width,
            scaled_height,
            offset_x: (target - scaled_width) / 2,
            offset_y: (target - scaled_height) / 2,
        }
    }

    /// Map source-image points into pixel coordinates of the rendered crop
    ///
    /// Results are clamped to the crop and rounded to 1/100 px.
    pub fn to_crop_space(&self, points: &[Point]) -> Vec<Point> {
        let placement = self.placement();
        let window = &self.window;
        let target = self.output_size as f32;
        let axis_scale = |scaled: u32, extent: u32| {
            if extent == 0 {
                0.0
            } else {
                scaled as f32 / extent as f32
            }
        };
        let sx = axis_scale(placement.scaled_width, window.width);
        let sy = axis_scale(placement.scaled_height, window.height);
        let map = |v: f32, origin: u32, scale: f32, offset: u32| {
            let mapped = (v - origin as f32) * scale + offset as f32;
            (mapped.clamp(0.0, target) * 100.0).round() / 100.0
        };

        points
            .iter()
            .map(|[x, y]| {
                [
                    map(*x, window.x, sx, placement.offset_x),
                    map(*y, window.y, sy, placement.offset_y),
                ]
            })
            .collect()
    }
}

/// Canonical quality outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Keep,
    Drop,
}

impl Decision {
    pub fn is_keep(&self) -> bool {
        matches!(self, Decision::Keep)
    }
}

/// Quality verdict for one crop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub crop_id: String,
    /// Label exactly as returned by the blur VLM (empty when no blur call was made)
    pub raw_label: String,
    /// Canonical category; inverse-mode keeps are relabeled to the keep category
    pub category: String,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpness_score: Option<u8>,
    /// Transcriptions keyed by annotation VLM name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recognized_text: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations_agree: Option<bool>,
}

/// One row of the final dataset manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub image_id: String,
    pub crop_id: String,
    pub crop_file: String,
    /// Detection polygon in source-image pixels
    pub polygon: Vec<Point>,
    /// The same polygon in pixels of the rendered crop
    #[serde(default)]
    pub crop_polygon: Vec<Point>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_text: Option<String>,
    pub decision: Decision,
    pub blur_category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharpness_score: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recognized_text: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations_agree: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crop_detections: Vec<Detection>,
}

impl DatasetEntry {
    /// Join the records the artifact store holds for one crop
    pub fn join(
        detection: &Detection,
        candidate: &CropCandidate,
        assessment: &QualityAssessment,
    ) -> Self {
        Self {
            image_id: candidate.image_id.clone(),
            crop_id: candidate.crop_id.clone(),
            crop_file: candidate.crop_file.clone(),
            polygon: detection.polygon.clone(),
            crop_polygon: candidate.to_crop_space(&detection.polygon),
            confidence: detection.confidence,
            detected_text: detection.text.clone(),
            decision: assessment.decision,
            blur_category: assessment.category.clone(),
            sharpness_score: assessment.sharpness_score,
            recognized_text: assessment.recognized_text.clone(),
            annotations_agree: assessment.annotations_agree,
            crop_detections: candidate.crop_detections.clone(),
        }
    }
}
