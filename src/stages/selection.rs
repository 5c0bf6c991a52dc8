// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Selection stage: rank detections, suppress duplicates, render fixed-size crops
//!
//! Planning is pure geometry over the enumerated image dimensions; the source
//! pixels are only decoded when at least one crop was planned. With crop
//! re-detection enabled, every rendered crop is sent through the text spotter
//! once more and the hits are stored on the candidate in crop pixels.

use crate::errors::{CurationError, CurationResult};
use crate::retry::ModelGate;
use crate::stages::DetectionStage;
use crate::storage::ArtifactStore;
use crate::types::{BoundingBox, CropCandidate, Detection, Rect, SourceImage};
use crate::vision::{encode_png, load_image};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use tracing::debug;

pub struct SelectionStage {
    max_crops: usize,
    crop_size: u32,
    duplicate_iou_threshold: f32,
    crop_detector: Option<DetectionStage>,
}

impl SelectionStage {
    pub fn new(max_crops: usize, crop_size: u32, duplicate_iou_threshold: f32) -> Self {
        Self {
            max_crops,
            crop_size,
            duplicate_iou_threshold,
            crop_detector: None,
        }
    }

    /// Run `detector` over each rendered crop
    pub fn with_crop_redetection(mut self, detector: DetectionStage) -> Self {
        self.crop_detector = Some(detector);
        self
    }

    /// Plan crops for one image and write their PNGs to the store
    pub async fn select(
        &self,
        gate: &ModelGate,
        store: &ArtifactStore,
        image: &SourceImage,
        detections: &[Detection],
    ) -> CurationResult<Vec<CropCandidate>> {
        let candidates = plan_crops(
            detections,
            image,
            self.max_crops,
            self.crop_size,
            self.duplicate_iou_threshold,
        );
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let path = image.path.clone();
        let planned = candidates.clone();
        let rendered = tokio::task::spawn_blocking(move || -> CurationResult<Vec<Vec<u8>>> {
            let source = load_image(&path).map_err(|e| CurationError::InvalidImage {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            planned
                .iter()
                .map(|candidate| {
                    encode_png(&render_crop(&source, candidate)).map_err(|e| {
                        CurationError::InvalidImage {
                            path: path.display().to_string(),
                            reason: e.to_string(),
                        }
                    })
                })
                .collect()
        })
        .await
        .map_err(|e| CurationError::InvalidImage {
            path: image.path.display().to_string(),
            reason: format!("crop task failed: {}", e),
        })??;

        for (candidate, png) in candidates.iter().zip(rendered) {
            store.write_crop(&candidate.crop_file, &png).await?;
        }

        let mut candidates = candidates;
        if let Some(detector) = &self.crop_detector {
            for candidate in candidates.iter_mut() {
                let crop = SourceImage {
                    id: candidate.crop_id.clone(),
                    path: store.resolve(&candidate.crop_file),
                    width: candidate.output_size,
                    height: candidate.output_size,
                };
                candidate.crop_detections = detector.detect(gate, &crop).await?;
            }
        }

        debug!(
            image_id = %image.id,
            crops = candidates.len(),
            "Rendered crops"
        );
        Ok(candidates)
    }
}

/// Choose up to `max_crops` detections and compute their crop windows
///
/// Detections are ranked by confidence descending with ties in detector order.
/// A detection whose bounding box overlaps an already selected one with IoU at
/// or above `duplicate_iou_threshold` is skipped.
pub fn plan_crops(
    detections: &[Detection],
    image: &SourceImage,
    max_crops: usize,
    crop_size: u32,
    duplicate_iou_threshold: f32,
) -> Vec<CropCandidate> {
    let mut ranked: Vec<&Detection> = detections.iter().collect();
    ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut selected: Vec<(&Detection, Rect)> = Vec::new();
    for det in ranked {
        if selected.len() >= max_crops {
            break;
        }
        let bounds = det.bounds();
        if selected
            .iter()
            .any(|(_, prev)| prev.iou(&bounds) >= duplicate_iou_threshold)
        {
            debug!(
                image_id = %image.id,
                index = det.index,
                "Skipping duplicate detection"
            );
            continue;
        }
        selected.push((det, bounds));
    }

    selected
        .into_iter()
        .enumerate()
        .map(|(rank, (det, bounds))| {
            let crop_id = format!("{}_{:02}", image.id, rank);
            CropCandidate {
                crop_file: ArtifactStore::crop_file_name(&crop_id),
                crop_id,
                image_id: image.id.clone(),
                rank,
                detection_index: det.index,
                confidence: det.confidence,
                window: crop_window(&bounds, image.width, image.height, crop_size),
                output_size: crop_size,
                crop_detections: Vec::new(),
            }
        })
        .collect()
}

/// Square window around `bounds`, clipped per axis and shifted into the image
pub fn crop_window(bounds: &Rect, image_width: u32, image_height: u32, crop_size: u32) -> BoundingBox {
    let side = bounds
        .width()
        .ceil()
        .max(bounds.height().ceil())
        .max(crop_size as f32) as u32;
    let width = side.min(image_width);
    let height = side.min(image_height);
    let (cx, cy) = bounds.center();

    BoundingBox {
        x: place_axis(cx, width, image_width),
        y: place_axis(cy, height, image_height),
        width,
        height,
    }
}

fn place_axis(center: f32, extent: u32, limit: u32) -> u32 {
    let start = (center - extent as f32 / 2.0).round();
    let max_start = limit.saturating_sub(extent) as f32;
    start.clamp(0.0, max_start) as u32
}

/// Cut the window out of `source` and fit it into a black `output_size` square
///
/// The window lands where `CropCandidate::placement` says, so polygons mapped
/// with `CropCandidate::to_crop_space` line up with the rendered pixels.
pub fn render_crop(source: &DynamicImage, candidate: &CropCandidate) -> DynamicImage {
    let w = &candidate.window;
    let target = candidate.output_size;
    let region = source.crop_imm(w.x, w.y, w.width, w.height);
    let (orig_w, orig_h) = region.dimensions();

    if orig_w == target && orig_h == target {
        return DynamicImage::ImageRgb8(region.to_rgb8());
    }

    let mut output = RgbImage::from_pixel(target, target, Rgb([0, 0, 0]));
    let placement = candidate.placement();
    if orig_w == 0 || orig_h == 0 || placement.scaled_width == 0 {
        return DynamicImage::ImageRgb8(output);
    }

    let resized = region
        .resize_exact(
            placement.scaled_width,
            placement.scaled_height,
            image::imageops::FilterType::Lanczos3,
        )
        .to_rgb8();
    image::imageops::replace(
        &mut output,
        &resized,
        placement.offset_x as i64,
        placement.offset_y as i64,
    );

    DynamicImage::ImageRgb8(output)
}
