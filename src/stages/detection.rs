// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Detection stage: text spotting plus confidence filtering

use crate::errors::CurationResult;
use crate::retry::ModelGate;
use crate::types::{Detection, SourceImage};
use crate::vision::{RawDetection, TextSpotter};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct DetectionStage {
    spotter: Arc<dyn TextSpotter>,
    confidence_threshold: f32,
}

impl DetectionStage {
    pub fn new(spotter: Arc<dyn TextSpotter>, confidence_threshold: f32) -> Self {
        Self {
            spotter,
            confidence_threshold,
        }
    }

    /// Detect text in one image and keep detections at or above the threshold
    ///
    /// The spotter call goes through `gate`, so transient failures are
    /// retried and surface as `DetectionUnavailable`/`Timeout` only after the
    /// attempts run out.
    pub async fn detect(
        &self,
        gate: &ModelGate,
        image: &SourceImage,
    ) -> CurationResult<Vec<Detection>> {
        let what = format!("detect:{}", image.id);
        let raw = gate
            .call(&what, || self.spotter.spot(image, self.confidence_threshold))
            .await?;
        let detections = filter_detections(&image.id, raw, self.confidence_threshold);
        debug!(
            image_id = %image.id,
            kept = detections.len(),
            "Detections above threshold"
        );
        Ok(detections)
    }
}

/// Validate raw detections and apply the confidence threshold
///
/// Indices refer to the detector's output order, including discarded entries.
pub fn filter_detections(image_id: &str, raw: Vec<RawDetection>, threshold: f32) -> Vec<Detection> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, det)| {
            if !det.confidence.is_finite() || !(0.0..=1.0).contains(&det.confidence) {
                warn!(
                    image_id,
                    index,
                    confidence = det.confidence,
                    "Discarding detection with out-of-range confidence"
                );
                return None;
            }
            if det.polygon.len() < 3
                || det
                    .polygon
                    .iter()
                    .any(|[x, y]| !x.is_finite() || !y.is_finite())
            {
                warn!(
                    image_id,
                    index,
                    points = det.polygon.len(),
                    "Discarding detection with degenerate polygon"
                );
                return None;
            }
            if det.confidence < threshold {
                return None;
            }
            Some(Detection {
                index,
                polygon: det.polygon,
                confidence: det.confidence,
                text: det.text.filter(|t| !t.trim().is_empty()),
            })
        })
        .collect()
}
