// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Per-image pipeline stages: detection, selection and quality filtering

pub mod detection;
pub mod quality;
pub mod selection;

pub use detection::{filter_detections, DetectionStage};
pub use quality::{
    map_blur_label, normalize_label, BlurVerdict, QualityFilter, ANNOTATION_MISMATCH,
    EMPTY_TRANSCRIPTION, UNKNOWN_CATEGORY,
};
pub use selection::{crop_window, plan_crops, render_crop, SelectionStage};
