// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Capability traits for the external model services
//!
//! The orchestrator only sees these two traits, so the concrete backends
//! (HTTP sidecars, mocks) can be swapped without touching orchestration.

use crate::config::BlurConfig;
use crate::errors::CurationResult;
use crate::types::{Point, SourceImage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A detection exactly as reported by the text-spotting model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub polygon: Vec<Point>,
    pub confidence: f32,
    #[serde(default)]
    pub text: Option<String>,
}

/// External text-spotting model
#[async_trait]
pub trait TextSpotter: Send + Sync {
    /// Detect text instances; `confidence_threshold` is a hint the model may ignore
    async fn spot(
        &self,
        image: &SourceImage,
        confidence_threshold: f32,
    ) -> CurationResult<Vec<RawDetection>>;
}

/// Named prompt / category set sent alongside a crop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptId {
    BlurCategory,
    SharpnessScale,
    TextRecognition,
}

impl PromptId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptId::BlurCategory => "blur_category",
            PromptId::SharpnessScale => "sharpness_scale",
            PromptId::TextRecognition => "text_recognition",
        }
    }
}

impl fmt::Display for PromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External vision-language model identity
#[async_trait]
pub trait VisionLanguageModel: Send + Sync {
    /// Identity name used in configuration and manifest labels
    fn name(&self) -> &str;

    /// Ask the model for one label (or transcription) for a PNG-encoded crop
    async fn classify(&self, crop_png: &[u8], prompt: PromptId) -> CurationResult<String>;
}

/// Prompt strings for each prompt id, built from the configured category sets
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTable {
    blur_category: String,
    sharpness_scale: String,
    text_recognition: String,
}

impl PromptTable {
    pub fn from_blur_config(blur: &BlurConfig) -> Self {
        let categories = blur
            .categories
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let scale = blur
            .sharpness_scale
            .iter()
            .enumerate()
            .map(|(i, label)| format!("{} = {}", i + 1, label))
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            blur_category: format!(
                "How blurry is the text in this image? Answer with exactly one of: {}.",
                categories
            ),
            sharpness_scale: format!(
                "Rate the sharpness of the text in this image on this scale: {}. Answer with the number only.",
                scale
            ),
            text_recognition: "Read the text in this image. Return only the text itself. If there is no readable text, return an empty response.".to_string(),
        }
    }

    pub fn get(&self, prompt: PromptId) -> &str {
        match prompt {
            PromptId::BlurCategory => &self.blur_category,
            PromptId::SharpnessScale => &self.sharpness_scale,
            PromptId::TextRecognition => &self.text_recognition,
        }
    }
}
