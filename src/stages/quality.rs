// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Quality filter stage
//!
//! Maps free-form VLM answers to a canonical keep/drop decision. The mapping
//! is total: any answer that is not a known category (direct mode) or a
//! sharpness score / scale label (inverse mode) becomes `drop`.
//!
//! With annotation enabled, both annotation VLMs transcribe the crop first;
//! crops with an empty transcription, or with disagreeing transcriptions when
//! agreement is required, are dropped without a blur call.

use crate::config::BlurConfig;
use crate::errors::{CurationError, CurationResult};
use crate::retry::ModelGate;
use crate::types::{CropCandidate, Decision, QualityAssessment};
use crate::vision::{PromptId, VisionLanguageModel};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Category recorded for answers outside the known label set
pub const UNKNOWN_CATEGORY: &str = "unknown";
/// Category recorded when an annotation VLM returned no text
pub const EMPTY_TRANSCRIPTION: &str = "empty_transcription";
/// Category recorded when the two annotation VLMs disagree
pub const ANNOTATION_MISMATCH: &str = "annotation_mismatch";

/// Result of mapping one blur answer
#[derive(Debug, Clone, PartialEq)]
pub struct BlurVerdict {
    pub category: String,
    pub decision: Decision,
    pub sharpness_score: Option<u8>,
}

pub struct QualityFilter {
    blur_vlm: Arc<dyn VisionLanguageModel>,
    annotators: Option<[Arc<dyn VisionLanguageModel>; 2]>,
    require_agreement: bool,
    blur: BlurConfig,
}

impl QualityFilter {
    pub fn new(blur_vlm: Arc<dyn VisionLanguageModel>, blur: BlurConfig) -> Self {
        Self {
            blur_vlm,
            annotators: None,
            require_agreement: true,
            blur,
        }
    }

    pub fn with_annotators(
        mut self,
        first: Arc<dyn VisionLanguageModel>,
        second: Arc<dyn VisionLanguageModel>,
        require_agreement: bool,
    ) -> Self {
        self.annotators = Some([first, second]);
        self.require_agreement = require_agreement;
        self
    }

    fn blur_prompt(&self) -> PromptId {
        if self.blur.inverse_prompt {
            PromptId::SharpnessScale
        } else {
            PromptId::BlurCategory
        }
    }

    /// Assess one crop; only transient model failures are returned as errors
    pub async fn assess(
        &self,
        gate: &ModelGate,
        candidate: &CropCandidate,
        crop_png: &[u8],
    ) -> CurationResult<QualityAssessment> {
        let mut recognized_text = BTreeMap::new();
        let mut annotations_agree = None;

        if let Some(annotators) = &self.annotators {
            for vlm in annotators {
                let what = format!("recognize:{}:{}", vlm.name(), candidate.crop_id);
                let text = gate
                    .call(&what, || vlm.classify(crop_png, PromptId::TextRecognition))
                    .await?;
                recognized_text.insert(vlm.name().to_string(), text.trim().to_string());
            }

            let texts: Vec<String> = annotators
                .iter()
                .map(|vlm| {
                    normalize_transcription(
                        recognized_text.get(vlm.name()).map(String::as_str).unwrap_or(""),
                    )
                })
                .collect();
            let agree = texts[0] == texts[1];
            annotations_agree = Some(agree);

            let rejected = if texts.iter().any(|t| t.is_empty()) {
                Some(EMPTY_TRANSCRIPTION)
            } else if self.require_agreement && !agree {
                Some(ANNOTATION_MISMATCH)
            } else {
                None
            };
            if let Some(category) = rejected {
                debug!(crop_id = %candidate.crop_id, category, "Dropping crop after annotation");
                return Ok(QualityAssessment {
                    crop_id: candidate.crop_id.clone(),
                    raw_label: String::new(),
                    category: category.to_string(),
                    decision: Decision::Drop,
                    sharpness_score: None,
                    recognized_text,
                    annotations_agree,
                });
            }
        }

        let what = format!("blur:{}:{}", self.blur_vlm.name(), candidate.crop_id);
        let prompt = self.blur_prompt();
        let raw_label = gate
            .call(&what, || self.blur_vlm.classify(crop_png, prompt))
            .await?;

        let verdict = match map_blur_label(&raw_label, &self.blur) {
            Some(verdict) => verdict,
            None => {
                let err = CurationError::MalformedModelResponse {
                    model: self.blur_vlm.name().to_string(),
                    raw: raw_label.clone(),
                };
                warn!(crop_id = %candidate.crop_id, error = %err, "Unknown blur label, dropping crop");
                BlurVerdict {
                    category: UNKNOWN_CATEGORY.to_string(),
                    decision: Decision::Drop,
                    sharpness_score: None,
                }
            }
        };

        Ok(QualityAssessment {
            crop_id: candidate.crop_id.clone(),
            raw_label,
            category: verdict.category,
            decision: verdict.decision,
            sharpness_score: verdict.sharpness_score,
            recognized_text,
            annotations_agree,
        })
    }
}

/// Map a raw blur answer; `None` when it matches nothing known
pub fn map_blur_label(raw: &str, blur: &BlurConfig) -> Option<BlurVerdict> {
    if blur.inverse_prompt {
        let score = sharpness_score(raw, &blur.sharpness_scale)?;
        if score >= blur.sharpness_keep_threshold {
            Some(BlurVerdict {
                category: blur.keep_category.clone(),
                decision: Decision::Keep,
                sharpness_score: Some(score),
            })
        } else {
            let label = blur.sharpness_scale.get(usize::from(score).checked_sub(1)?)?;
            Some(BlurVerdict {
                category: label.clone(),
                decision: Decision::Drop,
                sharpness_score: Some(score),
            })
        }
    } else {
        let label = normalize_label(raw);
        let category = blur
            .categories
            .iter()
            .find(|c| normalize_label(c) == label)?;
        let decision = if category.eq_ignore_ascii_case(&blur.keep_category) {
            Decision::Keep
        } else {
            Decision::Drop
        };
        Some(BlurVerdict {
            category: category.clone(),
            decision,
            sharpness_score: None,
        })
    }
}

/// Score in `1..=scale.len()` from either a number or a scale label
pub fn sharpness_score(raw: &str, scale: &[String]) -> Option<u8> {
    let label = normalize_label(raw);
    let digits: String = label.chars().take_while(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        let score: usize = digits.parse().ok()?;
        if !(1..=scale.len()).contains(&score) {
            return None;
        }
        return u8::try_from(score).ok();
    }
    scale
        .iter()
        .position(|s| normalize_label(s) == label)
        .and_then(|i| u8::try_from(i + 1).ok())
}

/// Trim, strip quotes and trailing punctuation, lowercase
pub fn normalize_label(raw: &str) -> String {
    let first_line = raw.trim().lines().next().unwrap_or("");
    first_line
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '`'))
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | ',' | ';' | ':'))
        .trim()
        .to_lowercase()
}

/// Collapse whitespace and lowercase
pub fn normalize_transcription(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
