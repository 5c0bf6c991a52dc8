// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Pipeline run configuration
//!
//! Loaded once from a TOML file, adjusted by environment and CLI overrides,
//! validated, then shared read-only (behind `Arc`) by every stage.

use crate::errors::{CurationError, CurationResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    /// Ask the VLM for a sharpness scale instead of a blur category
    pub inverse_prompt: bool,
    pub keep_category: String,
    /// Every category the blur prompt allows the model to answer with
    pub categories: Vec<String>,
    /// Sharpness labels, least sharp first; label i scores i + 1
    pub sharpness_scale: Vec<String>,
    /// Lowest sharpness score that is kept in inverse mode
    pub sharpness_keep_threshold: u8,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            inverse_prompt: false,
            keep_category: "Not blurry".to_string(),
            categories: vec![
                "Not blurry".to_string(),
                "Slightly blurry".to_string(),
                "Blurry".to_string(),
                "Very blurry".to_string(),
            ],
            sharpness_scale: vec![
                "Very blurry".to_string(),
                "Blurry".to_string(),
                "Acceptable".to_string(),
                "Sharp".to_string(),
                "Very sharp".to_string(),
            ],
            sharpness_keep_threshold: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// Transcribe each crop with both annotation VLMs before blur assessment
    pub enabled: bool,
    /// Drop crops on which the two transcriptions differ
    pub require_agreement: bool,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            require_agreement: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlmEndpointConfig {
    pub endpoint: String,
    /// Model name sent to the server; defaults to the identity name
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub bridge_endpoint: String,
    pub vlm1_name: String,
    pub vlm2_name: String,
    pub blur_vlm_name: String,
    pub vlm: BTreeMap<String, VlmEndpointConfig>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            bridge_endpoint: "http://localhost:8090".to_string(),
            vlm1_name: "qwen2.5-vl".to_string(),
            vlm2_name: "internvl2.5".to_string(),
            blur_vlm_name: "qwen2.5-vl".to_string(),
            vlm: BTreeMap::new(),
        }
    }
}

impl ModelsConfig {
    /// Endpoint settings for a named VLM identity
    pub fn endpoint_for(&self, name: &str) -> CurationResult<&VlmEndpointConfig> {
        self.vlm.get(name).ok_or_else(|| {
            CurationError::ConfigurationError(format!(
                "no [models.vlm.\"{}\"] section configured",
                name
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Log file name, created inside the run directory
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source_dir: PathBuf,
    pub source_subfolder: Option<String>,
    pub output_dir: PathBuf,
    pub output_suffix: Option<String>,
    pub dataset_name: String,

    pub crop_size: u32,
    pub bridge_confidence_threshold: f32,
    pub max_crops_per_image: usize,
    pub duplicate_iou_threshold: f32,

    pub workers: usize,
    pub max_concurrent_model_calls: usize,
    pub model_call_timeout_secs: u64,

    pub keep_intermediate_files: bool,
    pub write_full_dataset: bool,
    /// Run the text spotter again on every rendered crop
    pub redetect_crops: bool,

    pub blur: BlurConfig,
    pub annotation: AnnotationConfig,
    pub models: ModelsConfig,
    pub retry: RetryPolicy,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::new(),
            source_subfolder: None,
            output_dir: PathBuf::new(),
            output_suffix: None,
            dataset_name: "text-crops".to_string(),
            crop_size: 512,
            bridge_confidence_threshold: 0.3,
            max_crops_per_image: 5,
            duplicate_iou_threshold: 0.9,
            workers: 4,
            max_concurrent_model_calls: 8,
            model_call_timeout_secs: 60,
            keep_intermediate_files: true,
            write_full_dataset: true,
            redetect_crops: false,
            blur: BlurConfig::default(),
            annotation: AnnotationConfig::default(),
            models: ModelsConfig::default(),
            retry: RetryPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> CurationResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CurationError::ConfigurationError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CurationResult<Self> {
        toml::from_str(content)
            .map_err(|e| CurationError::ConfigurationError(format!("invalid TOML: {}", e)))
    }

    /// Apply overrides from process environment variables
    pub fn apply_env(&mut self) -> CurationResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> CurationResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CURATION_SOURCE_DIR") {
            self.source_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CURATION_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup("CURATION_WORKERS") {
            self.workers = workers.parse().map_err(|_| {
                CurationError::ConfigurationError(format!(
                    "CURATION_WORKERS must be a positive integer, got '{}'",
                    workers
                ))
            })?;
        }
        if let Some(level) = lookup("CURATION_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(endpoint) = lookup("BRIDGE_ENDPOINT") {
            self.models.bridge_endpoint = endpoint;
        }
        Ok(())
    }

    /// Check every setting before any processing starts
    pub fn validate(&self) -> CurationResult<()> {
        let fail = |msg: String| Err(CurationError::ConfigurationError(msg));

        if self.source_dir.as_os_str().is_empty() {
            return fail("source_dir is required".to_string());
        }
        if self.output_dir.as_os_str().is_empty() {
            return fail("output_dir is required".to_string());
        }
        if self.crop_size == 0 {
            return fail("crop_size must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.bridge_confidence_threshold) {
            return fail(format!(
                "bridge_confidence_threshold must be within [0, 1], got {}",
                self.bridge_confidence_threshold
            ));
        }
        if self.max_crops_per_image == 0 {
            return fail("max_crops_per_image must be >= 1".to_string());
        }
        if !(self.duplicate_iou_threshold > 0.0 && self.duplicate_iou_threshold <= 1.0) {
            return fail(format!(
                "duplicate_iou_threshold must be within (0, 1], got {}",
                self.duplicate_iou_threshold
            ));
        }
        if self.workers == 0 || self.max_concurrent_model_calls == 0 {
            return fail("workers and max_concurrent_model_calls must be >= 1".to_string());
        }
        if self.model_call_timeout_secs == 0 {
            return fail("model_call_timeout_secs must be >= 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be >= 1".to_string());
        }

        let blur = &self.blur;
        if blur.categories.is_empty() {
            return fail("blur.categories must not be empty".to_string());
        }
        if !blur
            .categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&blur.keep_category))
        {
            return fail(format!(
                "blur.keep_category '{}' is not one of blur.categories",
                blur.keep_category
            ));
        }
        if blur.sharpness_scale.is_empty() {
            return fail("blur.sharpness_scale must not be empty".to_string());
        }
        if blur.sharpness_scale.len() > u8::MAX as usize {
            return fail(format!(
                "blur.sharpness_scale allows at most {} labels, got {}",
                u8::MAX,
                blur.sharpness_scale.len()
            ));
        }
        if blur.sharpness_keep_threshold == 0
            || blur.sharpness_keep_threshold as usize > blur.sharpness_scale.len()
        {
            return fail(format!(
                "blur.sharpness_keep_threshold must be within 1..={}, got {}",
                blur.sharpness_scale.len(),
                blur.sharpness_keep_threshold
            ));
        }

        if self.models.blur_vlm_name.trim().is_empty() {
            return fail("models.blur_vlm_name is required".to_string());
        }
        if self.annotation.enabled {
            let (a, b) = (&self.models.vlm1_name, &self.models.vlm2_name);
            if a.trim().is_empty() || b.trim().is_empty() {
                return fail("models.vlm1_name and models.vlm2_name are required".to_string());
            }
            if a == b {
                return fail(format!(
                    "annotation requires two distinct VLMs, both are '{}'",
                    a
                ));
            }
        }
        Ok(())
    }

    /// Directory holding the images of this run
    pub fn input_dir(&self) -> PathBuf {
        match &self.source_subfolder {
            Some(sub) => self.source_dir.join(sub),
            None => self.source_dir.clone(),
        }
    }

    /// Suffix appended to run directory and output file names
    pub fn suffix(&self) -> String {
        let raw = match (&self.output_suffix, &self.source_subfolder) {
            (Some(s), _) => s.clone(),
            (None, Some(sub)) => format!("_{}", sub),
            (None, None) => String::new(),
        };
        raw.replace(['/', '\\'], "_")
    }

    /// `output_dir` with the run suffix appended to its last component
    pub fn run_dir(&self) -> PathBuf {
        let mut name = OsString::from(self.output_dir.as_os_str());
        name.push(self.suffix());
        PathBuf::from(name)
    }

    pub fn model_call_timeout(&self) -> Duration {
        Duration::from_secs(self.model_call_timeout_secs)
    }
}
