// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Error types for the curation pipeline
//!
//! Stage errors fall into three groups:
//! - Transient external failures (detector/VLM unreachable, timeouts) that the
//!   orchestrator retries with backoff
//! - Per-image failures (artifact writes) that mark one image failed
//! - Startup failures (configuration) that abort before any processing

use thiserror::Error;

/// Errors raised by pipeline stages, stores and model boundaries
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CurationError {
    /// The external text-spotting service failed or returned a non-success status
    #[error("Detection model unavailable: {0}")]
    DetectionUnavailable(String),

    /// A VLM identity failed or returned a non-success status
    #[error("VLM '{model}' unavailable: {reason}")]
    VlmUnavailable { model: String, reason: String },

    /// An external call exceeded its configured timeout
    #[error("External call timed out after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// The model answered with something outside the known category set
    #[error("Malformed response from '{model}': {raw:?}")]
    MalformedModelResponse { model: String, raw: String },

    /// Writing a stage artifact or state record failed
    #[error("Failed to write {path}: {reason}")]
    StorageWriteFailure { path: String, reason: String },

    /// A cached stage artifact is missing or unreadable
    #[error("Failed to read {path}: {reason}")]
    StorageReadFailure { path: String, reason: String },

    /// Source image could not be opened or decoded
    #[error("Invalid source image {path}: {reason}")]
    InvalidImage { path: String, reason: String },

    /// Regeneration would replace an existing manifest with fewer images
    #[error("{skipped} images lack complete stored records; not overwriting {manifest}")]
    IncompleteArtifacts { skipped: usize, manifest: String },

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The run was cancelled before the operation completed
    #[error("Operation cancelled")]
    Cancelled,
}

impl CurationError {
    /// Whether the orchestrator should retry the failed call
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CurationError::DetectionUnavailable(_)
                | CurationError::VlmUnavailable { .. }
                | CurationError::Timeout { .. }
        )
    }

    pub fn storage_write(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        CurationError::StorageWriteFailure {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn storage_read(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        CurationError::StorageReadFailure {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }
}

pub type CurationResult<T> = std::result::Result<T, CurationError>;
