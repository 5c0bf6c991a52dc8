// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod cli;
pub mod config;
pub mod errors;
pub mod manifest;
pub mod orchestrator;
pub mod retry;
pub mod source;
pub mod stages;
pub mod storage;
pub mod types;
pub mod version;
pub mod vision;

// Re-export main types
pub use config::PipelineConfig;
pub use errors::{CurationError, CurationResult};
pub use manifest::{regenerate, DatasetManifest, ManifestAssembler, ManifestPaths, WrittenManifests};
pub use orchestrator::{FailedImage, Orchestrator, RunSummary};
pub use retry::{ModelGate, RetryPolicy};
pub use source::enumerate_images;
pub use storage::{ArtifactStore, PipelineState};
pub use types::{
    CropCandidate, DatasetEntry, Decision, Detection, QualityAssessment, SourceImage, Stage,
};
pub use vision::{TextSpotter, VisionLanguageModel};
