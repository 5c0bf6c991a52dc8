// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod artifact_store;
pub mod state_log;

// Re-export main types for convenience
pub use artifact_store::{write_bytes_atomic, write_json_atomic, ArtifactStore, ImageRecords};
pub use state_log::{FailureRecord, PipelineState, StateRecord, STATE_FILE};
