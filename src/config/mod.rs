// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod pipeline;

pub use pipeline::{
    AnnotationConfig, BlurConfig, LoggingConfig, ModelsConfig, PipelineConfig, VlmEndpointConfig,
};
