// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! External model boundaries
//!
//! This module provides:
//! - `TextSpotter` / `VisionLanguageModel` capability traits
//! - HTTP sidecar clients for the bridge detector and OpenAI-compatible VLMs
//! - In-memory mocks for tests and dry runs

pub mod boundary;
pub mod bridge_client;
pub mod image_utils;
pub mod mock;
pub mod vlm_client;

pub use boundary::{PromptId, PromptTable, RawDetection, TextSpotter, VisionLanguageModel};
pub use bridge_client::BridgeClient;
pub use image_utils::{decode_image_bytes, encode_png, load_image, ImageError};
pub use mock::{MockTextSpotter, MockVlm};
pub use vlm_client::VlmClient;
