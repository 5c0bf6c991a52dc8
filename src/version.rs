// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Version information for the text curator

/// Package name
pub const PACKAGE: &str = env!("CARGO_PKG_NAME");

/// Semantic version number
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pipeline capabilities in this version
pub const FEATURES: &[&str] = &[
    "resumable-state-log",
    "duplicate-suppression",
    "inverse-sharpness-scoring",
    "dual-vlm-annotation",
    "full-dataset-output",
];

/// Get formatted version string for logging
pub fn get_version_string() -> String {
    format!("Fabstir Text Curator {}", VERSION)
}
