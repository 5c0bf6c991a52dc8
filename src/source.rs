// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Source image enumeration
//!
//! The listing is taken once at pipeline start and sorted by file name; that
//! order is the manifest order.

use crate::errors::{CurationError, CurationResult};
use crate::types::SourceImage;
use crate::vision::image_utils::{is_supported_image, read_dimensions};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// List supported images directly inside `dir`
pub fn enumerate_images(dir: &Path) -> CurationResult<Vec<SourceImage>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        CurationError::ConfigurationError(format!(
            "cannot list source directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_supported_image(path))
        .collect();
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut seen = HashSet::new();
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            warn!("Skipping file with non UTF-8 name: {}", path.display());
            continue;
        };
        if !seen.insert(id.clone()) {
            warn!(
                "Skipping {}: another image already uses id '{}'",
                path.display(),
                id
            );
            continue;
        }

        match read_dimensions(&path) {
            Ok((width, height)) => images.push(SourceImage {
                id,
                path,
                width,
                height,
            }),
            Err(e) => warn!("Skipping unreadable image {}: {}", path.display(), e),
        }
    }

    info!(
        "Enumerated {} source images in {}",
        images.len(),
        dir.display()
    );
    Ok(images)
}
