// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Dataset manifest assembly
//!
//! Two documents are produced per run, both under the run directory:
//! - `restoration_dataset<suffix>.json`: `keep` crops only
//! - `full_dataset<suffix>.json`: every assessed crop with its decision
//!   (only when `write_full_dataset` is set)
//!
//! Entries are ordered by source listing position, then selection rank. The
//! documents carry no timestamps or run-dependent values, so assembling the
//! same artifacts twice yields identical bytes.

use crate::config::PipelineConfig;
use crate::errors::{CurationError, CurationResult};
use crate::storage::{write_json_atomic, ArtifactStore, ImageRecords, PipelineState};
use crate::types::{DatasetEntry, SourceImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const RESTORATION_PREFIX: &str = "restoration_dataset";
pub const FULL_PREFIX: &str = "full_dataset";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub dataset: String,
    pub crop_size: u32,
    pub entry_count: usize,
    pub entries: Vec<DatasetEntry>,
}

impl DatasetManifest {
    pub fn new(dataset: &str, crop_size: u32, entries: Vec<DatasetEntry>) -> Self {
        Self {
            dataset: dataset.to_string(),
            crop_size,
            entry_count: entries.len(),
            entries,
        }
    }
}

/// Where the manifests of a run were written
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestPaths {
    pub restoration: PathBuf,
    pub full: Option<PathBuf>,
}

/// Assessed crops of one image, tagged with its listing position
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntries {
    pub position: usize,
    pub image_id: String,
    pub entries: Vec<DatasetEntry>,
}

/// Join stage records into entries, in selection rank order
///
/// Candidates without a matching detection or assessment are skipped.
pub fn join_records(image_id: &str, records: &ImageRecords) -> Vec<DatasetEntry> {
    let mut candidates: Vec<_> = records.candidates.iter().collect();
    candidates.sort_by_key(|c| c.rank);

    candidates
        .into_iter()
        .filter_map(|candidate| {
            let detection = records
                .detections
                .iter()
                .find(|d| d.index == candidate.detection_index);
            let assessment = records
                .assessments
                .iter()
                .find(|a| a.crop_id == candidate.crop_id);
            match (detection, assessment) {
                (Some(d), Some(a)) => Some(DatasetEntry::join(d, candidate, a)),
                _ => {
                    warn!(
                        image_id,
                        crop_id = %candidate.crop_id,
                        "Incomplete records for crop, leaving it out of the manifest"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Accumulates per-image entries in any arrival order
#[derive(Debug)]
pub struct ManifestAssembler {
    dataset_name: String,
    crop_size: u32,
    images: BTreeMap<usize, Vec<DatasetEntry>>,
}

impl ManifestAssembler {
    pub fn new(dataset_name: &str, crop_size: u32) -> Self {
        Self {
            dataset_name: dataset_name.to_string(),
            crop_size,
            images: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, image: ImageEntries) {
        self.images.insert(image.position, image.entries);
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Every assessed crop, in manifest order
    pub fn full(&self) -> DatasetManifest {
        let entries = self.images.values().flatten().cloned().collect();
        DatasetManifest::new(&self.dataset_name, self.crop_size, entries)
    }

    /// `keep` crops only, in manifest order
    pub fn restoration(&self) -> DatasetManifest {
        let entries = self
            .images
            .values()
            .flatten()
            .filter(|e| e.decision.is_keep())
            .cloned()
            .collect();
        DatasetManifest::new(&self.dataset_name, self.crop_size, entries)
    }

    /// Write the manifests into `run_dir`
    pub async fn write(
        &self,
        run_dir: &Path,
        suffix: &str,
        write_full: bool,
    ) -> CurationResult<WrittenManifests> {
        let restoration = self.restoration();
        let restoration_path = manifest_path(run_dir, RESTORATION_PREFIX, suffix);
        write_json_atomic(&restoration_path, &restoration).await?;

        let (full_path, full) = if write_full {
            let path = manifest_path(run_dir, FULL_PREFIX, suffix);
            let full = self.full();
            write_json_atomic(&path, &full).await?;
            (Some(path), Some(full))
        } else {
            (None, None)
        };

        info!(
            "Wrote manifest {} with {} entries",
            restoration_path.display(),
            restoration.entry_count
        );
        Ok(WrittenManifests {
            paths: ManifestPaths {
                restoration: restoration_path,
                full: full_path,
            },
            restoration,
            full,
        })
    }
}

/// Documents produced by one `ManifestAssembler::write`
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenManifests {
    pub paths: ManifestPaths,
    pub restoration: DatasetManifest,
    pub full: Option<DatasetManifest>,
}

impl WrittenManifests {
    /// Crop files referenced by any written manifest
    pub fn referenced_crops(&self) -> Vec<String> {
        let mut crops: Vec<String> = self
            .full
            .iter()
            .chain(std::iter::once(&self.restoration))
            .flat_map(|m| m.entries.iter().map(|e| e.crop_file.clone()))
            .collect();
        crops.sort_unstable();
        crops.dedup();
        crops
    }
}

pub fn manifest_path(run_dir: &Path, prefix: &str, suffix: &str) -> PathBuf {
    run_dir.join(format!("{}{}.json", prefix, suffix))
}

/// Outcome of rebuilding manifests from stored artifacts
#[derive(Debug, Clone, PartialEq)]
pub struct RegenerateSummary {
    pub paths: ManifestPaths,
    pub images_included: usize,
    /// Images without three completed stages or with unreadable records
    pub images_skipped: Vec<String>,
    pub entry_count: usize,
}

/// Rebuild the manifests from the artifact store without any model call
///
/// When some images lack complete records (failed, unfinished, or pruned
/// after a clean run) and a manifest already exists, nothing is written
/// unless `force` is set.
pub async fn regenerate(
    config: &PipelineConfig,
    images: &[SourceImage],
    store: &ArtifactStore,
    state: &PipelineState,
    force: bool,
) -> CurationResult<RegenerateSummary> {
    let mut assembler = ManifestAssembler::new(&config.dataset_name, config.crop_size);
    let mut skipped = Vec::new();

    for (position, image) in images.iter().enumerate() {
        if !state.is_fully_complete(&image.id).await {
            skipped.push(image.id.clone());
            continue;
        }
        match store.read_image_records(&image.id).await {
            Ok(records) => assembler.add(ImageEntries {
                position,
                image_id: image.id.clone(),
                entries: join_records(&image.id, &records),
            }),
            Err(e) => {
                warn!(image_id = %image.id, error = %e, "Skipping image with unreadable records");
                skipped.push(image.id.clone());
            }
        }
    }

    let existing = manifest_path(store.root(), RESTORATION_PREFIX, &config.suffix());
    if !skipped.is_empty() && !force && tokio::fs::try_exists(&existing).await.unwrap_or(false) {
        return Err(CurationError::IncompleteArtifacts {
            skipped: skipped.len(),
            manifest: existing.display().to_string(),
        });
    }

    let written = assembler
        .write(store.root(), &config.suffix(), config.write_full_dataset)
        .await?;

    Ok(RegenerateSummary {
        paths: written.paths,
        images_included: assembler.image_count(),
        images_skipped: skipped,
        entry_count: written.restoration.entry_count,
    })
}
