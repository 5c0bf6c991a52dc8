// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! On-disk store for per-image stage outputs
//!
//! Layout under the run directory:
//! ```text
//! intermediate/records/<image_id>/detection.json
//! intermediate/records/<image_id>/selection.json
//! intermediate/records/<image_id>/quality.json
//! cropped_images/<crop_id>.png
//! ```
//! Every write goes to a temp file that is synced and renamed over the
//! target, so a record is either absent or complete. Records are keyed by
//! image id + stage and contain no run-dependent data; rewriting one with
//! the same input produces identical bytes.

use crate::errors::{CurationError, CurationResult};
use crate::types::{CropCandidate, Detection, QualityAssessment, Stage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const RECORDS_DIR: &str = "intermediate/records";
const CROPS_DIR: &str = "cropped_images";

/// All stage records of one image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecords {
    pub detections: Vec<Detection>,
    pub candidates: Vec<CropCandidate>,
    pub assessments: Vec<QualityAssessment>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join(RECORDS_DIR)
    }

    pub fn crops_dir(&self) -> PathBuf {
        self.root.join(CROPS_DIR)
    }

    pub async fn ensure_dirs(&self) -> CurationResult<()> {
        for dir in [self.records_dir(), self.crops_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| CurationError::storage_write(&dir, e))?;
        }
        Ok(())
    }

    pub fn record_path(&self, image_id: &str, stage: Stage) -> PathBuf {
        self.records_dir()
            .join(image_id)
            .join(format!("{}.json", stage.as_str()))
    }

    /// Crop file reference stored in candidates and the manifest
    pub fn crop_file_name(crop_id: &str) -> String {
        format!("{}/{}.png", CROPS_DIR, crop_id)
    }

    /// Absolute path of a crop file reference
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    async fn write_record<T: Serialize + ?Sized>(
        &self,
        image_id: &str,
        stage: Stage,
        value: &T,
    ) -> CurationResult<()> {
        let path = self.record_path(image_id, stage);
        write_json_atomic(&path, value).await?;
        debug!(image_id, stage = %stage, "Stored stage record");
        Ok(())
    }

    async fn read_record<T: DeserializeOwned>(
        &self,
        image_id: &str,
        stage: Stage,
    ) -> CurationResult<T> {
        let path = self.record_path(image_id, stage);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| CurationError::storage_read(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| CurationError::storage_read(&path, e))
    }

    pub async fn write_detections(
        &self,
        image_id: &str,
        detections: &[Detection],
    ) -> CurationResult<()> {
        self.write_record(image_id, Stage::Detection, detections).await
    }

    pub async fn read_detections(&self, image_id: &str) -> CurationResult<Vec<Detection>> {
        self.read_record(image_id, Stage::Detection).await
    }

    pub async fn write_selection(
        &self,
        image_id: &str,
        candidates: &[CropCandidate],
    ) -> CurationResult<()> {
        self.write_record(image_id, Stage::Selection, candidates).await
    }

    /// Read selected candidates; fails if any referenced crop file is gone
    pub async fn read_selection(&self, image_id: &str) -> CurationResult<Vec<CropCandidate>> {
        let candidates: Vec<CropCandidate> = self.read_record(image_id, Stage::Selection).await?;
        for candidate in &candidates {
            let path = self.resolve(&candidate.crop_file);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(CurationError::storage_read(&path, "crop file missing"));
            }
        }
        Ok(candidates)
    }

    pub async fn write_quality(
        &self,
        image_id: &str,
        assessments: &[QualityAssessment],
    ) -> CurationResult<()> {
        self.write_record(image_id, Stage::Quality, assessments).await
    }

    pub async fn read_quality(&self, image_id: &str) -> CurationResult<Vec<QualityAssessment>> {
        self.read_record(image_id, Stage::Quality).await
    }

    /// Load all three stage records of an image
    pub async fn read_image_records(&self, image_id: &str) -> CurationResult<ImageRecords> {
        Ok(ImageRecords {
            detections: self.read_detections(image_id).await?,
            candidates: self.read_selection(image_id).await?,
            assessments: self.read_quality(image_id).await?,
        })
    }

    pub async fn write_crop(&self, crop_file: &str, png: &[u8]) -> CurationResult<()> {
        write_bytes_atomic(&self.resolve(crop_file), png).await
    }

    pub async fn read_crop(&self, crop_file: &str) -> CurationResult<Vec<u8>> {
        let path = self.resolve(crop_file);
        tokio::fs::read(&path)
            .await
            .map_err(|e| CurationError::storage_read(&path, e))
    }

    /// Remove per-image stage records and the crops of dropped candidates
    ///
    /// `kept_crops` are crop file references still used by the manifest.
    pub async fn prune(&self, kept_crops: &[String]) -> CurationResult<usize> {
        let records = self.records_dir();
        if tokio::fs::try_exists(&records).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&records)
                .await
                .map_err(|e| CurationError::storage_write(&records, e))?;
        }

        let mut removed = 0;
        let crops_dir = self.crops_dir();
        let mut entries = match tokio::fs::read_dir(&crops_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Stopped scanning {} for unused crops: {}", crops_dir.display(), e);
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            let reference = format!("{}/{}", CROPS_DIR, name);
            if kept_crops.iter().any(|k| k == &reference) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not remove crop {}: {}", entry.path().display(), e),
            }
        }

        info!(
            "Pruned intermediate records and {} unused crop files",
            removed
        );
        Ok(removed)
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> CurationResult<()> {
    let mut bytes =
        serde_json::to_vec_pretty(value).map_err(|e| CurationError::storage_write(path, e))?;
    bytes.push(b'\n');
    write_bytes_atomic(path, &bytes).await
}

/// Write to `<path>.tmp`, sync, then rename over `path`
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> CurationResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CurationError::storage_write(parent, e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| CurationError::storage_write(&tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| CurationError::storage_write(&tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| CurationError::storage_write(&tmp, e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| CurationError::storage_write(path, e))
}
