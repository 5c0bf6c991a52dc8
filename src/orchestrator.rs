// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Pipeline orchestrator
//!
//! Drives detection → selection → quality for every source image on a bounded
//! pool of concurrent workers. Each image's stages run in sequence on one
//! worker. Before a stage runs, the state log is consulted: a completed stage
//! whose artifact still loads is reused instead of recomputed. Once a stage is
//! recomputed, every later stage of that image is recomputed as well.
//!
//! Workers report per-image outcomes over a channel to a single collector
//! that owns the manifest assembler. The manifest is written once, after all
//! workers finish, and never for a cancelled run.

use crate::config::PipelineConfig;
use crate::errors::{CurationError, CurationResult};
use crate::manifest::{join_records, ImageEntries, ManifestAssembler, ManifestPaths};
use crate::retry::ModelGate;
use crate::stages::{DetectionStage, QualityFilter, SelectionStage};
use crate::storage::{ArtifactStore, ImageRecords, PipelineState, STATE_FILE};
use crate::types::{SourceImage, Stage};
use crate::vision::{
    BridgeClient, PromptTable, TextSpotter, VisionLanguageModel, VlmClient,
};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An image that failed after retries were exhausted
#[derive(Debug, Clone, PartialEq)]
pub struct FailedImage {
    pub image_id: String,
    pub stage: Stage,
    pub reason: String,
}

/// Final report of one `run`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    pub total_images: usize,
    /// Images with all three stages complete, in listing order
    pub processed: Vec<String>,
    pub failed: Vec<FailedImage>,
    /// Images not started (or abandoned mid-stage) because of cancellation
    pub skipped: Vec<String>,
    pub cancelled: bool,
    pub manifest_entries: usize,
    pub manifest: Option<ManifestPaths>,
    pub pruned: bool,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    pub fn log(&self) {
        info!(
            total = self.total_images,
            processed = self.processed.len(),
            failed = self.failed.len(),
            skipped = self.skipped.len(),
            manifest_entries = self.manifest_entries,
            "Pipeline run finished"
        );
        for failure in &self.failed {
            warn!(
                image_id = %failure.image_id,
                stage = %failure.stage,
                reason = %failure.reason,
                "Image failed"
            );
        }
        if self.cancelled {
            warn!(
                "Run was cancelled; {} images skipped, no manifest written",
                self.skipped.len()
            );
        }
    }
}

#[derive(Debug)]
enum ImageOutcome {
    Processed(ImageEntries),
    Failed { position: usize, failure: FailedImage },
    Skipped { position: usize, image_id: String },
}

#[derive(Debug)]
struct Collected {
    assembler: ManifestAssembler,
    processed: Vec<(usize, String)>,
    failed: Vec<(usize, FailedImage)>,
    skipped: Vec<(usize, String)>,
}

type StageError = (Stage, CurationError);

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    store: ArtifactStore,
    detection: DetectionStage,
    selection: SelectionStage,
    quality: QualityFilter,
}

impl Orchestrator {
    /// Wire the stages to the given model backends
    pub fn new(
        config: Arc<PipelineConfig>,
        spotter: Arc<dyn TextSpotter>,
        blur_vlm: Arc<dyn VisionLanguageModel>,
        annotators: Option<(Arc<dyn VisionLanguageModel>, Arc<dyn VisionLanguageModel>)>,
    ) -> Self {
        let mut selection = SelectionStage::new(
            config.max_crops_per_image,
            config.crop_size,
            config.duplicate_iou_threshold,
        );
        if config.redetect_crops {
            selection = selection.with_crop_redetection(DetectionStage::new(
                spotter.clone(),
                config.bridge_confidence_threshold,
            ));
        }
        let detection = DetectionStage::new(spotter, config.bridge_confidence_threshold);
        let mut quality = QualityFilter::new(blur_vlm, config.blur.clone());
        if let Some((first, second)) = annotators {
            quality = quality.with_annotators(first, second, config.annotation.require_agreement);
        }

        Self {
            store: ArtifactStore::new(config.run_dir()),
            config,
            detection,
            selection,
            quality,
        }
    }

    /// Wire the stages to the HTTP sidecars named in the configuration
    pub fn from_config(config: Arc<PipelineConfig>) -> CurationResult<Self> {
        let timeout = config.model_call_timeout();
        let prompts = PromptTable::from_blur_config(&config.blur);
        let models = &config.models;

        let spotter: Arc<dyn TextSpotter> =
            Arc::new(BridgeClient::new(&models.bridge_endpoint, timeout)?);

        let vlm = |name: &str| -> CurationResult<Arc<dyn VisionLanguageModel>> {
            let endpoint = models.endpoint_for(name)?;
            Ok(Arc::new(VlmClient::new(
                name,
                &endpoint.endpoint,
                endpoint.model.as_deref(),
                prompts.clone(),
                timeout,
            )?))
        };

        let blur_vlm = vlm(&models.blur_vlm_name)?;
        let annotators = if config.annotation.enabled {
            Some((vlm(&models.vlm1_name)?, vlm(&models.vlm2_name)?))
        } else {
            None
        };

        Ok(Self::new(config.clone(), spotter, blur_vlm, annotators))
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn state_path(&self) -> std::path::PathBuf {
        self.store.root().join(STATE_FILE)
    }

    /// Process `images` (in listing order) and assemble the manifest
    ///
    /// Only startup problems (unwritable run directory, unreadable state log)
    /// are returned as errors; per-image failures end up in the summary.
    pub async fn run(
        &self,
        images: &[SourceImage],
        cancel: CancellationToken,
    ) -> CurationResult<RunSummary> {
        let run_started = Instant::now();
        self.store.ensure_dirs().await?;
        let state = PipelineState::open(self.state_path()).await?;
        let gate = ModelGate::new(
            self.config.retry.clone(),
            self.config.model_call_timeout(),
            self.config.max_concurrent_model_calls,
            cancel.clone(),
        );

        info!(
            images = images.len(),
            workers = self.config.workers,
            run_dir = %self.store.root().display(),
            "Starting curation run"
        );

        let (tx, rx) = mpsc::channel::<ImageOutcome>(self.config.workers.max(1) * 2);
        let assembler = ManifestAssembler::new(&self.config.dataset_name, self.config.crop_size);

        let workers = async {
            stream::iter(images.iter().enumerate())
                .map(|(position, image)| {
                    let tx = tx.clone();
                    let state = &state;
                    let gate = &gate;
                    async move {
                        let outcome = self.process_image(position, image, state, gate).await;
                        if tx.send(outcome).await.is_err() {
                            error!(image_id = %image.id, "Manifest collector stopped early");
                        }
                    }
                })
                .buffer_unordered(self.config.workers.max(1))
                .collect::<Vec<()>>()
                .await;
            drop(tx);
        };
        let ((), collected) = tokio::join!(workers, collect(rx, assembler));

        let mut summary = RunSummary {
            total_images: images.len(),
            cancelled: cancel.is_cancelled(),
            ..RunSummary::default()
        };
        summary.processed = sorted(collected.processed);
        summary.failed = sorted(collected.failed);
        summary.skipped = sorted(collected.skipped);

        if summary.cancelled {
            info!(
                duration_ms = run_started.elapsed().as_millis() as u64,
                "Run cancelled before completion"
            );
            return Ok(summary);
        }

        let written = collected
            .assembler
            .write(
                self.store.root(),
                &self.config.suffix(),
                self.config.write_full_dataset,
            )
            .await?;
        summary.manifest_entries = written.restoration.entry_count;
        summary.manifest = Some(written.paths.clone());

        if !self.config.keep_intermediate_files {
            if summary.failed.is_empty() {
                self.store.prune(&written.referenced_crops()).await?;
                state.remove().await?;
                summary.pruned = true;
            } else {
                warn!(
                    failed = summary.failed.len(),
                    "Keeping intermediate files because some images failed"
                );
            }
        }

        info!(
            duration_ms = run_started.elapsed().as_millis() as u64,
            "Curation run complete"
        );
        Ok(summary)
    }

    async fn process_image(
        &self,
        position: usize,
        image: &SourceImage,
        state: &PipelineState,
        gate: &ModelGate,
    ) -> ImageOutcome {
        let skipped = || ImageOutcome::Skipped {
            position,
            image_id: image.id.clone(),
        };
        if gate.cancel_token().is_cancelled() {
            return skipped();
        }

        match self.run_stages(image, state, gate).await {
            Ok(records) => ImageOutcome::Processed(ImageEntries {
                position,
                image_id: image.id.clone(),
                entries: join_records(&image.id, &records),
            }),
            Err((stage, CurationError::Cancelled)) => {
                debug!(image_id = %image.id, stage = %stage, "Stage abandoned on cancellation");
                skipped()
            }
            Err((stage, err)) => {
                let reason = err.to_string();
                if let Err(log_err) = state.mark_failed(&image.id, stage, &reason).await {
                    error!(image_id = %image.id, error = %log_err, "Could not record failure");
                }
                error!(image_id = %image.id, stage = %stage, reason = %reason, "Image failed");
                ImageOutcome::Failed {
                    position,
                    failure: FailedImage {
                        image_id: image.id.clone(),
                        stage,
                        reason,
                    },
                }
            }
        }
    }

    async fn run_stages(
        &self,
        image: &SourceImage,
        state: &PipelineState,
        gate: &ModelGate,
    ) -> Result<ImageRecords, StageError> {
        let id = image.id.as_str();
        let mut recomputed = false;

        let detections = match self
            .cached(state, id, Stage::Detection, recomputed, self.store.read_detections(id))
            .await
        {
            Some(cached) => cached,
            None => {
                recomputed = true;
                let started = Instant::now();
                let at = |e| (Stage::Detection, e);
                let detections = self.detection.detect(gate, image).await.map_err(at)?;
                self.store.write_detections(id, &detections).await.map_err(at)?;
                self.complete(state, id, Stage::Detection, started).await?;
                detections
            }
        };

        let candidates = match self
            .cached(state, id, Stage::Selection, recomputed, self.store.read_selection(id))
            .await
        {
            Some(cached) => cached,
            None => {
                recomputed = true;
                let started = Instant::now();
                let at = |e| (Stage::Selection, e);
                let candidates = self
                    .selection
                    .select(gate, &self.store, image, &detections)
                    .await
                    .map_err(at)?;
                self.store.write_selection(id, &candidates).await.map_err(at)?;
                self.complete(state, id, Stage::Selection, started).await?;
                candidates
            }
        };

        let assessments = match self
            .cached(state, id, Stage::Quality, recomputed, self.store.read_quality(id))
            .await
        {
            Some(cached) => cached,
            None => {
                let started = Instant::now();
                let at = |e| (Stage::Quality, e);
                let mut assessments = Vec::with_capacity(candidates.len());
                for candidate in &candidates {
                    let png = self.store.read_crop(&candidate.crop_file).await.map_err(at)?;
                    let assessment = self
                        .quality
                        .assess(gate, candidate, &png)
                        .await
                        .map_err(at)?;
                    assessments.push(assessment);
                }
                self.store.write_quality(id, &assessments).await.map_err(at)?;
                self.complete(state, id, Stage::Quality, started).await?;
                assessments
            }
        };

        Ok(ImageRecords {
            detections,
            candidates,
            assessments,
        })
    }

    /// Cached stage output, if the state log and the artifact agree
    async fn cached<T>(
        &self,
        state: &PipelineState,
        image_id: &str,
        stage: Stage,
        upstream_recomputed: bool,
        load: impl Future<Output = CurationResult<T>>,
    ) -> Option<T> {
        if upstream_recomputed || !state.is_complete(image_id, stage).await {
            return None;
        }
        match load.await {
            Ok(value) => {
                debug!(image_id, stage = %stage, "Reusing completed stage output");
                Some(value)
            }
            Err(e) => {
                warn!(
                    image_id,
                    stage = %stage,
                    error = %e,
                    "Stage marked complete but artifact unusable, recomputing"
                );
                None
            }
        }
    }

    async fn complete(
        &self,
        state: &PipelineState,
        image_id: &str,
        stage: Stage,
        started: Instant,
    ) -> Result<(), StageError> {
        state
            .mark_complete(image_id, stage)
            .await
            .map_err(|e| (stage, e))?;
        info!(
            image_id,
            stage = %stage,
            duration_ms = started.elapsed().as_millis() as u64,
            "Stage completed"
        );
        Ok(())
    }
}

async fn collect(mut rx: mpsc::Receiver<ImageOutcome>, assembler: ManifestAssembler) -> Collected {
    let mut collected = Collected {
        assembler,
        processed: Vec::new(),
        failed: Vec::new(),
        skipped: Vec::new(),
    };

    while let Some(outcome) = rx.recv().await {
        match outcome {
            ImageOutcome::Processed(entries) => {
                collected
                    .processed
                    .push((entries.position, entries.image_id.clone()));
                collected.assembler.add(entries);
            }
            ImageOutcome::Failed { position, failure } => collected.failed.push((position, failure)),
            ImageOutcome::Skipped { position, image_id } => {
                collected.skipped.push((position, image_id))
            }
        }
    }
    collected
}

fn sorted<T>(mut items: Vec<(usize, T)>) -> Vec<T> {
    items.sort_by_key(|(position, _)| *position);
    items.into_iter().map(|(_, item)| item).collect()
}
