// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::common::*;
use fabstir_text_curator::storage::STATE_FILE;
use fabstir_text_curator::vision::{MockTextSpotter, MockVlm, PromptId};
use fabstir_text_curator::{
    regenerate, ArtifactStore, CurationError, Orchestrator, PipelineConfig, PipelineState, Stage,
    VisionLanguageModel,
};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn spotter() -> Arc<MockTextSpotter> {
    Arc::new(
        MockTextSpotter::new()
            .with_detections("sa_1", vec![text_box(0.0, 0.0, 0.9), text_box(80.0, 60.0, 0.7)])
            .with_detections("sa_2", vec![text_box(20.0, 20.0, 0.8)])
            .with_detections("sa_3", vec![]),
    )
}

fn blur() -> Arc<MockVlm> {
    Arc::new(MockVlm::constant("blur", "Not blurry"))
}

/// Blur model answering "Not blurry", then "Blurry", alternating
fn alternating_blur() -> Arc<MockVlm> {
    let answered = AtomicUsize::new(0);
    Arc::new(MockVlm::new("blur", move |_, _| {
        if answered.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            "Not blurry".to_string()
        } else {
            "Blurry".to_string()
        }
    }))
}

fn orchestrator(
    config: &Arc<PipelineConfig>,
    spotter: &Arc<MockTextSpotter>,
    blur: &Arc<MockVlm>,
) -> Orchestrator {
    Orchestrator::new(config.clone(), spotter.clone(), blur.clone(), None)
}

fn annotated(
    config: &Arc<PipelineConfig>,
    vlm1: Arc<dyn VisionLanguageModel>,
    vlm2: Arc<dyn VisionLanguageModel>,
) -> Orchestrator {
    Orchestrator::new(config.clone(), spotter(), blur(), Some((vlm1, vlm2)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rerun_is_byte_identical_without_model_calls() {
        let tmp = TempDir::new().unwrap();
        let config = shared(test_config(tmp.path()));
        let images = write_sources(&config, &["sa_1", "sa_2", "sa_3"]);

        let (first_spotter, first_blur) = (spotter(), blur());
        let first = orchestrator(&config, &first_spotter, &first_blur)
            .run(&images, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first_spotter.calls(), 3);
        assert_eq!(first_blur.calls(), 3);
        let paths = first.manifest.unwrap();
        let restoration = std::fs::read(&paths.restoration).unwrap();
        let full = std::fs::read(paths.full.as_ref().unwrap()).unwrap();

        let (second_spotter, second_blur) = (spotter(), blur());
        let second = orchestrator(&config, &second_spotter, &second_blur)
            .run(&images, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(second_spotter.calls(), 0);
        assert_eq!(second_blur.calls(), 0);
        assert_eq!(second.processed, first.processed);
        let paths = second.manifest.unwrap();
        assert_eq!(std::fs::read(&paths.restoration).unwrap(), restoration);
        assert_eq!(std::fs::read(paths.full.as_ref().unwrap()).unwrap(), full);
    }

    #[tokio::test]
    async fn test_regenerate_matches_run_output() {
        let tmp = TempDir::new().unwrap();
        let config = shared(test_config(tmp.path()));
        let images = write_sources(&config, &["sa_1", "sa_2", "sa_3"]);

        let summary = orchestrator(&config, &spotter(), &blur())
            .run(&images, CancellationToken::new())
            .await
            .unwrap();
        let paths = summary.manifest.unwrap();
        let from_run = std::fs::read(&paths.restoration).unwrap();
        std::fs::remove_file(&paths.restoration).unwrap();

        let store = ArtifactStore::new(config.run_dir());
        let state = PipelineState::open(store.root().join(STATE_FILE)).await.unwrap();
        let rebuilt = regenerate(&config, &images, &store, &state, false).await.unwrap();

        assert_eq!(rebuilt.images_included, 3);
        assert!(rebuilt.images_skipped.is_empty());
        assert_eq!(std::fs::read(&rebuilt.paths.restoration).unwrap(), from_run);
    }

    #[tokio::test]
    async fn test_torn_state_line_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let config = shared(test_config(tmp.path()));
        let images = write_sources(&config, &["sa_1", "sa_2"]);

        orchestrator(&config, &spotter(), &blur())
            .run(&images, CancellationToken::new())
            .await
            .unwrap();

        let state_path = config.run_dir().join(STATE_FILE);
        let mut file = std::fs::OpenOptions::new().append(true).open(&state_path).unwrap();
        file.write_all(br#"{"image_id":"sa_2","stage":"qual"#).unwrap();
        drop(file);

        let (spotter, blur) = (spotter(), blur());
        let summary = orchestrator(&config, &spotter, &blur)
            .run(&images, CancellationToken::new())
            .await
            .unwrap();

        assert!(summary.is_success());
        assert_eq!(spotter.calls(), 0);
        assert_eq!(blur.calls(), 0);

        let state = PipelineState::open(&state_path).await.unwrap();
        assert!(state.is_fully_complete("sa_1").await);
        assert!(state.is_fully_complete("sa_2").await);
    }

    #[tokio::test]
    async fn test_partial_progress_resumes_at_next_stage() {
        let tmp = TempDir::new().unwrap();
        let config = shared(test_config(tmp.path()));
        let images = write_sources(&config, &["sa_1"]);

        let store = ArtifactStore::new(config.run_dir());
        store.ensure_dirs().await.unwrap();
        let detections = fabstir_text_curator::stages::filter_detections(
            "sa_1",
            vec![text_box(0.0, 0.0, 0.9)],
            config.bridge_confidence_threshold,
        );
        store.write_detections("sa_1", &detections).await.unwrap();
        let state = PipelineState::open(store.root().join(STATE_FILE)).await.unwrap();
        state.mark_complete("sa_1", Stage::Detection).await.unwrap();
        drop(state);

        let (spotter, blur) = (spotter(), blur());
        let summary = orchestrator(&config, &spotter, &blur)
            .run(&images, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(spotter.calls(), 0);
        assert_eq!(blur.calls(), 1);
        assert_eq!(summary.manifest_entries, 1);
    }

    #[tokio::test]
    async fn test_annotation_prompts_not_repeated_on_resume() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.annotation.enabled = true;
        let config = shared(config);
        let images = write_sources(&config, &["sa_1"]);

        let reader = |name: &str| {
            Arc::new(MockVlm::new(name, |_, prompt| match prompt {
                PromptId::TextRecognition => "EXIT".to_string(),
                _ => String::new(),
            }))
        };
        let (vlm1, vlm2) = (reader("vlm1"), reader("vlm2"));
        let summary = annotated(&config, vlm1.clone(), vlm2.clone())
            .run(&images, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.manifest_entries, 2);
        assert_eq!((vlm1.calls(), vlm2.calls()), (2, 2));

        let (again1, again2) = (reader("vlm1"), reader("vlm2"));
        annotated(&config, again1.clone(), again2.clone())
            .run(&images, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!((again1.calls(), again2.calls()), (0, 0));
    }

    #[tokio::test]
    async fn test_pruned_run_keeps_crops_of_full_dataset() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.keep_intermediate_files = false;
        let config = shared(config);
        let images = write_sources(&config, &["sa_1"]);

        let summary = orchestrator(&config, &spotter(), &alternating_blur())
            .run(&images, CancellationToken::new())
            .await
            .unwrap();
        assert!(summary.pruned);
        assert_eq!(summary.manifest_entries, 1);

        let paths = summary.manifest.unwrap();
        let full = read_manifest(paths.full.as_ref().unwrap());
        assert_eq!(full.entry_count, 2);
        assert!(full.entries.iter().any(|e| !e.decision.is_keep()));

        let store = ArtifactStore::new(config.run_dir());
        for entry in &full.entries {
            assert!(
                store.resolve(&entry.crop_file).exists(),
                "missing {}",
                entry.crop_file
            );
        }
        assert!(!store.records_dir().exists());
    }

    #[tokio::test]
    async fn test_regenerate_after_prune_keeps_existing_manifest() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.keep_intermediate_files = false;
        let config = shared(config);
        let images = write_sources(&config, &["sa_1", "sa_2"]);

        let summary = orchestrator(&config, &spotter(), &blur())
            .run(&images, CancellationToken::new())
            .await
            .unwrap();
        assert!(summary.pruned);
        let paths = summary.manifest.unwrap();
        let before = std::fs::read(&paths.restoration).unwrap();
        assert_eq!(read_manifest(&paths.restoration).entry_count, 3);

        let store = ArtifactStore::new(config.run_dir());
        let state = PipelineState::open(store.root().join(STATE_FILE)).await.unwrap();
        let err = regenerate(&config, &images, &store, &state, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CurationError::IncompleteArtifacts { skipped: 2, .. }));
        assert_eq!(std::fs::read(&paths.restoration).unwrap(), before);

        let forced = regenerate(&config, &images, &store, &state, true).await.unwrap();
        assert_eq!(forced.images_included, 0);
        assert_eq!(forced.images_skipped, vec!["sa_1", "sa_2"]);
        assert_eq!(read_manifest(&paths.restoration).entry_count, 0);
    }
}
