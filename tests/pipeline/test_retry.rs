// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::common::*;
use fabstir_text_curator::storage::STATE_FILE;
use fabstir_text_curator::vision::{MockTextSpotter, MockVlm};
use fabstir_text_curator::{Orchestrator, PipelineState, Stage};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const IDS: [&str; 5] = ["img_1", "img_2", "img_3", "img_4", "img_5"];

fn five_image_spotter() -> Arc<MockTextSpotter> {
    let mut spotter = MockTextSpotter::new();
    for id in IDS {
        spotter = spotter.with_detections(id, vec![text_box(10.0, 10.0, 0.9)]);
    }
    Arc::new(spotter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_transient_failure_is_retried() {
        let tmp = TempDir::new().unwrap();
        let config = shared(test_config(tmp.path()));
        let images = write_sources(&config, &IDS);

        let spotter = five_image_spotter();
        spotter.fail_next("img_3", 1);
        let orchestrator = Orchestrator::new(
            config.clone(),
            spotter.clone(),
            Arc::new(MockVlm::constant("blur", "Not blurry")),
            None,
        );
        let summary = orchestrator.run(&images, CancellationToken::new()).await.unwrap();

        // one retry sequence: five first attempts plus one retry
        assert_eq!(spotter.calls(), 6);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.processed.len(), 5);
        assert_eq!(summary.manifest_entries, 5);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_image_failed() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.retry.max_attempts = 3;
        config.keep_intermediate_files = false;
        let config = shared(config);
        let images = write_sources(&config, &IDS);

        let spotter = five_image_spotter();
        spotter.fail_next("img_3", 100);
        let orchestrator = Orchestrator::new(
            config.clone(),
            spotter.clone(),
            Arc::new(MockVlm::constant("blur", "Not blurry")),
            None,
        );
        let summary = orchestrator.run(&images, CancellationToken::new()).await.unwrap();

        assert_eq!(spotter.calls(), 4 + 3);
        assert_eq!(summary.processed, vec!["img_1", "img_2", "img_4", "img_5"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].image_id, "img_3");
        assert_eq!(summary.failed[0].stage, Stage::Detection);
        assert!(!summary.is_success());

        // the other images still make it into the manifest
        assert_eq!(summary.manifest_entries, 4);

        // no pruning on a run with failures
        assert!(!summary.pruned);
        assert!(orchestrator.state_path().exists());
        assert!(orchestrator.store().records_dir().exists());

        let state = PipelineState::open(config.run_dir().join(STATE_FILE)).await.unwrap();
        let failure = state.failure("img_3").await.unwrap();
        assert_eq!(failure.stage, Stage::Detection);
        assert!(failure.reason.contains("Detection model unavailable"));
    }

    #[tokio::test]
    async fn test_failed_image_recovers_on_rerun() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.retry.max_attempts = 2;
        let config = shared(config);
        let images = write_sources(&config, &IDS);

        let spotter = five_image_spotter();
        spotter.fail_next("img_3", 2);
        let blur = Arc::new(MockVlm::constant("blur", "Not blurry"));
        let first = Orchestrator::new(config.clone(), spotter.clone(), blur.clone(), None)
            .run(&images, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.failed.len(), 1);

        let healthy = five_image_spotter();
        let blur_again = Arc::new(MockVlm::constant("blur", "Not blurry"));
        let second = Orchestrator::new(config.clone(), healthy.clone(), blur_again.clone(), None)
            .run(&images, CancellationToken::new())
            .await
            .unwrap();

        assert!(second.is_success());
        assert_eq!(healthy.calls(), 1);
        assert_eq!(blur_again.calls(), 1);
        assert_eq!(second.manifest_entries, 5);

        let state = PipelineState::open(config.run_dir().join(STATE_FILE)).await.unwrap();
        assert!(state.failures().await.is_empty());
    }

    #[tokio::test]
    async fn test_blur_failure_marks_quality_stage() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.retry.max_attempts = 2;
        config.workers = 1;
        let config = shared(config);
        let images = write_sources(&config, &["img_1"]);

        let blur = Arc::new(MockVlm::constant("blur", "Not blurry"));
        blur.fail_next(2);
        let orchestrator = Orchestrator::new(config.clone(), five_image_spotter(), blur.clone(), None);
        let summary = orchestrator.run(&images, CancellationToken::new()).await.unwrap();

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].stage, Stage::Quality);
        assert_eq!(blur.calls(), 2);

        let state = PipelineState::open(orchestrator.state_path()).await.unwrap();
        assert!(state.is_complete("img_1", Stage::Selection).await);
        assert!(!state.is_complete("img_1", Stage::Quality).await);
    }
}
