// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::common::*;
use fabstir_text_curator::stages::{ANNOTATION_MISMATCH, UNKNOWN_CATEGORY};
use fabstir_text_curator::vision::{MockTextSpotter, MockVlm, PromptId};
use fabstir_text_curator::{
    Decision, Orchestrator, PipelineConfig, RunSummary, VisionLanguageModel,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn spotter() -> Arc<MockTextSpotter> {
    Arc::new(
        MockTextSpotter::new()
            .with_detections("sa_1", vec![text_box(0.0, 0.0, 0.9), text_box(90.0, 60.0, 0.8)]),
    )
}

async fn run_with(config: PipelineConfig, blur: Arc<MockVlm>) -> RunSummary {
    let config = shared(config);
    let images = write_sources(&config, &["sa_1"]);
    Orchestrator::new(config, spotter(), blur, None)
        .run(&images, CancellationToken::new())
        .await
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inverse_keep_matches_direct_keep() {
        let tmp = TempDir::new().unwrap();

        let direct = run_with(
            test_config(&tmp.path().join("direct")),
            Arc::new(MockVlm::constant("blur", "Not blurry")),
        )
        .await;

        let mut inverse_config = test_config(&tmp.path().join("inverse"));
        inverse_config.blur.inverse_prompt = true;
        let inverse_vlm = Arc::new(MockVlm::new("blur", |_, prompt| match prompt {
            PromptId::SharpnessScale => "5".to_string(),
            _ => "Very blurry".to_string(),
        }));
        let inverse = run_with(inverse_config, inverse_vlm).await;

        let direct = read_manifest(&direct.manifest.unwrap().restoration);
        let inverse = read_manifest(&inverse.manifest.unwrap().restoration);
        assert_eq!(direct.entry_count, 2);
        assert_eq!(inverse.entry_count, 2);
        for (d, i) in direct.entries.iter().zip(&inverse.entries) {
            assert_eq!(d.crop_id, i.crop_id);
            assert_eq!(d.decision, Decision::Keep);
            assert_eq!(i.decision, Decision::Keep);
            assert_eq!(d.blur_category, "Not blurry");
            assert_eq!(i.blur_category, d.blur_category);
            assert_eq!(d.sharpness_score, None);
            assert_eq!(i.sharpness_score, Some(5));
        }
    }

    #[tokio::test]
    async fn test_inverse_below_threshold_drops() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.blur.inverse_prompt = true;
        let summary = run_with(config, Arc::new(MockVlm::constant("blur", "Acceptable"))).await;

        let paths = summary.manifest.unwrap();
        assert_eq!(read_manifest(&paths.restoration).entry_count, 0);
        let full = read_manifest(&paths.full.unwrap());
        assert!(full
            .entries
            .iter()
            .all(|e| e.decision == Decision::Drop && e.sharpness_score == Some(3)));
    }

    #[tokio::test]
    async fn test_unknown_category_drops_without_failing() {
        let tmp = TempDir::new().unwrap();
        let summary = run_with(
            test_config(tmp.path()),
            Arc::new(MockVlm::constant("blur", "the text looks fine to me")),
        )
        .await;

        assert!(summary.is_success());
        let paths = summary.manifest.unwrap();
        assert_eq!(read_manifest(&paths.restoration).entry_count, 0);
        let full = read_manifest(&paths.full.unwrap());
        assert_eq!(full.entry_count, 2);
        for entry in &full.entries {
            assert_eq!(entry.decision, Decision::Drop);
            assert_eq!(entry.blur_category, UNKNOWN_CATEGORY);
        }
    }

    #[tokio::test]
    async fn test_disagreeing_annotations_drop_crops() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.annotation.enabled = true;
        config.annotation.require_agreement = true;
        let config = shared(config);
        let images = write_sources(&config, &["sa_1"]);

        let blur = Arc::new(MockVlm::constant("blur", "Not blurry"));
        let vlm1: Arc<dyn VisionLanguageModel> = Arc::new(MockVlm::constant("vlm1", "EXIT"));
        let vlm2: Arc<dyn VisionLanguageModel> = Arc::new(MockVlm::constant("vlm2", "EXTT"));
        let summary = Orchestrator::new(config.clone(), spotter(), blur.clone(), Some((vlm1, vlm2)))
        .run(&images, CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(blur.calls(), 0);
        let paths = summary.manifest.unwrap();
        assert_eq!(read_manifest(&paths.restoration).entry_count, 0);
        let full = read_manifest(&paths.full.unwrap());
        for entry in &full.entries {
            assert_eq!(entry.blur_category, ANNOTATION_MISMATCH);
            assert_eq!(entry.annotations_agree, Some(false));
            assert_eq!(entry.recognized_text.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_full_dataset_can_be_disabled() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.write_full_dataset = false;
        config.output_suffix = Some("_part1".to_string());
        let run_dir = config.run_dir();
        let summary = run_with(config, Arc::new(MockVlm::constant("blur", "Not blurry"))).await;

        let paths = summary.manifest.unwrap();
        assert!(paths.full.is_none());
        assert_eq!(paths.restoration, run_dir.join("restoration_dataset_part1.json"));
        assert!(!run_dir.join("full_dataset_part1.json").exists());
    }
}
