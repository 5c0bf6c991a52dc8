// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use super::common::*;
use fabstir_text_curator::vision::{MockTextSpotter, MockVlm};
use fabstir_text_curator::Orchestrator;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_detections_yield_empty_manifest() {
        let tmp = TempDir::new().unwrap();
        let config = shared(test_config(tmp.path()));
        let images = write_sources(&config, &["sa_1"]);

        let blur = Arc::new(MockVlm::constant("blur", "Not blurry"));
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(MockTextSpotter::new()),
            blur.clone(),
            None,
        );
        let summary = orchestrator.run(&images, CancellationToken::new()).await.unwrap();

        assert_eq!(summary.processed, vec!["sa_1"]);
        assert_eq!(summary.manifest_entries, 0);
        assert_eq!(blur.calls(), 0);

        let paths = summary.manifest.unwrap();
        assert_eq!(read_manifest(&paths.restoration).entries.len(), 0);
        assert_eq!(read_manifest(&paths.full.unwrap()).entries.len(), 0);
        let crops = std::fs::read_dir(orchestrator.store().crops_dir()).unwrap().count();
        assert_eq!(crops, 0);
    }

    #[tokio::test]
    async fn test_max_crops_keeps_top_three() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.max_crops_per_image = 3;
        let config = shared(config);
        let images = write_sources(&config, &["sa_1"]);

        let spotter = MockTextSpotter::new().with_detections(
            "sa_1",
            vec![
                text_box(0.0, 0.0, 0.55),
                text_box(30.0, 10.0, 0.92),
                text_box(60.0, 20.0, 0.61),
                text_box(90.0, 30.0, 0.87),
                text_box(120.0, 40.0, 0.74),
            ],
        );
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(spotter),
            Arc::new(MockVlm::constant("blur", "Not blurry")),
            None,
        );
        let summary = orchestrator.run(&images, CancellationToken::new()).await.unwrap();

        let manifest = read_manifest(&summary.manifest.unwrap().restoration);
        let confidences: Vec<f32> = manifest.entries.iter().map(|e| e.confidence).collect();
        assert_eq!(confidences, vec![0.92, 0.87, 0.74]);
        let ids: Vec<&str> = manifest.entries.iter().map(|e| e.crop_id.as_str()).collect();
        assert_eq!(ids, vec!["sa_1_00", "sa_1_01", "sa_1_02"]);
        for entry in &manifest.entries {
            let crop = image::open(orchestrator.store().resolve(&entry.crop_file)).unwrap();
            assert_eq!((crop.width(), crop.height()), (CROP_SIZE, CROP_SIZE));
        }
    }

    #[tokio::test]
    async fn test_confidence_threshold_filters_detections() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.bridge_confidence_threshold = 0.3;
        let config = shared(config);
        let images = write_sources(&config, &["sa_1"]);

        let spotter = MockTextSpotter::new().with_detections(
            "sa_1",
            vec![
                text_box(0.0, 0.0, 0.1),
                text_box(50.0, 40.0, 0.35),
                text_box(100.0, 80.0, 0.9),
            ],
        );
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(spotter),
            Arc::new(MockVlm::constant("blur", "Not blurry")),
            None,
        );
        let summary = orchestrator.run(&images, CancellationToken::new()).await.unwrap();

        let detections = orchestrator.store().read_detections("sa_1").await.unwrap();
        let kept: Vec<f32> = detections.iter().map(|d| d.confidence).collect();
        assert_eq!(kept, vec![0.35, 0.9]);

        let manifest = read_manifest(&summary.manifest.unwrap().restoration);
        let confidences: Vec<f32> = manifest.entries.iter().map(|e| e.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.35]);
    }

    #[tokio::test]
    async fn test_duplicate_boxes_selected_once() {
        let tmp = TempDir::new().unwrap();
        let config = shared(test_config(tmp.path()));
        let images = write_sources(&config, &["sa_1"]);

        let spotter = MockTextSpotter::new().with_detections(
            "sa_1",
            vec![
                text_box(10.0, 10.0, 0.9),
                text_box(10.0, 10.0, 0.88),
                text_box(11.0, 10.0, 0.86),
                text_box(100.0, 60.0, 0.5),
            ],
        );
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(spotter),
            Arc::new(MockVlm::constant("blur", "Not blurry")),
            None,
        );
        let summary = orchestrator.run(&images, CancellationToken::new()).await.unwrap();

        let manifest = read_manifest(&summary.manifest.unwrap().restoration);
        let confidences: Vec<f32> = manifest.entries.iter().map(|e| e.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.5]);
    }

    #[tokio::test]
    async fn test_manifest_follows_listing_order() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.workers = 4;
        let config = shared(config);
        let ids = ["sa_05", "sa_01", "sa_04", "sa_02", "sa_03"];
        let images = write_sources(&config, &ids);

        let mut spotter = MockTextSpotter::new();
        for id in ids {
            spotter = spotter.with_detections(id, vec![text_box(0.0, 0.0, 0.8), text_box(80.0, 60.0, 0.6)]);
        }
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(spotter),
            Arc::new(MockVlm::constant("blur", "Not blurry")),
            None,
        );
        let summary = orchestrator.run(&images, CancellationToken::new()).await.unwrap();

        let manifest = read_manifest(&summary.manifest.unwrap().restoration);
        let crop_ids: Vec<&str> = manifest.entries.iter().map(|e| e.crop_id.as_str()).collect();
        assert_eq!(
            crop_ids,
            vec![
                "sa_01_00", "sa_01_01", "sa_02_00", "sa_02_01", "sa_03_00", "sa_03_01", "sa_04_00",
                "sa_04_01", "sa_05_00", "sa_05_01"
            ]
        );
    }

    #[tokio::test]
    async fn test_entries_locate_text_inside_crop() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.redetect_crops = true;
        let config = shared(config);
        let images = write_sources(&config, &["sa_1"]);

        // 24x8 box at (10, 20) in a 160x120 image: 32px window at (6, 8), native size
        let spotter = Arc::new(
            MockTextSpotter::new()
                .with_detections("sa_1", vec![text_box(10.0, 20.0, 0.9)])
                .with_detections("sa_1_00", vec![text_box(4.0, 12.0, 0.8)]),
        );
        let orchestrator = Orchestrator::new(
            config.clone(),
            spotter.clone(),
            Arc::new(MockVlm::constant("blur", "Not blurry")),
            None,
        );
        let summary = orchestrator.run(&images, CancellationToken::new()).await.unwrap();
        assert_eq!(spotter.calls(), 2);

        let manifest = read_manifest(&summary.manifest.unwrap().restoration);
        let entry = &manifest.entries[0];
        assert_eq!(
            entry.crop_polygon,
            vec![[4.0, 12.0], [28.0, 12.0], [28.0, 20.0], [4.0, 20.0]]
        );
        assert_eq!(entry.crop_detections.len(), 1);
        assert_eq!(entry.crop_detections[0].polygon, entry.crop_polygon);
        assert_eq!(entry.crop_detections[0].text.as_deref(), Some("EXIT"));
    }
}
