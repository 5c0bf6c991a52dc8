// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! In-memory model backends for tests and dry runs
//!
//! Both mocks count calls and support injected transient failures, so
//! resumption and retry behaviour can be checked without a model server.

use super::boundary::{PromptId, RawDetection, TextSpotter, VisionLanguageModel};
use crate::errors::{CurationError, CurationResult};
use crate::types::SourceImage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Text spotter answering from a fixed table keyed by image id
#[derive(Debug, Default)]
pub struct MockTextSpotter {
    detections: HashMap<String, Vec<RawDetection>>,
    /// Remaining injected failures per image id
    failures: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
}

impl MockTextSpotter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detections(mut self, image_id: &str, detections: Vec<RawDetection>) -> Self {
        self.detections.insert(image_id.to_string(), detections);
        self
    }

    /// Make the next `times` calls for `image_id` fail with `DetectionUnavailable`
    pub fn fail_next(&self, image_id: &str, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(image_id.to_string(), times);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextSpotter for MockTextSpotter {
    async fn spot(
        &self,
        image: &SourceImage,
        _confidence_threshold: f32,
    ) -> CurationResult<Vec<RawDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut failures) = self.failures.lock() {
            if let Some(remaining) = failures.get_mut(&image.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(CurationError::DetectionUnavailable(format!(
                        "injected failure for {}",
                        image.id
                    )));
                }
            }
        }

        Ok(self.detections.get(&image.id).cloned().unwrap_or_default())
    }
}

type Responder = Box<dyn Fn(&[u8], PromptId) -> String + Send + Sync>;

/// VLM identity answering through a closure
pub struct MockVlm {
    name: String,
    responder: Responder,
    failures: Mutex<u32>,
    calls: AtomicUsize,
}

impl MockVlm {
    pub fn new<F>(name: &str, responder: F) -> Self
    where
        F: Fn(&[u8], PromptId) -> String + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            responder: Box::new(responder),
            failures: Mutex::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with the same label
    pub fn constant(name: &str, label: &str) -> Self {
        let label = label.to_string();
        Self::new(name, move |_, _| label.clone())
    }

    /// Make the next `times` calls fail with `VlmUnavailable`
    pub fn fail_next(&self, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures = times;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionLanguageModel for MockVlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify(&self, crop_png: &[u8], prompt: PromptId) -> CurationResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Ok(mut failures) = self.failures.lock() {
            if *failures > 0 {
                *failures -= 1;
                return Err(CurationError::VlmUnavailable {
                    model: self.name.clone(),
                    reason: "injected failure".to_string(),
                });
            }
        }

        Ok((self.responder)(crop_png, prompt))
    }
}
