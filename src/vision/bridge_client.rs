// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Client for the text-spotting ("bridge") detection sidecar
//!
//! Request:  `POST {endpoint}/v1/detect`
//!           `{"image": <base64>, "format": "jpeg", "confidence_threshold": 0.3}`
//! Response: `{"detections": [{"polygon": [[x, y], ...], "confidence": 0.9, "text": "..."}]}`

use super::boundary::{RawDetection, TextSpotter};
use super::image_utils::{detect_format, format_to_extension};
use crate::errors::{CurationError, CurationResult};
use crate::types::SourceImage;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    image: String,
    format: &'a str,
    confidence_threshold: f32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

pub struct BridgeClient {
    client: Client,
    endpoint: String,
}

impl BridgeClient {
    pub fn new(endpoint: &str, timeout: Duration) -> CurationResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            CurationError::ConfigurationError(format!("cannot build HTTP client: {}", e))
        })?;

        let endpoint = endpoint.trim_end_matches('/').to_string();
        info!("Bridge detection client configured: endpoint={}", endpoint);

        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Check if the detection sidecar is healthy
    pub async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.endpoint))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Bridge health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl TextSpotter for BridgeClient {
    async fn spot(
        &self,
        image: &SourceImage,
        confidence_threshold: f32,
    ) -> CurationResult<Vec<RawDetection>> {
        let bytes = tokio::fs::read(&image.path)
            .await
            .map_err(|e| CurationError::InvalidImage {
                path: image.path.display().to_string(),
                reason: e.to_string(),
            })?;
        let format = detect_format(&bytes).map_err(|e| CurationError::InvalidImage {
            path: image.path.display().to_string(),
            reason: e.to_string(),
        })?;

        let request = DetectRequest {
            image: STANDARD.encode(&bytes),
            format: format_to_extension(format),
            confidence_threshold,
        };

        let response = self
            .client
            .post(format!("{}/v1/detect", self.endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|e| CurationError::DetectionUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CurationError::DetectionUnavailable(format!(
                "HTTP {} for {}",
                response.status(),
                image.id
            )));
        }

        let body: DetectResponse = response
            .json()
            .await
            .map_err(|e| CurationError::DetectionUnavailable(e.to_string()))?;

        debug!(
            image_id = %image.id,
            count = body.detections.len(),
            "Bridge returned detections"
        );
        Ok(body.detections)
    }
}
