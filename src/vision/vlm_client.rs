// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! VLM sidecar client for crop classification via OpenAI-compatible API

use super::boundary::{PromptId, PromptTable, VisionLanguageModel};
use super::image_utils::to_data_url;
use crate::errors::{CurationError, CurationResult};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

// --- OpenAI-compatible serde structs ---

#[derive(serde::Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(serde::Serialize)]
struct ChatMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(serde::Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Client for one named VLM identity served by an OpenAI-compatible sidecar
pub struct VlmClient {
    client: Client,
    endpoint: String,
    /// Identity name from configuration
    name: String,
    /// Model name sent in requests
    model_name: String,
    prompts: PromptTable,
}

impl VlmClient {
    pub fn new(
        name: &str,
        endpoint: &str,
        model_name: Option<&str>,
        prompts: PromptTable,
        timeout: Duration,
    ) -> CurationResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            CurationError::ConfigurationError(format!("cannot build HTTP client: {}", e))
        })?;

        let endpoint = endpoint.trim_end_matches('/').to_string();
        let model_name = model_name.unwrap_or(name).to_string();
        info!(
            "VLM client configured: identity={}, endpoint={}, model={}",
            name, endpoint, model_name
        );

        Ok(Self {
            client,
            endpoint,
            name: name.to_string(),
            model_name,
            prompts,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Check if the VLM sidecar is healthy
    pub async fn health_check(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.endpoint))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("VLM health check failed: {}", e);
                false
            }
        }
    }

    fn build_request(&self, crop_png: &[u8], prompt: PromptId) -> ChatRequest {
        let max_tokens = match prompt {
            PromptId::TextRecognition => 256,
            _ => 16,
        };
        ChatRequest {
            model: self.model_name.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: serde_json::json!([
                    {"type": "text", "text": self.prompts.get(prompt)},
                    {"type": "image_url", "image_url": {"url": to_data_url(crop_png, "png")}}
                ]),
            }],
            max_tokens,
            temperature: 0.0,
        }
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> CurationError {
        CurationError::VlmUnavailable {
            model: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl VisionLanguageModel for VlmClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify(&self, crop_png: &[u8], prompt: PromptId) -> CurationResult<String> {
        let request = self.build_request(crop_png, prompt);

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("HTTP {}", response.status())));
        }

        let chat_response: ChatResponse =
            response.json().await.map_err(|e| self.unavailable(e))?;
        let label = chat_response
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();

        debug!(model = %self.name, prompt = %prompt, label = %label, "VLM answered");
        Ok(label)
    }
}
