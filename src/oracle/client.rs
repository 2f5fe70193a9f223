//! OpenAI-compatible chat completions client

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ModelClass, Oracle, OracleRequest};
use crate::config::OracleConfig;
use crate::error::{Result, RoundError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct ChatCompletionsOracle {
    config: OracleConfig,
    http: Client,
}

impl ChatCompletionsOracle {
    pub fn new(config: OracleConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RoundError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, http })
    }

    pub fn model_name(&self, class: ModelClass) -> &str {
        match class {
            ModelClass::Small => &self.config.small_model,
            ModelClass::Medium => &self.config.medium_model,
            ModelClass::Large => &self.config.large_model,
        }
    }

    fn build_request(&self, request: &OracleRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        ChatRequest {
            model: self.model_name(request.model).to_string(),
            messages,
            temperature: self.config.temperature,
        }
    }
}

#[async_trait]
impl Oracle for ChatCompletionsOracle {
    async fn generate_text(&self, request: OracleRequest) -> Result<String> {
        let body = self.build_request(&request);
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        debug!(model = %body.model, prompt_len = request.prompt.len(), "Sending completion request");

        let mut builder = self.http.post(&url).json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!("Oracle API error: {} - {}", status, text);
            return Err(RoundError::Oracle(format!("API error: {} - {}", status, text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| RoundError::Oracle(format!("Failed to parse completion: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| RoundError::Oracle("No choices in completion".to_string()))
    }
}
