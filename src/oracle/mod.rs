//! Text-generation oracle used for should-respond, replies and decisions

mod client;

pub use client::ChatCompletionsOracle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Model size tier. Each tier maps to a configured model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelClass {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    pub model: ModelClass,
    pub system: Option<String>,
    pub prompt: String,
}

impl OracleRequest {
    pub fn new(model: ModelClass, prompt: impl Into<String>) -> Self {
        Self {
            model,
            system: None,
            prompt: prompt.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Generate a completion for the prompt
    async fn generate_text(&self, request: OracleRequest) -> Result<String>;
}

/// Extract JSON from a response that may wrap it in markdown code fences
pub fn extract_json(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        if let Some(end) = text[start + 7..].find("```") {
            return text[start + 7..start + 7 + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        if let Some(end) = text[start + 3..].find("```") {
            let content = text[start + 3..start + 3 + end].trim();
            if content.starts_with('{') {
                return content;
            }
            if let Some(newline) = content.find('\n') {
                return content[newline + 1..].trim();
            }
            return content;
        }
    }

    if let Some(start) = text.find('{') {
        if let Some(end) = text.rfind('}') {
            if end > start {
                return &text[start..=end];
            }
        }
    }

    text.trim()
}
