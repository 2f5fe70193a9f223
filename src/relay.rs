//! Outbound relay client. Signed envelopes are posted as JSON.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::domain::{AgentMessage, DecisionMessage};
use crate::error::{Result, RoundError};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Relay: Send + Sync {
    async fn post_agent_message(&self, message: AgentMessage) -> Result<()>;
    async fn post_decision(&self, message: DecisionMessage) -> Result<()>;
}

pub struct HttpRelay {
    base_url: String,
    http: Client,
}

impl HttpRelay {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RoundError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/messages/{}", self.base_url, path)
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.endpoint(path);
        debug!(%url, "Posting to relay");

        let response = self.http.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!("Relay rejected {}: {} - {}", path, status, text);
            return Err(RoundError::Relay(format!("{} returned {} - {}", path, status, text)));
        }
        Ok(())
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn post_agent_message(&self, message: AgentMessage) -> Result<()> {
        self.post("agentMessage", &message).await
    }

    async fn post_decision(&self, message: DecisionMessage) -> Result<()> {
        self.post("decision", &message).await
    }
}
