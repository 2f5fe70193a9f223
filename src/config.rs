use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::domain::{AgentId, RoomId};
use crate::engine::RoundValidityPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub oracle: OracleConfig,
    pub relay: RelayConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// On-chain round-start listener (optional)
    #[serde(default)]
    pub contract: Option<ContractConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity and persona of this agent
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Numeric agent id registered with the backend
    pub id: AgentId,
    /// Room this agent participates in
    pub room_id: RoomId,
    /// Chain id used for the signing wallet
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default)]
    pub profile: AgentProfile,
}

fn default_chain_id() -> u64 {
    1
}

/// Persona material fed into prompts
#[derive(Debug, Clone, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub bio: Vec<String>,
    #[serde(default)]
    pub knowledge: Vec<String>,
    #[serde(default)]
    pub lore: Vec<String>,
    #[serde(default)]
    pub message_examples: Vec<String>,
    #[serde(default = "default_investment_style")]
    pub investment_style: String,
    #[serde(default = "default_risk_tolerance")]
    pub risk_tolerance: String,
    #[serde(default = "default_experience_level")]
    pub experience_level: String,
    #[serde(default)]
    pub weights: AnalysisWeights,
}

fn default_investment_style() -> String {
    "balanced".to_string()
}

fn default_risk_tolerance() -> String {
    "moderate".to_string()
}

fn default_experience_level() -> String {
    "intermediate".to_string()
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            name: "agent".to_string(),
            bio: Vec::new(),
            knowledge: Vec::new(),
            lore: Vec::new(),
            message_examples: Vec::new(),
            investment_style: default_investment_style(),
            risk_tolerance: default_risk_tolerance(),
            experience_level: default_experience_level(),
            weights: AnalysisWeights::default(),
        }
    }
}

/// Relative weight of each analysis lens in prompts
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AnalysisWeights {
    pub technical: f64,
    pub fundamental: f64,
    pub sentiment: f64,
    pub risk: f64,
}

impl Default for AnalysisWeights {
    fn default() -> Self {
        Self {
            technical: 0.25,
            fundamental: 0.15,
            sentiment: 0.4,
            risk: 0.2,
        }
    }
}

/// Round coordination engine tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a seen signature is remembered for dedup
    pub signature_ttl_secs: u64,
    /// Minimum gap between unsolicited responses
    pub cooldown_ms: u64,
    pub max_observations: usize,
    pub max_messages: usize,
    /// Number of rounds kept in memory
    pub round_cache_capacity: usize,
    /// Messages/observations included in the should-respond prompt
    pub context_window: usize,
    /// Senders that bypass cooldown and roster checks (game master)
    pub privileged_agent_ids: Vec<AgentId>,
    /// Recover the signer of inbound payloads and compare with `sender`
    pub verify_signatures: bool,
    /// Post an introduction when a new round is inserted
    pub introduce_on_round_start: bool,
    pub message_policy: RoundValidityPolicy,
    pub observation_policy: RoundValidityPolicy,
    pub decision_policy: RoundValidityPolicy,
    pub should_respond: RetryConfig,
    /// Timeout for a single text-generation call
    pub generation_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signature_ttl_secs: 300,
            cooldown_ms: 5000,
            max_observations: 30,
            max_messages: 10,
            round_cache_capacity: 8,
            context_window: 5,
            privileged_agent_ids: Vec::new(),
            verify_signatures: false,
            introduce_on_round_start: false,
            message_policy: RoundValidityPolicy {
                require_current: true,
                require_open: true,
            },
            observation_policy: RoundValidityPolicy {
                require_current: false,
                require_open: true,
            },
            decision_policy: RoundValidityPolicy {
                require_current: false,
                require_open: false,
            },
            should_respond: RetryConfig::default(),
            generation_timeout_ms: 60_000,
        }
    }
}

/// Bounded exponential backoff for oracle calls
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_attempts: u32,
    /// Overall deadline across all attempts
    pub deadline_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_attempts: 5,
            deadline_ms: 60_000,
            call_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    /// OpenAI-compatible API base (e.g. https://api.openai.com/v1)
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub small_model: String,
    pub medium_model: String,
    pub large_model: String,
    #[serde(default = "default_oracle_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_oracle_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Base URL of the message relay
    pub url: String,
    #[serde(default = "default_relay_timeout")]
    pub timeout_ms: u64,
}

fn default_relay_timeout() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// PostgreSQL connection URL
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// NOTIFY channel carrying round/round_agent row changes
    #[serde(default = "default_change_channel")]
    pub change_channel: String,
}

fn default_max_connections() -> u32 {
    5
}

fn default_change_channel() -> String {
    "round_changes".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub rpc_url: String,
    /// Address of the round contract emitting RoundStarted
    pub address: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("store.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("ROUNDTABLE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (ROUNDTABLE_RELAY__URL, etc.)
            .add_source(
                Environment::with_prefix("ROUNDTABLE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.agent.id <= 0 {
            errors.push("agent.id must be positive".to_string());
        }
        if self.agent.room_id <= 0 {
            errors.push("agent.room_id must be positive".to_string());
        }

        let engine = &self.engine;
        if engine.round_cache_capacity == 0 {
            errors.push("engine.round_cache_capacity must be at least 1".to_string());
        }
        if engine.max_messages == 0 || engine.max_observations == 0 {
            errors.push("engine FIFO capacities must be at least 1".to_string());
        }
        if engine.context_window == 0 {
            errors.push("engine.context_window must be at least 1".to_string());
        }
        if engine.should_respond.max_attempts == 0 {
            errors.push("engine.should_respond.max_attempts must be at least 1".to_string());
        }
        if engine.should_respond.call_timeout_ms == 0 || engine.generation_timeout_ms == 0 {
            errors.push("oracle call timeouts must be positive".to_string());
        }

        for (name, raw) in [
            ("relay.url", &self.relay.url),
            ("oracle.base_url", &self.oracle.base_url),
        ] {
            if url::Url::parse(raw).is_err() {
                errors.push(format!("{name} is not a valid URL: {raw}"));
            }
        }

        if let Some(contract) = &self.contract {
            if url::Url::parse(&contract.rpc_url).is_err() {
                errors.push(format!("contract.rpc_url is not a valid URL: {}", contract.rpc_url));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
