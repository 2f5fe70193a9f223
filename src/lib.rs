pub mod chain;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod oracle;
pub mod relay;
pub mod runtime;
pub mod services;
pub mod signing;
pub mod store;

pub use config::AppConfig;
pub use engine::{LifecycleEvent, MessageOutcome, RejectReason, RoundEngine, SyncOutcome};
pub use error::{Result, RoundError};
pub use oracle::{ChatCompletionsOracle, ModelClass, Oracle, OracleRequest};
pub use relay::{HttpRelay, Relay};
pub use signing::Wallet;
pub use store::{PostgresStore, RoundStore};
