use thiserror::Error;

/// Main error type for the round coordination engine
#[derive(Error, Debug)]
pub enum RoundError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Oracle unavailable: {0}")]
    Oracle(String),

    #[error("Relay unavailable: {0}")]
    Relay(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Inbound payload errors (rejected at the boundary, maps to 400)
    #[error("Validation failed: {0}")]
    Validation(String),

    // Round state errors
    #[error("Round not found: {0}")]
    RoundNotFound(i64),

    #[error("Unknown round status: {0}")]
    UnknownStatus(String),

    // Startup errors
    #[error("Initialization failed: {0}")]
    FatalInit(String),

    // Crypto/signing errors
    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Signature error: {0}")]
    Signature(String),

    // Suspension point errors
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RoundError {
    /// True for transport failures of a collaborator (store, oracle, relay)
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            RoundError::Database(_)
                | RoundError::Http(_)
                | RoundError::Oracle(_)
                | RoundError::Relay(_)
                | RoundError::Timeout(_)
        )
    }
}

/// Result type alias for RoundError
pub type Result<T> = std::result::Result<T, RoundError>;
