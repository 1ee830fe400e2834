//! Error types for Ronin

use thiserror::Error;

/// Result type alias for Ronin operations
pub type RoninResult<T> = Result<T, RoninError>;

/// Main error type for Ronin
#[derive(Error, Debug)]
pub enum RoninError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RoninError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
