//! Error types for the AI module

use parley_traits::GenerationFailure;
use thiserror::Error;

/// AI module error types
#[derive(Error, Debug)]
pub enum AiError {
    #[error("Missing API key for provider {0}")]
    MissingApiKey(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for AI operations
pub type Result<T> = std::result::Result<T, AiError>;

impl From<AiError> for GenerationFailure {
    fn from(err: AiError) -> Self {
        match err {
            AiError::Json(e) => GenerationFailure::malformed_payload(e.to_string()),
            other => GenerationFailure::upstream(other.to_string()),
        }
    }
}
