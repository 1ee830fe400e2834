//! Ronin Relay
//!
//! The generation relay sits between the app and the language model: it
//! accepts `{ prompt, imageBase64? }` over POST, asks the model for a
//! self-contained HTML visualization and answers `{ code }` or `{ error }`.
//!
//! - [`RelayHandler`]: the server side, over any [`ModelBackend`]
//! - [`GeminiBackend`]: the hosted model backend
//! - [`RelayClient`]: the app side, plus [`user_message`] for the inline
//!   error notice

use ronin_net::NetError;
use thiserror::Error;

pub mod client;
pub mod gemini;
pub mod handler;
pub mod types;

pub use client::{user_message, RelayClient, DEFAULT_FAILURE};
pub use gemini::{GeminiBackend, GEMINI_ENDPOINT};
pub use handler::{
    build_parts, strip_code_fences, GenerationSettings, ModelBackend, RelayHandler, RelayReply,
    DEFAULT_IMAGE_PROMPT,
};
pub use types::{ErrorResponse, GenerateRequest, GenerateResponse, InlineData, PromptPart};

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors raised on either side of the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Method Not Allowed")]
    MethodNotAllowed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("GEMINI_API_KEY is not configured")]
    MissingApiKey,

    #[error("Model error: {0}")]
    Backend(String),

    /// Error text reported by the relay itself.
    #[error("{0}")]
    Server(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
