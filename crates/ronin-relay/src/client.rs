//! App side of the relay.

use std::sync::Arc;

use ronin_net::{Fetcher, Request};
use url::Url;

use crate::types::{ErrorResponse, GenerateRequest, GenerateResponse};
use crate::{RelayError, RelayResult};

/// Reported when the relay fails without saying why.
pub const DEFAULT_FAILURE: &str = "Failed to generate visualization";

/// Posts generation requests to the relay.
pub struct RelayClient {
    fetcher: Arc<dyn Fetcher>,
    endpoint: Url,
}

impl RelayClient {
    pub fn new(fetcher: Arc<dyn Fetcher>, endpoint: Url) -> Self {
        Self { fetcher, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Ask the relay for a visualization. Returns the generated HTML.
    pub async fn generate(&self, prompt: &str, image_base64: Option<&str>) -> RelayResult<String> {
        let result = self.request(prompt, image_base64).await;
        if let Err(err) = &result {
            log::error!("Error generating visualization: {}", err);
        }
        result
    }

    async fn request(&self, prompt: &str, image_base64: Option<&str>) -> RelayResult<String> {
        let body = GenerateRequest {
            prompt: prompt.to_string(),
            image_base64: image_base64.map(str::to_string),
        };
        let response = self
            .fetcher
            .fetch(Request::post_json(self.endpoint.clone(), &body)?)
            .await?;

        if !response.ok() {
            let error = response
                .json::<ErrorResponse>()
                .ok()
                .map(|body| body.error)
                .filter(|error| !error.is_empty())
                .unwrap_or_else(|| DEFAULT_FAILURE.to_string());
            return Err(RelayError::Server(error));
        }

        Ok(response.json::<GenerateResponse>()?.code)
    }
}

/// The inline notice shown for a failed generation.
pub fn user_message(err: &RelayError) -> String {
    let message = err.to_string();
    if message.contains("API_KEY") {
        "API Configuration Error: Missing API Key.".to_string()
    } else if message.is_empty() {
        "Something went wrong. Please try again.".to_string()
    } else {
        message
    }
}
