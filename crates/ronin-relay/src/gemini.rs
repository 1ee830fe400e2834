//! Hosted model backend speaking the Gemini `generateContent` REST API.

use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderName, HeaderValue};
use ronin_net::{Fetcher, Request};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::handler::{GenerationSettings, ModelBackend};
use crate::types::PromptPart;
use crate::{RelayError, RelayResult};

/// Base URL of the public API.
pub const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/";

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: [Content; 1],
    system_instruction: Content,
    generation_config: GenerationConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

/// Response parts carry text only; anything else is ignored.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ContentPart {
    Prompt(PromptPart),
    Other(serde_json::Value),
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// [`ModelBackend`] over the Gemini REST API.
pub struct GeminiBackend {
    fetcher: Arc<dyn Fetcher>,
    endpoint: Url,
    api_key: Option<String>,
}

impl GeminiBackend {
    pub fn new(fetcher: Arc<dyn Fetcher>, api_key: Option<String>) -> RelayResult<Self> {
        Ok(Self {
            fetcher,
            endpoint: Url::parse(GEMINI_ENDPOINT)?,
            api_key,
        })
    }

    /// Read the key from `GEMINI_API_KEY`.
    pub fn from_env(fetcher: Arc<dyn Fetcher>) -> RelayResult<Self> {
        Self::new(fetcher, std::env::var("GEMINI_API_KEY").ok())
    }

    /// Point at a different API base URL.
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    async fn generate(
        &self,
        settings: &GenerationSettings,
        parts: Vec<PromptPart>,
    ) -> RelayResult<String> {
        let key = self
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(RelayError::MissingApiKey)?;
        let key = HeaderValue::from_str(key)
            .map_err(|_| RelayError::Backend("API key is not a valid header value".to_string()))?;

        let url = self
            .endpoint
            .join(&format!("models/{}:generateContent", settings.model))?;
        let body = GenerateContentRequest {
            contents: [Content {
                parts: parts.into_iter().map(ContentPart::Prompt).collect(),
            }],
            system_instruction: Content {
                parts: vec![ContentPart::Prompt(PromptPart::Text(
                    settings.system_instruction.clone(),
                ))],
            },
            generation_config: GenerationConfig {
                temperature: settings.temperature,
            },
        };

        let request =
            Request::post_json(url, &body)?.header(HeaderName::from_static(API_KEY_HEADER), key);
        let response = self.fetcher.fetch(request).await?;

        if !response.ok() {
            let message = response
                .json::<ApiErrorBody>()
                .map(|body| body.error.message)
                .unwrap_or_else(|_| format!("HTTP {}", response.status));
            return Err(RelayError::Backend(message));
        }

        let reply: GenerateContentResponse = response.json()?;
        let text = reply
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .filter_map(|part| match part {
                        ContentPart::Prompt(PromptPart::Text(text)) => Some(text),
                        _ => None,
                    })
                    .collect::<String>()
            })
            .unwrap_or_default();
        log::debug!("Model returned {} bytes", text.len());
        Ok(text)
    }
}
