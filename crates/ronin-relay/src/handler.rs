//! Server side of the relay.

use async_trait::async_trait;
use http::{Method, StatusCode};
use serde::Serialize;

use crate::types::{ErrorResponse, GenerateRequest, GenerateResponse, InlineData, PromptPart};
use crate::{RelayError, RelayResult};

/// Text sent with an image when the prompt is blank.
pub const DEFAULT_IMAGE_PROMPT: &str = "Analyze this image and create an interactive simulation.";

/// Instructions given to the model on every request.
pub const SYSTEM_INSTRUCTION: &str = include_str!("system_instruction.txt");

/// Model parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub model: String,
    pub temperature: f32,
    pub system_instruction: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.4,
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

/// A language model that turns prompt parts into raw text.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(
        &self,
        settings: &GenerationSettings,
        parts: Vec<PromptPart>,
    ) -> RelayResult<String>;
}

/// Build the model prompt for a request.
///
/// An image becomes an inline part followed by the prompt text, or
/// [`DEFAULT_IMAGE_PROMPT`] when the prompt is blank.
pub fn build_parts(request: &GenerateRequest) -> RelayResult<Vec<PromptPart>> {
    let Some(image) = request.image_base64.as_deref().filter(|i| !i.is_empty()) else {
        return Ok(vec![PromptPart::Text(request.prompt.clone())]);
    };

    let (header, data) = image
        .split_once(',')
        .ok_or_else(|| RelayError::InvalidRequest("image is not a data URL".to_string()))?;
    let mime_type = header
        .split(';')
        .next()
        .and_then(|scheme| scheme.split_once(':'))
        .map(|(_, mime)| mime)
        .filter(|mime| !mime.is_empty())
        .ok_or_else(|| RelayError::InvalidRequest("image data URL has no media type".to_string()))?;

    let text = match request.prompt.trim() {
        "" => DEFAULT_IMAGE_PROMPT,
        prompt => prompt,
    };

    Ok(vec![
        PromptPart::InlineData(InlineData {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        }),
        PromptPart::Text(text.to_string()),
    ])
}

/// Remove a leading ```` ```html ```` or ```` ``` ```` fence and a trailing
/// ```` ``` ````.
pub fn strip_code_fences(raw: &str) -> String {
    let mut code = raw;
    if code.get(..7).is_some_and(|head| head.eq_ignore_ascii_case("```html")) {
        code = code[7..].trim_start();
    }
    if let Some(rest) = code.strip_prefix("```") {
        code = rest.trim_start();
    }
    code.strip_suffix("```").unwrap_or(code).to_string()
}

/// An HTTP reply produced by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReply {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: String,
}

impl RelayReply {
    fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
        Self {
            status,
            content_type: Some("application/json"),
            body,
        }
    }

    fn text(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            content_type: None,
            body: body.to_string(),
        }
    }
}

/// Handles relay requests against a [`ModelBackend`].
pub struct RelayHandler<B> {
    backend: B,
    settings: GenerationSettings,
}

impl<B: ModelBackend> RelayHandler<B> {
    pub fn new(backend: B) -> Self {
        Self::with_settings(backend, GenerationSettings::default())
    }

    pub fn with_settings(backend: B, settings: GenerationSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Handle one HTTP request. Never fails: errors become a `500` reply.
    pub async fn handle(&self, method: &Method, body: &[u8]) -> RelayReply {
        if method != Method::POST {
            return RelayReply::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }

        match self.generate(body).await {
            Ok(code) => RelayReply::json(StatusCode::OK, &GenerateResponse { code }),
            Err(err) => {
                log::error!("Function error: {}", err);
                let error = match err.to_string() {
                    message if message.is_empty() => "Something went wrong".to_string(),
                    message => message,
                };
                RelayReply::json(StatusCode::INTERNAL_SERVER_ERROR, &ErrorResponse { error })
            }
        }
    }

    async fn generate(&self, body: &[u8]) -> RelayResult<String> {
        let request: GenerateRequest = serde_json::from_slice(body)?;
        let parts = build_parts(&request)?;
        log::debug!(
            "Generating with {} ({} parts)",
            self.settings.model,
            parts.len()
        );
        let raw = self.backend.generate(&self.settings, parts).await?;
        Ok(strip_code_fences(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_only_parts() {
        let request = GenerateRequest {
            prompt: "Pythagoras".into(),
            image_base64: None,
        };
        assert_eq!(
            build_parts(&request).unwrap(),
            vec![PromptPart::Text("Pythagoras".into())]
        );
    }

    #[test]
    fn test_image_parts() {
        let request = GenerateRequest {
            prompt: "  ".into(),
            image_base64: Some("data:image/jpeg;base64,/9j/4AAQ".into()),
        };
        assert_eq!(
            build_parts(&request).unwrap(),
            vec![
                PromptPart::InlineData(InlineData {
                    mime_type: "image/jpeg".into(),
                    data: "/9j/4AAQ".into(),
                }),
                PromptPart::Text(DEFAULT_IMAGE_PROMPT.into()),
            ]
        );
    }

    #[test]
    fn test_image_prompt_is_trimmed() {
        let request = GenerateRequest {
            prompt: " find the area \n".into(),
            image_base64: Some("data:image/png;base64,AA==".into()),
        };
        let parts = build_parts(&request).unwrap();
        assert_eq!(parts[1], PromptPart::Text("find the area".into()));
    }

    #[test]
    fn test_malformed_image_rejected() {
        let request = GenerateRequest {
            prompt: String::new(),
            image_base64: Some("not-a-data-url".into()),
        };
        assert!(matches!(
            build_parts(&request),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_code_fences("```html\n<html></html>\n```"), "<html></html>\n");
        assert_eq!(strip_code_fences("```HTML <p>x</p>```"), "<p>x</p>");
        assert_eq!(strip_code_fences("```\n<svg/>```"), "<svg/>");
        assert_eq!(strip_code_fences("<html></html>"), "<html></html>");
        // Only a fence at the very end is removed.
        assert_eq!(strip_code_fences("<p>```</p>\n"), "<p>```</p>\n");
    }

    #[test]
    fn test_default_settings() {
        let settings = GenerationSettings::default();
        assert_eq!(settings.model, "gemini-2.0-flash");
        assert!((settings.temperature - 0.4).abs() < f32::EPSILON);
        assert!(settings.system_instruction.contains("Return ONLY the raw HTML code."));
    }
}
