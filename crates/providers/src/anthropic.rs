use async_trait::async_trait;
use legion_core::types::{Completion, GenerationRequest, ProviderKind, Usage};
use legion_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, preview, trim_base};
use crate::Provider;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-sonnet-20240229";

pub struct AnthropicProvider {
    client: Client,
    api_key: Option<String>,
    api_base: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(
        api_key: Option<String>,
        api_base: Option<&str>,
        model: Option<&str>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            client: build_http_client(timeout.unwrap_or(Duration::from_secs(30))),
            api_key: api_key.filter(|k| !k.is_empty()),
            api_base: trim_base(api_base.unwrap_or(ANTHROPIC_API_BASE)),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        }
    }

    /// "anthropic/claude-3-haiku" → "claude-3-haiku".
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("anthropic/").unwrap_or(model)
    }

    fn parse_response(raw_body: &str) -> Result<Completion> {
        let resp: AnthropicResponse = serde_json::from_str(raw_body).map_err(|e| {
            Error::Provider(format!(
                "Failed to parse Anthropic response: {}. Body: {}",
                e,
                preview(raw_body, 500)
            ))
        })?;

        let text = resp
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let usage = resp
            .usage
            .map(|u| Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            })
            .unwrap_or_default();

        Ok(Completion {
            text,
            usage,
            finish_reason: Some(resp.stop_reason.unwrap_or_else(|| "stop".to_string())),
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Completion> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Provider("Anthropic API key not configured".to_string()))?;
        let url = format!("{}/messages", self.api_base);
        let model = Self::normalize_model(&self.model);

        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(ctx) = request.context.as_deref().filter(|c| !c.is_empty()) {
            body["system"] = serde_json::Value::String(ctx.to_string());
        }

        info!(url = %url, model = %model, "Calling Anthropic API");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Anthropic request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(status = %status, body = %preview(&raw_body, 500), "Anthropic API error");
            return Err(Error::Provider(format!(
                "Anthropic API error {}: {}",
                status,
                preview(&raw_body, 500)
            )));
        }

        debug!(body_len = raw_body.len(), "Anthropic raw response");
        Self::parse_response(&raw_body)
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let json = r#"{
            "id": "msg_1",
            "type": "message",
            "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " world"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 2}
        }"#;
        let c = AnthropicProvider::parse_response(json).unwrap();
        assert_eq!(c.text, "Hello world");
        assert_eq!(c.usage.total_tokens, 12);
        assert_eq!(c.finish_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_normalize_model() {
        assert_eq!(AnthropicProvider::normalize_model("anthropic/claude-3-haiku"), "claude-3-haiku");
    }

    #[tokio::test]
    async fn test_generate_without_key_fails_fast() {
        let p = AnthropicProvider::new(None, None, None, None);
        assert!(!p.is_available().await);
        let err = p.generate(&GenerationRequest::new("hi")).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
