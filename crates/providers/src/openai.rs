use async_trait::async_trait;
use legion_core::types::{Completion, GenerationRequest, ProviderKind, Usage};
use legion_core::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, preview, trim_base, PROBE_TIMEOUT};
use crate::Provider;

/// Any server speaking the OpenAI chat-completions protocol.
///
/// Local servers (LM Studio, GPT4All) are available when `GET /models` answers.
/// Cloud services (OpenAI, OpenRouter, Together) are available when an API key is configured.
pub struct OpenAICompatProvider {
    name: String,
    kind: ProviderKind,
    client: Client,
    probe: Client,
    api_key: Option<String>,
    api_base: String,
    model: String,
}

impl OpenAICompatProvider {
    pub fn local(name: &str, api_base: &str, model: &str, timeout: Option<Duration>) -> Self {
        Self {
            name: name.to_string(),
            kind: ProviderKind::Local,
            client: build_http_client(timeout.unwrap_or(Duration::from_secs(120))),
            probe: build_http_client(PROBE_TIMEOUT),
            api_key: None,
            api_base: trim_base(api_base),
            model: model.to_string(),
        }
    }

    pub fn cloud(
        name: &str,
        api_key: Option<String>,
        api_base: &str,
        model: &str,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind: ProviderKind::Cloud,
            client: build_http_client(timeout.unwrap_or(Duration::from_secs(30))),
            probe: build_http_client(PROBE_TIMEOUT),
            api_key: api_key.filter(|k| !k.is_empty()),
            api_base: trim_base(api_base),
            model: model.to_string(),
        }
    }

    fn build_request(&self, request: &GenerationRequest) -> ChatRequest {
        let mut messages = Vec::new();
        if let Some(ctx) = request.context.as_deref().filter(|c| !c.is_empty()) {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: ctx.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });
        ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }

    fn parse_response(raw_body: &str) -> Result<Completion> {
        let resp: ChatResponse = serde_json::from_str(raw_body).map_err(|e| {
            Error::Provider(format!(
                "Failed to parse response: {}. Body: {}",
                e,
                preview(raw_body, 500)
            ))
        })?;
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No choices in response".to_string()))?;
        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            usage: resp.usage.unwrap_or_default(),
            finish_reason: choice.finish_reason,
        })
    }
}

#[async_trait]
impl Provider for OpenAICompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn is_available(&self) -> bool {
        match self.kind {
            ProviderKind::Cloud => self.api_key.is_some(),
            ProviderKind::Local => {
                let url = format!("{}/models", self.api_base);
                match self.probe.get(&url).send().await {
                    Ok(resp) => resp.status().is_success(),
                    Err(e) => {
                        debug!(provider = %self.name, error = %e, "Local server not reachable");
                        false
                    }
                }
            }
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_request(request);

        info!(provider = %self.name, url = %url, model = %self.model, "Calling LLM");

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::Provider(format!("{} request failed: {}", self.name, e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(provider = %self.name, status = %status, body = %preview(&raw_body, 500), "LLM API error");
            return Err(Error::Provider(format!(
                "{} API error {}: {}",
                self.name,
                status,
                preview(&raw_body, 500)
            )));
        }

        debug!(provider = %self.name, body_len = raw_body.len(), "LLM raw response");
        Self::parse_response(&raw_body)
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let json = r#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "done"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }"#;
        let c = OpenAICompatProvider::parse_response(json).unwrap();
        assert_eq!(c.text, "done");
        assert_eq!(c.usage.total_tokens, 4);
        assert_eq!(c.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_no_choices_is_error() {
        let err = OpenAICompatProvider::parse_response(r#"{"choices": []}"#).unwrap_err();
        assert!(err.to_string().contains("No choices"));
    }

    #[test]
    fn test_context_becomes_system_message() {
        let p = OpenAICompatProvider::local("lmstudio", "http://localhost:1234/v1/", "local-model", None);
        let mut req = GenerationRequest::new("write a test");
        req.context = Some("fn f() {}".into());
        let body = p.build_request(&req);
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(p.api_base, "http://localhost:1234/v1");
    }

    #[tokio::test]
    async fn test_cloud_availability_follows_key() {
        let without = OpenAICompatProvider::cloud("openai", Some(String::new()), "https://api.openai.com/v1", "gpt-3.5-turbo", None);
        assert!(!without.is_available().await);
        let with = OpenAICompatProvider::cloud("openai", Some("sk-x".into()), "https://api.openai.com/v1", "gpt-3.5-turbo", None);
        assert!(with.is_available().await);
        assert_eq!(with.kind(), ProviderKind::Cloud);
    }
}
