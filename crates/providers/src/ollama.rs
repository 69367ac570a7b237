use async_trait::async_trait;
use legion_core::types::{Completion, GenerationRequest, ProviderKind, Usage};
use legion_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, preview, trim_base, PROBE_TIMEOUT};
use crate::Provider;

const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "llama2";

pub struct OllamaProvider {
    client: Client,
    probe: Client,
    api_base: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(api_base: Option<&str>, model: Option<&str>, timeout: Option<Duration>) -> Self {
        // local inference is slow, so the request timeout is generous
        let timeout = timeout.unwrap_or(Duration::from_secs(300));
        Self {
            client: build_http_client(timeout),
            probe: build_http_client(PROBE_TIMEOUT),
            api_base: trim_base(api_base.unwrap_or(DEFAULT_OLLAMA_BASE)),
            model: model.unwrap_or(DEFAULT_OLLAMA_MODEL).to_string(),
        }
    }

    /// Config may store "ollama/llama3" but the API expects "llama3".
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("ollama/").unwrap_or(model)
    }

    fn parse_response(raw_body: &str) -> Result<Completion> {
        let resp: OllamaGenerateResponse = serde_json::from_str(raw_body).map_err(|e| {
            Error::Provider(format!(
                "Failed to parse Ollama response: {}. Body: {}",
                e,
                preview(raw_body, 500)
            ))
        })?;
        let prompt_tokens = resp.prompt_eval_count.unwrap_or(0);
        let completion_tokens = resp.eval_count.unwrap_or(0);
        let finish_reason = if resp.done.unwrap_or(true) { "stop" } else { "length" };
        Ok(Completion {
            text: resp.response,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            finish_reason: Some(finish_reason.to_string()),
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.api_base);
        match self.probe.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, url = %url, "Ollama not reachable");
                false
            }
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Completion> {
        let url = format!("{}/api/generate", self.api_base);
        let model = Self::normalize_model(&self.model);

        let mut body = serde_json::json!({
            "model": model,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        });
        if let Some(ctx) = request.context.as_deref().filter(|c| !c.is_empty()) {
            body["system"] = serde_json::Value::String(ctx.to_string());
        }

        info!(url = %url, model = %model, "Calling Ollama API");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Ollama request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(status = %status, body = %preview(&raw_body, 500), "Ollama API error");
            return Err(Error::Provider(format!(
                "Ollama API error {}: {}",
                status,
                preview(&raw_body, 500)
            )));
        }

        debug!(body_len = raw_body.len(), "Ollama raw response");
        Self::parse_response(&raw_body)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(OllamaProvider::normalize_model("ollama/llama3"), "llama3");
        assert_eq!(OllamaProvider::normalize_model("qwen2.5:7b"), "qwen2.5:7b");
    }

    #[test]
    fn test_parse_response() {
        let json = r#"{
            "model": "llama2",
            "response": "fn add(a: i32, b: i32) -> i32 { a + b }",
            "done": true,
            "prompt_eval_count": 50,
            "eval_count": 20
        }"#;
        let c = OllamaProvider::parse_response(json).unwrap();
        assert!(c.text.starts_with("fn add"));
        assert_eq!(c.usage.total_tokens, 70);
        assert_eq!(c.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_garbage_is_provider_error() {
        let err = OllamaProvider::parse_response("<html>").unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        let p = OllamaProvider::new(Some("http://127.0.0.1:9"), None, None);
        assert!(!p.is_available().await);
        assert_eq!(p.kind(), ProviderKind::Local);
    }
}
