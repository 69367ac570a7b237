use async_trait::async_trait;
use legion_core::types::{Completion, GenerationRequest, ProviderKind, Usage};
use legion_core::{Error, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, preview, trim_base};
use crate::Provider;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-pro";

pub struct GeminiProvider {
    client: Client,
    api_key: Option<String>,
    api_base: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(
        api_key: Option<String>,
        api_base: Option<&str>,
        model: Option<&str>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            client: build_http_client(timeout.unwrap_or(Duration::from_secs(30))),
            api_key: api_key.filter(|k| !k.is_empty()),
            api_base: trim_base(api_base.unwrap_or(GEMINI_API_BASE)),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        }
    }

    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("gemini/").unwrap_or(model)
    }

    fn parse_response(raw_body: &str) -> Result<Completion> {
        let resp: GeminiResponse = serde_json::from_str(raw_body).map_err(|e| {
            Error::Provider(format!(
                "Failed to parse Gemini response: {}. Body: {}",
                e,
                preview(raw_body, 500)
            ))
        })?;
        let candidate = resp
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No candidates in Gemini response".to_string()))?;
        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let usage = resp
            .usage_metadata
            .map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            })
            .unwrap_or_default();
        Ok(Completion {
            text,
            usage,
            finish_reason: Some(candidate.finish_reason.unwrap_or_else(|| "stop".to_string())),
        })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "google"
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
            .ok_or_else(|| Error::Provider("Google API key not configured".to_string()))?;
        let model = Self::normalize_model(&self.model);
        let url = format!("{}/models/{}:generateContent", self.api_base, model);

        let body = serde_json::json!({
            "contents": [{"parts": [{"text": request.full_prompt()}]}],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            }
        });

        info!(model = %model, "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Gemini request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(status = %status, body = %preview(&raw_body, 500), "Gemini API error");
            return Err(Error::Provider(format!(
                "Gemini API error {}: {}",
                status,
                preview(&raw_body, 500)
            )));
        }

        debug!(body_len = raw_body.len(), "Gemini raw response");
        Self::parse_response(&raw_body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}
