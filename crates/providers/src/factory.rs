use legion_core::config::ProviderConfig;
use std::sync::Arc;
use std::time::Duration;

use crate::{AnthropicProvider, GeminiProvider, OllamaProvider, OpenAICompatProvider, Provider};

/// Default api_base for OpenAI-compatible backends, including the `/v1` segment.
fn default_api_base(provider_name: &str) -> &'static str {
    match provider_name {
        "lmstudio" => "http://localhost:1234/v1",
        "gpt4all" => "http://localhost:4891/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "together" => "https://api.together.xyz/v1",
        _ => "https://api.openai.com/v1",
    }
}

fn default_model(provider_name: &str) -> &'static str {
    match provider_name {
        "lmstudio" => "local-model",
        "gpt4all" => "gpt4all-model",
        "openrouter" => "anthropic/claude-3-haiku",
        "together" => "togethercomputer/llama-2-70b-chat",
        _ => "gpt-3.5-turbo",
    }
}

/// Build the provider registered under `name` from its config entry.
///
/// Cloud keys left empty in config are read from the provider's environment variable.
pub fn create_provider(name: &str, cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn Provider>> {
    let timeout = cfg.timeout_secs.map(Duration::from_secs);
    let api_base = cfg.api_base.as_deref();
    let model = cfg.model.as_deref();

    let provider: Arc<dyn Provider> = match name {
        "ollama" => Arc::new(OllamaProvider::new(api_base, model, timeout)),
        "lmstudio" | "gpt4all" => Arc::new(OpenAICompatProvider::local(
            name,
            api_base.unwrap_or(default_api_base(name)),
            model.unwrap_or(default_model(name)),
            timeout,
        )),
        "openai" | "openrouter" | "together" => Arc::new(OpenAICompatProvider::cloud(
            name,
            cfg.resolved_api_key(name),
            api_base.unwrap_or(default_api_base(name)),
            model.unwrap_or(default_model(name)),
            timeout,
        )),
        "anthropic" => Arc::new(AnthropicProvider::new(
            cfg.resolved_api_key(name),
            api_base,
            model,
            timeout,
        )),
        "google" | "gemini" => Arc::new(GeminiProvider::new(
            cfg.resolved_api_key(name),
            api_base,
            model,
            timeout,
        )),
        other => return Err(anyhow::anyhow!("Unknown model provider '{}'", other)),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use legion_core::ProviderKind;

    #[test]
    fn test_known_providers() {
        let cfg = ProviderConfig::default();
        for name in ["ollama", "lmstudio", "gpt4all", "openai", "anthropic", "google", "openrouter", "together"] {
            let p = create_provider(name, &cfg).unwrap();
            assert_eq!(p.name(), name);
        }
        assert_eq!(create_provider("gpt4all", &cfg).unwrap().kind(), ProviderKind::Local);
        assert_eq!(create_provider("together", &cfg).unwrap().kind(), ProviderKind::Cloud);
    }

    #[test]
    fn test_unknown_provider() {
        let err = create_provider("mystery", &ProviderConfig::default()).err().unwrap();
        assert!(err.to_string().contains("mystery"));
    }
}
