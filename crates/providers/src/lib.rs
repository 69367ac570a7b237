pub mod anthropic;
pub mod client;
pub mod factory;
pub mod gemini;
pub mod manager;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use legion_core::types::{Completion, GenerationRequest, ProviderKind};
use legion_core::Result;

/// A language-model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    /// Cheap readiness check. Returning false makes the manager skip this backend.
    async fn is_available(&self) -> bool;
    async fn generate(&self, request: &GenerationRequest) -> Result<Completion>;
}

pub use anthropic::AnthropicProvider;
pub use factory::create_provider;
pub use gemini::GeminiProvider;
pub use manager::{ModelManager, ProviderStatus};
pub use ollama::OllamaProvider;
pub use openai::OpenAICompatProvider;
