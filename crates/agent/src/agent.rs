use async_trait::async_trait;
use legion_core::types::{AgentOutput, EnrichedContext, GenerationResult};
use legion_core::{Error, Result};
use legion_providers::ModelManager;
use legion_storage::{EventType, Journal};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::context_engine::language_for_path;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:\w+)?\n(.*?)\n```").expect("code fence regex is valid"));

/// Canonical agent ids.
pub mod ids {
    pub const CONTEXT: &str = "context";
    pub const FIXER: &str = "fixer_shell";
    pub const COMPLETION: &str = "completion";
    pub const REFACTOR: &str = "refactor";
    pub const TEST_GEN: &str = "test_gen";
    pub const REVIEW: &str = "review";
    pub const NARRATOR: &str = "narrator";
}

/// A unit of work in a chain. Instances live for one step of one request.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&mut self) -> Result<AgentOutput>;

    /// An output without an action or with empty text counts as a failed step.
    fn validate_result(&self, result: &AgentOutput) -> bool {
        !result.action.trim().is_empty() && !result.output.trim().is_empty()
    }

    async fn cleanup(&mut self) {}
}

/// Everything an agent is built from.
#[derive(Clone)]
pub struct AgentDeps {
    pub bus: Arc<MessageBus>,
    pub journal: Arc<Journal>,
    pub context: Arc<EnrichedContext>,
    pub models: Arc<ModelManager>,
    pub task: String,
    /// Output of the previous agent in the chain, if any.
    pub previous: Option<AgentOutput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentFileInfo {
    pub file_path: Option<String>,
    pub code: String,
    pub language: String,
}

impl AgentDeps {
    /// Retrieved code joined into one block for the model's context slot.
    pub fn context_block(&self) -> Option<String> {
        let mut parts: Vec<String> = self.context.related_code.clone();
        if let Some(prev) = &self.previous {
            parts.push(format!("Previous step ({}):\n{}", prev.action, prev.output));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Generate through the Model Manager with the configured defaults.
    pub async fn generate(&self, prompt: &str) -> Result<GenerationResult> {
        let defaults = self.models.defaults().clone();
        self.generate_with(prompt, defaults.max_tokens, defaults.temperature).await
    }

    pub async fn generate_with(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<GenerationResult> {
        let context = self.context_block();
        let result = self
            .models
            .generate(prompt, context.as_deref(), max_tokens, temperature)
            .await;
        match &result.error {
            Some(e) => Err(Error::Provider(e.clone())),
            None => Ok(result),
        }
    }

    pub fn publish_status(&self, agent: &str, status: &str, details: Value) {
        self.bus.publish_agent_status(agent, status, details);
    }

    /// Journal an `agent_activity` entry. Journal failures are logged, not returned.
    pub fn log_activity(&self, agent: &str, activity_type: &str, data: Value) {
        let payload = json!({
            "agent": agent,
            "activity_type": activity_type,
            "data": data,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.journal.log(EventType::AgentActivity, payload, Some(agent)) {
            warn!(agent = %agent, error = %e, "Failed to journal agent activity");
        }
    }

    pub fn preferences(&self) -> &HashMap<String, Value> {
        &self.context.preferences
    }

    pub fn current_file_info(&self) -> CurrentFileInfo {
        let file_path = self.context.current_file.clone();
        let language = file_path
            .as_deref()
            .map(language_for_path)
            .unwrap_or("unknown")
            .to_string();
        CurrentFileInfo {
            file_path,
            code: self.context.current_code.clone().unwrap_or_default(),
            language,
        }
    }
}

/// First fenced code block in a model response, or the whole response trimmed.
pub fn extract_code_from_response(response: &str) -> String {
    match CODE_FENCE.captures(response).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim().to_string(),
        None => response.trim().to_string(),
    }
}

pub fn format_code_block(code: &str, language: &str) -> String {
    let lang = if language == "unknown" { "" } else { language };
    format!("```{}\n{}\n```", lang, code)
}

pub type AgentFactory = Arc<dyn Fn(AgentDeps) -> Result<Box<dyn Agent>> + Send + Sync>;

struct Registration {
    description: String,
    factory: AgentFactory,
}

/// Explicit agent id → factory table.
#[derive(Default)]
pub struct AgentRegistry {
    entries: BTreeMap<String, Registration>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in agents.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_builtin(&mut registry);
        registry
    }

    /// Re-registering an id replaces the previous factory.
    pub fn register(&mut self, id: &str, description: &str, factory: AgentFactory) {
        debug!(agent = %id, "Registering agent");
        self.entries.insert(
            id.to_string(),
            Registration {
                description: description.to_string(),
                factory,
            },
        );
    }

    pub fn create(&self, id: &str, deps: AgentDeps) -> Result<Box<dyn Agent>> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| Error::AgentResolution(format!("No agent registered for '{}'", id)))?;
        (entry.factory)(deps).map_err(|e| match e {
            Error::AgentResolution(_) => e,
            other => Error::AgentResolution(format!("Failed to construct agent '{}': {}", id, other)),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn description(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|e| e.description.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Agent for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&mut self) -> Result<AgentOutput> {
            Ok(AgentOutput::new("echo", "hi"))
        }
    }

    #[test]
    fn test_extract_code_from_response() {
        let resp = "Here you go:\n```rust\nfn main() {}\n```\nand more\n```\nsecond\n```";
        assert_eq!(extract_code_from_response(resp), "fn main() {}");
        assert_eq!(extract_code_from_response("  plain text \n"), "plain text");
    }

    #[test]
    fn test_format_code_block() {
        assert_eq!(format_code_block("x = 1", "python"), "```python\nx = 1\n```");
        assert_eq!(format_code_block("x", "unknown"), "```\nx\n```");
    }

    #[test]
    fn test_default_validation() {
        let agent = Echo;
        assert!(agent.validate_result(&AgentOutput::new("echo", "hi")));
        assert!(!agent.validate_result(&AgentOutput::new("echo", "  ")));
        assert!(!agent.validate_result(&AgentOutput::new("", "hi")));
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = AgentRegistry::new();
        registry.register("echo", "Echoes", Arc::new(|_deps: AgentDeps| -> Result<Box<dyn Agent>> { Ok(Box::new(Echo)) }));
        assert!(registry.contains("echo"));
        assert_eq!(registry.description("echo"), Some("Echoes"));
        assert_eq!(registry.ids(), vec!["echo".to_string()]);

        let defaults = AgentRegistry::with_defaults();
        for id in [
            ids::CONTEXT,
            ids::FIXER,
            ids::COMPLETION,
            ids::REFACTOR,
            ids::TEST_GEN,
            ids::REVIEW,
            ids::NARRATOR,
        ] {
            assert!(defaults.contains(id), "missing {}", id);
        }
    }
}
