//! Built-in agents registered by [`AgentRegistry::with_defaults`].
//!
//! These are thin prompt wrappers so the default pipeline runs end to end. Real
//! analysis agents are expected to be registered by the embedding application.

use async_trait::async_trait;
use legion_core::types::AgentOutput;
use legion_core::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::agent::{extract_code_from_response, format_code_block, ids, Agent, AgentDeps, AgentRegistry};
use crate::orchestrator::VOICE_KEYS;

struct PromptSpec {
    id: &'static str,
    action: &'static str,
    description: &'static str,
    instruction: &'static str,
    /// Keep only the first fenced block of the response.
    emits_code: bool,
}

const PROMPT_AGENTS: &[PromptSpec] = &[
    PromptSpec {
        id: ids::FIXER,
        action: "error_fixing",
        description: "Diagnoses errors and proposes a fix",
        instruction: "Diagnose the error described below and return the corrected code.",
        emits_code: true,
    },
    PromptSpec {
        id: ids::COMPLETION,
        action: "complete_code",
        description: "Completes or writes code for the task",
        instruction: "Complete the code for the task below. Return only code.",
        emits_code: true,
    },
    PromptSpec {
        id: ids::REFACTOR,
        action: "refactor_code",
        description: "Restructures code without changing behavior",
        instruction: "Refactor the code below for clarity without changing its behavior. Return only code.",
        emits_code: true,
    },
    PromptSpec {
        id: ids::TEST_GEN,
        action: "generate_tests",
        description: "Writes unit tests for the current code",
        instruction: "Write unit tests for the code below. Return only code.",
        emits_code: true,
    },
    PromptSpec {
        id: ids::REVIEW,
        action: "code_review",
        description: "Reviews code for defects and style",
        instruction: "Review the code below. List concrete problems and suggested fixes.",
        emits_code: false,
    },
    PromptSpec {
        id: ids::NARRATOR,
        action: "voice_narration",
        description: "Explains the code or result in plain language",
        instruction: "Explain in plain language what the code below does.",
        emits_code: false,
    },
];

pub(crate) fn register_builtin(registry: &mut AgentRegistry) {
    registry.register(
        ids::CONTEXT,
        "Gathers related project code for the task",
        Arc::new(|deps: AgentDeps| -> Result<Box<dyn Agent>> { Ok(Box::new(ContextAgent::new(deps))) }),
    );
    for spec in PROMPT_AGENTS {
        registry.register(
            spec.id,
            spec.description,
            Arc::new(move |deps: AgentDeps| -> Result<Box<dyn Agent>> {
                Ok(Box::new(PromptAgent::new(spec, deps)))
            }),
        );
    }
}

/// Sends one instruction plus the task and current code to the Model Manager.
pub struct PromptAgent {
    id: &'static str,
    action: &'static str,
    instruction: &'static str,
    emits_code: bool,
    deps: AgentDeps,
}

impl PromptAgent {
    fn new(spec: &PromptSpec, deps: AgentDeps) -> Self {
        Self {
            id: spec.id,
            action: spec.action,
            instruction: spec.instruction,
            emits_code: spec.emits_code,
            deps,
        }
    }

    fn build_prompt(&self) -> String {
        let file = self.deps.current_file_info();
        let mut prompt = format!("{}\n\nTask: {}", self.instruction, self.deps.task);
        if let Some(path) = &file.file_path {
            prompt.push_str(&format!("\nFile: {}", path));
        }
        if !file.code.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&format_code_block(&file.code, &file.language));
        }
        prompt
    }
}

#[async_trait]
impl Agent for PromptAgent {
    fn name(&self) -> &str {
        self.id
    }

    async fn execute(&mut self) -> Result<AgentOutput> {
        self.deps.publish_status(self.id, "started", json!({ "task": self.deps.task }));
        let generation = self.deps.generate(&self.build_prompt()).await?;
        let output = if self.emits_code {
            extract_code_from_response(&generation.text)
        } else {
            generation.text.trim().to_string()
        };

        self.deps.log_activity(
            self.id,
            self.action,
            json!({
                "provider": generation.provider,
                "response_time": generation.response_time,
                "output_chars": output.len(),
            }),
        );
        self.deps.publish_status(self.id, "completed", json!({ "provider": generation.provider }));

        let mut result = AgentOutput::new(self.action, output)
            .with_meta("agent", json!(self.id))
            .with_meta("provider", json!(generation.provider))
            .with_meta("fallback_used", json!(generation.fallback_used))
            .with_meta("response_time", json!(generation.response_time))
            .with_meta("language", json!(self.deps.current_file_info().language));
        if self.id == ids::NARRATOR {
            result = result.with_meta("voice", json!(VOICE_KEYS.iter().any(|k| self.deps.context.preference_enabled(k))));
        }
        Ok(result)
    }
}

/// Summarizes what the Context Engine retrieved. Makes no model call.
pub struct ContextAgent {
    deps: AgentDeps,
}

impl ContextAgent {
    fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Agent for ContextAgent {
    fn name(&self) -> &str {
        ids::CONTEXT
    }

    async fn execute(&mut self) -> Result<AgentOutput> {
        let ctx = &self.deps.context;
        let mut summary = format!("Context for: {}", self.deps.task);
        if ctx.related_files.is_empty() {
            summary.push_str("\nNo related project files found.");
        } else {
            summary.push_str(&format!("\nRelated files: {}", ctx.related_files.join(", ")));
        }
        for chunk in &ctx.chunks {
            summary.push_str(&format!(
                "\n\n{}:{}-{} ({}, relevance {:.2})\n{}",
                chunk.file_path,
                chunk.start_line,
                chunk.end_line,
                chunk.kind.as_str(),
                chunk.relevance,
                chunk.content
            ));
        }
        debug!(chunks = ctx.chunks.len(), fallback = ctx.fallback_mode, "Context gathered");

        self.deps.log_activity(
            ids::CONTEXT,
            "gather_context",
            json!({ "chunks": ctx.chunks.len(), "files": ctx.related_files }),
        );

        Ok(AgentOutput::new("gather_context", summary)
            .with_meta("agent", json!(ids::CONTEXT))
            .with_meta("related_files", json!(ctx.related_files))
            .with_meta("chunk_count", json!(ctx.chunks.len()))
            .with_meta("fallback_mode", json!(ctx.fallback_mode)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use async_trait::async_trait;
    use legion_core::types::{Completion, EnrichedContext, GenerationRequest, ProviderKind, TaskContext};
    use legion_providers::{ModelManager, Provider};
    use legion_storage::{EventType, Journal};
    use tempfile::TempDir;

    struct Canned;

    #[async_trait]
    impl Provider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<Completion> {
            assert!(request.prompt.contains("Task: add a helper"));
            Ok(Completion {
                text: "Sure:\n```python\ndef helper():\n    return 1\n```".to_string(),
                ..Default::default()
            })
        }
    }

    fn deps(tmp: &TempDir, providers: Vec<Arc<dyn Provider>>) -> AgentDeps {
        let ctx = TaskContext::default().with_file("util.py").with_code("x = 1");
        AgentDeps {
            bus: Arc::new(MessageBus::default()),
            journal: Arc::new(Journal::open(&tmp.path().join("journal.jsonl")).unwrap()),
            context: Arc::new(EnrichedContext::from_task(&ctx)),
            models: Arc::new(ModelManager::new(providers)),
            task: "add a helper".to_string(),
            previous: None,
        }
    }

    #[tokio::test]
    async fn test_prompt_agent_extracts_code() {
        let tmp = TempDir::new().unwrap();
        let deps = deps(&tmp, vec![Arc::new(Canned)]);
        let journal = deps.journal.clone();
        let registry = AgentRegistry::with_defaults();

        let mut agent = registry.create(ids::COMPLETION, deps).unwrap();
        let out = agent.execute().await.unwrap();
        assert_eq!(out.action, "complete_code");
        assert_eq!(out.output, "def helper():\n    return 1");
        assert_eq!(out.metadata["provider"], json!("canned"));
        assert!(agent.validate_result(&out));
        assert_eq!(journal.entries(Some(&EventType::AgentActivity), Some(ids::COMPLETION), 10).len(), 1);
    }

    #[tokio::test]
    async fn test_prompt_agent_fails_without_providers() {
        let tmp = TempDir::new().unwrap();
        let mut agent = AgentRegistry::with_defaults()
            .create(ids::REVIEW, deps(&tmp, vec![]))
            .unwrap();
        assert!(agent.execute().await.is_err());
    }

    #[tokio::test]
    async fn test_context_agent_needs_no_model() {
        let tmp = TempDir::new().unwrap();
        let mut agent = AgentRegistry::with_defaults()
            .create(ids::CONTEXT, deps(&tmp, vec![]))
            .unwrap();
        let out = agent.execute().await.unwrap();
        assert_eq!(out.action, "gather_context");
        assert!(out.output.contains("add a helper"));
        assert_eq!(out.metadata["chunk_count"], json!(0));
    }
}
