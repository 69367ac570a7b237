use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Everything the caller knows about the task besides its text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub current_file: Option<String>,
    #[serde(default)]
    pub current_code: Option<String>,
    #[serde(default)]
    pub preferences: HashMap<String, Value>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub extras: HashMap<String, Value>,
}

impl TaskContext {
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.current_file = Some(path.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.current_code = Some(code.into());
        self
    }

    pub fn with_preference(mut self, key: impl Into<String>, value: Value) -> Self {
        self.preferences.insert(key.into(), value);
        self
    }

    /// A preference counts as set when it is `true`, a non-zero number or a non-empty string.
    pub fn preference_enabled(&self, key: &str) -> bool {
        preference_truthy(&self.preferences, key)
    }
}

pub(crate) fn preference_truthy(prefs: &HashMap<String, Value>, key: &str) -> bool {
    match prefs.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty() && s != "false" && s != "0",
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Cloud,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Cloud => write!(f, "cloud"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// What a single provider returns on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: None,
            max_tokens: 1000,
            temperature: 0.7,
        }
    }

    /// Prompt with the optional context block prepended, for backends without a system slot.
    pub fn full_prompt(&self) -> String {
        match &self.context {
            Some(ctx) if !ctx.is_empty() => format!("Context:\n{}\n\nTask:\n{}", ctx, self.prompt),
            _ => self.prompt.clone(),
        }
    }
}

/// Outcome of a Model Manager call. `provider` is always the backend that produced `text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub finish_reason: Option<String>,
    pub provider: String,
    /// Seconds.
    pub response_time: f64,
    pub fallback_used: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerationResult {
    pub fn from_completion(completion: Completion, provider: &str, response_time: f64, fallback_used: bool) -> Self {
        Self {
            text: completion.text,
            usage: completion.usage,
            finish_reason: completion.finish_reason,
            provider: provider.to_string(),
            response_time,
            fallback_used,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            usage: Usage::default(),
            finish_reason: None,
            provider: "none".to_string(),
            response_time: 0.0,
            fallback_used: false,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Function,
    Class,
    Block,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Class => "class",
            ChunkKind::Block => "block",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "function" => ChunkKind::Function,
            "class" => ChunkKind::Class,
            _ => ChunkKind::Block,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    pub content: String,
    /// Relative to the project root.
    pub file_path: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: ChunkKind,
    pub language: String,
    #[serde(default)]
    pub relevance: f32,
}

impl ContextChunk {
    pub fn id(&self) -> String {
        format!("{}_{}", self.file_path, self.chunk_index)
    }
}

/// Context handed to the planner and to every agent in the chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichedContext {
    pub chunks: Vec<ContextChunk>,
    pub related_code: Vec<String>,
    pub related_files: Vec<String>,
    pub search_query: String,
    /// Set when retrieval was unavailable and only the current code is included.
    pub fallback_mode: bool,
    pub current_file: Option<String>,
    pub current_code: Option<String>,
    pub preferences: HashMap<String, Value>,
    pub extras: HashMap<String, Value>,
}

impl EnrichedContext {
    /// Carry the request's own fields over; retrieval results are filled in separately.
    pub fn from_task(ctx: &TaskContext) -> Self {
        Self {
            current_file: ctx.current_file.clone(),
            current_code: ctx.current_code.clone(),
            preferences: ctx.preferences.clone(),
            extras: ctx.extras.clone(),
            ..Default::default()
        }
    }

    pub fn preference_enabled(&self, key: &str) -> bool {
        preference_truthy(&self.preferences, key)
    }

    pub fn code_len(&self) -> usize {
        self.current_code.as_deref().map(|c| c.chars().count()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOutput {
    pub action: String,
    pub output: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentOutput {
    pub fn new(action: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            output: output.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}
