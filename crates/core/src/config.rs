use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Empty means "read the provider's conventional environment variable".
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            api_base: None,
            model: None,
            timeout_secs: None,
        }
    }
}

impl ProviderConfig {
    /// The configured key, or the provider's environment variable when the config leaves it empty.
    pub fn resolved_api_key(&self, provider: &str) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        let var = api_key_env_var(provider)?;
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

pub fn api_key_env_var(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "google" | "gemini" => Some("GOOGLE_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        _ => None,
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationDefaults {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalConfig {
    /// Number of trailing entries `system_health` looks at.
    #[serde(default = "default_health_window")]
    pub health_window: usize,
    #[serde(default = "default_rollback_candidates")]
    pub rollback_candidates: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// fsync after every append. Turning this off keeps flush-only durability.
    #[serde(default = "default_true")]
    pub sync_writes: bool,
}

fn default_health_window() -> usize {
    100
}

fn default_rollback_candidates() -> usize {
    10
}

fn default_retention_days() -> u32 {
    30
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            health_window: default_health_window(),
            rollback_candidates: default_rollback_candidates(),
            retention_days: default_retention_days(),
            sync_writes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Per-subscriber queue depth before messages are dropped for that subscriber.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

fn default_history_cap() -> usize {
    1000
}

fn default_subscriber_queue() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Characters of the current code folded into the retrieval query.
    #[serde(default = "default_query_code_prefix")]
    pub query_code_prefix: usize,
    /// Characters of the current code kept when retrieval is degraded.
    #[serde(default = "default_fallback_code_chars")]
    pub fallback_code_chars: usize,
    /// Chunks from the file being edited are kept only when at least this close.
    #[serde(default = "default_current_file_max_distance")]
    pub current_file_max_distance: f32,
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
}

fn default_top_k() -> usize {
    5
}

fn default_query_code_prefix() -> usize {
    500
}

fn default_fallback_code_chars() -> usize {
    1000
}

fn default_current_file_max_distance() -> f32 {
    0.3
}

fn default_embedding_dims() -> usize {
    256
}

fn default_extensions() -> Vec<String> {
    [
        "py", "js", "ts", "java", "cpp", "c", "cs", "php", "rb", "go", "rs", "swift", "kt",
        "scala", "clj", "hs", "ml", "fs", "elm", "dart", "lua", "r", "sh", "bash", "ps1", "sql",
        "html", "css", "scss", "xml", "json", "yaml", "yml", "toml", "md",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_dirs() -> Vec<String> {
    [
        ".git", "__pycache__", "node_modules", ".legion", "build", "dist", ".next", ".nuxt",
        "target", "bin", "obj",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            query_code_prefix: default_query_code_prefix(),
            fallback_code_chars: default_fallback_code_chars(),
            current_file_max_distance: default_current_file_max_distance(),
            embedding_dims: default_embedding_dims(),
            extensions: default_extensions(),
            exclude_dirs: default_exclude_dirs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_snapshot_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
}

fn default_snapshot_timeout() -> u64 {
    30
}

fn default_label_prefix() -> String {
    "legion-auto-stash".to_string()
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_snapshot_timeout(),
            label_prefix: default_label_prefix(),
        }
    }
}

/// Local backends first, paid/rate-limited cloud backends after.
pub fn default_model_priorities() -> Vec<String> {
    [
        "ollama", "lmstudio", "gpt4all", "openai", "anthropic", "google", "openrouter",
        "together",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default = "default_model_priorities")]
    pub model_priorities: Vec<String>,
    #[serde(default)]
    pub generation: GenerationDefaults,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert("ollama".to_string(), ProviderConfig {
            api_base: Some("http://localhost:11434".to_string()),
            model: Some("llama2".to_string()),
            ..Default::default()
        });
        providers.insert("lmstudio".to_string(), ProviderConfig {
            api_base: Some("http://localhost:1234/v1".to_string()),
            model: Some("local-model".to_string()),
            ..Default::default()
        });
        providers.insert("gpt4all".to_string(), ProviderConfig {
            api_base: Some("http://localhost:4891/v1".to_string()),
            model: Some("gpt4all-model".to_string()),
            ..Default::default()
        });
        providers.insert("openai".to_string(), ProviderConfig {
            model: Some("gpt-3.5-turbo".to_string()),
            ..Default::default()
        });
        providers.insert("anthropic".to_string(), ProviderConfig {
            model: Some("claude-3-sonnet-20240229".to_string()),
            ..Default::default()
        });
        providers.insert("google".to_string(), ProviderConfig {
            model: Some("gemini-pro".to_string()),
            ..Default::default()
        });
        providers.insert("openrouter".to_string(), ProviderConfig {
            api_base: Some("https://openrouter.ai/api/v1".to_string()),
            model: Some("anthropic/claude-3-haiku".to_string()),
            ..Default::default()
        });
        providers.insert("together".to_string(), ProviderConfig {
            api_base: Some("https://api.together.xyz/v1".to_string()),
            model: Some("togethercomputer/llama-2-70b-chat".to_string()),
            ..Default::default()
        });

        Self {
            providers,
            model_priorities: default_model_priorities(),
            generation: GenerationDefaults::default(),
            journal: JournalConfig::default(),
            bus: BusConfig::default(),
            context: ContextConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Project config, then the user-level config, then built-in defaults.
    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let project = paths.config_file();
        if project.exists() {
            return Self::load(&project);
        }
        if let Some(user) = Paths::user_config_file() {
            if user.exists() {
                return Self::load(&user);
            }
        }
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}
