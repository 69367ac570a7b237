use legion_core::types::EnrichedContext;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

use crate::agent::ids;

/// Ordered agent ids. Holds no duplicates; the first occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AgentChain(Vec<String>);

impl AgentChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `id` is already in the chain.
    pub fn push(&mut self, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        self.0.push(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|a| a == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.0.iter().position(|a| a == id)
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|a| keep(a));
    }
}

impl<S: AsRef<str>> FromIterator<S> for AgentChain {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut chain = AgentChain::new();
        for id in iter {
            chain.push(id.as_ref());
        }
        chain
    }
}

/// Turns a task into an agent chain. The coordinator only sees this trait.
pub trait Planner: Send + Sync {
    fn determine_agent_chain(&self, task: &str, context: &EnrichedContext) -> AgentChain;
}

/// One source of agent suggestions.
pub trait ChainStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn propose(&self, task: &str, context: &EnrichedContext) -> Vec<String>;
}

struct AgentProfile {
    id: &'static str,
    priority: u32,
    stage: u32,
    description: &'static str,
    keywords: Regex,
}

fn rx(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){}", pattern)).expect("planner regex is valid")
}

static PROFILES: Lazy<Vec<AgentProfile>> = Lazy::new(|| {
    vec![
        AgentProfile {
            id: ids::CONTEXT,
            priority: 10,
            stage: 1,
            description: "Gathers related project code",
            keywords: rx(r"\b(context|related|where|find|search|locate|usages?)\b"),
        },
        AgentProfile {
            id: ids::FIXER,
            priority: 9,
            stage: 2,
            description: "Diagnoses and fixes errors",
            keywords: rx(
                r"\b(fix(es)?|bugs?|errors?|exceptions?|crash(es)?|debug|traceback|null pointer|segfault|broken|fail(s|ing|ure)?)\b",
            ),
        },
        AgentProfile {
            id: ids::COMPLETION,
            priority: 8,
            stage: 3,
            description: "Completes or writes code",
            keywords: rx(r"\b(complete|completion|implement|write|add|create|finish|generate)\b"),
        },
        AgentProfile {
            id: ids::REFACTOR,
            priority: 7,
            stage: 4,
            description: "Restructures code without changing behavior",
            keywords: rx(r"\b(refactor|restructure|clean ?up|simplify|rename|extract|reorganize|optimi[sz]e)\b"),
        },
        AgentProfile {
            id: ids::TEST_GEN,
            priority: 6,
            stage: 5,
            description: "Generates unit tests",
            keywords: rx(r"\b(tests?|testing|coverage|assert(ions?)?)\b"),
        },
        AgentProfile {
            id: ids::REVIEW,
            priority: 5,
            stage: 6,
            description: "Reviews code quality",
            keywords: rx(r"\b(review|audit|check|quality|lint|smells?|best practices?)\b"),
        },
        AgentProfile {
            id: ids::NARRATOR,
            priority: 3,
            stage: 7,
            description: "Explains code in plain language",
            keywords: rx(r"\b(explain|describe|narrate|summari[sz]e|document(ation)?|what does)\b"),
        },
    ]
});

const UNKNOWN_STAGE: u32 = 99;

/// Agents that change code.
const MUTATING: &[&str] = &[ids::FIXER, ids::COMPLETION, ids::REFACTOR, ids::TEST_GEN];
/// A valid chain needs at least one of these.
const PRIMARY: &[&str] = &[ids::COMPLETION, ids::REFACTOR, ids::FIXER];
pub(crate) const VOICE_KEYS: &[&str] = &["voice", "voice_enabled"];
const STRICT_KEYS: &[&str] = &["strict", "strict_mode"];

const TESTABLE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "java", "cpp", "cc", "c", "cs", "go", "rs", "rb", "kt", "swift", "php",
];

const CONFIG_EXTENSIONS: &[&str] = &["json", "yaml", "yml", "toml", "ini", "cfg", "conf", "env"];

fn profile(id: &str) -> Option<&'static AgentProfile> {
    PROFILES.iter().find(|p| p.id == id)
}

fn stage_of(id: &str) -> u32 {
    profile(id).map_or(UNKNOWN_STAGE, |p| p.stage)
}

fn word_count(task: &str) -> usize {
    task.split_whitespace().count()
}

fn file_extension(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

struct Template {
    name: &'static str,
    pattern: Regex,
    agents: &'static [&'static str],
}

static TEMPLATES: Lazy<Vec<Template>> = Lazy::new(|| {
    vec![
        Template {
            name: "completion",
            pattern: rx(r"\b(complete|finish|autocomplete|implement|fill in)\b"),
            agents: &[ids::CONTEXT, ids::COMPLETION, ids::REVIEW],
        },
        Template {
            name: "refactoring",
            pattern: rx(r"\b(refactor(ing)?|restructure|clean ?up|simplify|reorganize)\b"),
            agents: &[ids::CONTEXT, ids::REFACTOR, ids::TEST_GEN, ids::REVIEW],
        },
        Template {
            name: "debugging",
            pattern: rx(r"\b(debug(ging)?|fix|bugs?|errors?|exceptions?|crash(es)?|null pointer|traceback|stack trace)\b"),
            agents: &[ids::CONTEXT, ids::FIXER, ids::COMPLETION],
        },
        Template {
            name: "testing",
            pattern: rx(r"\b(unit tests?|tests?|testing|test cases?|coverage)\b"),
            agents: &[ids::CONTEXT, ids::TEST_GEN, ids::REVIEW],
        },
        Template {
            name: "documentation",
            pattern: rx(r"\b(document(ation)?|docstrings?|comments?|readme)\b"),
            agents: &[ids::CONTEXT, ids::NARRATOR],
        },
        Template {
            name: "review",
            pattern: rx(r"\b(review|audit|code quality|critique)\b"),
            agents: &[ids::CONTEXT, ids::REVIEW, ids::NARRATOR],
        },
        Template {
            name: "exploration",
            pattern: rx(r"\b(explain|explore|understand|walk me through|how does|what does)\b"),
            agents: &[ids::CONTEXT, ids::NARRATOR],
        },
    ]
});

static EXPLAIN: Lazy<Regex> = Lazy::new(|| rx(r"\b(explain|describe)\b"));
static MODIFIES: Lazy<Regex> =
    Lazy::new(|| rx(r"\b(refactor|rewrite|modify|change|update|fix|implement|add|write)\b"));
static TEST_FILE: Lazy<Regex> = Lazy::new(|| rx(r"(^|[/\\_.])(test|tests|spec)([/\\_.]|$)|^test"));

/// Picks the canonical template with the most keyword hits.
pub struct TemplateMatcher;

impl TemplateMatcher {
    /// Ties go to declaration order.
    pub fn matching_template(&self, task: &str) -> Option<&'static str> {
        let mut best: Option<(&Template, usize)> = None;
        for template in TEMPLATES.iter() {
            let hits = template.pattern.find_iter(task).count();
            if hits > 0 && best.map_or(true, |(_, h)| hits > h) {
                best = Some((template, hits));
            }
        }
        best.map(|(t, _)| t.name)
    }
}

impl ChainStrategy for TemplateMatcher {
    fn name(&self) -> &'static str {
        "template"
    }

    fn propose(&self, task: &str, _context: &EnrichedContext) -> Vec<String> {
        self.matching_template(task)
            .and_then(|name| TEMPLATES.iter().find(|t| t.name == name))
            .map(|t| t.agents.iter().map(|a| a.to_string()).collect())
            .unwrap_or_default()
    }
}

/// Scores agents by keyword hits times priority, then adds utility agents.
pub struct KeywordScorer;

impl ChainStrategy for KeywordScorer {
    fn name(&self) -> &'static str {
        "keyword"
    }

    fn propose(&self, task: &str, _context: &EnrichedContext) -> Vec<String> {
        let mut scored: Vec<(&str, u32)> = PROFILES
            .iter()
            .map(|p| (p.id, p.keywords.find_iter(task).count() as u32 * p.priority))
            .filter(|(_, score)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        let mut agents: Vec<String> = scored.into_iter().map(|(id, _)| id.to_string()).collect();
        if word_count(task) > 3 {
            agents.push(ids::CONTEXT.to_string());
        }
        if EXPLAIN.is_match(task) {
            agents.push(ids::NARRATOR.to_string());
        }
        if MODIFIES.is_match(task) {
            agents.push(ids::REVIEW.to_string());
        }
        agents
    }
}

/// Agents implied by the current file and the user's preferences.
pub struct ContextHeuristics;

impl ChainStrategy for ContextHeuristics {
    fn name(&self) -> &'static str {
        "context"
    }

    fn propose(&self, _task: &str, context: &EnrichedContext) -> Vec<String> {
        let mut agents = Vec::new();
        if let Some(file) = context.current_file.as_deref() {
            let name = Path::new(file)
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if TEST_FILE.is_match(&file.to_lowercase()) {
                agents.push(ids::TEST_GEN.to_string());
            }
            let is_config = name.contains("config")
                || file_extension(file).map_or(false, |e| CONFIG_EXTENSIONS.contains(&e.as_str()));
            if is_config {
                agents.push(ids::REVIEW.to_string());
            }
        }
        if VOICE_KEYS.iter().any(|k| context.preference_enabled(k)) {
            agents.push(ids::NARRATOR.to_string());
        }
        if STRICT_KEYS.iter().any(|k| context.preference_enabled(k)) {
            agents.push(ids::REVIEW.to_string());
        }
        if context.code_len() > 0 {
            agents.push(ids::CONTEXT.to_string());
        }
        agents
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub description: String,
    pub priority: u32,
    pub stage: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainValidation {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub chain_length: usize,
}

/// Default planner: template match, else keyword scoring, plus context heuristics.
pub struct Orchestrator {
    template: TemplateMatcher,
    keyword: KeywordScorer,
    heuristics: ContextHeuristics,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            template: TemplateMatcher,
            keyword: KeywordScorer,
            heuristics: ContextHeuristics,
        }
    }

    fn optimize(&self, chain: &mut AgentChain, context: &EnrichedContext) {
        if context.code_len() < 50 && chain.len() > 2 {
            chain.retain(|a| a != ids::REVIEW);
        }

        let untestable = context
            .current_file
            .as_deref()
            .map(|f| file_extension(f).map_or(true, |e| !TESTABLE_EXTENSIONS.contains(&e.as_str())))
            .unwrap_or(false);
        if untestable {
            chain.retain(|a| a != ids::TEST_GEN);
        }

        // a single context agent, at the front
        if chain.position(ids::CONTEXT).map_or(false, |p| p > 0) {
            chain.retain(|a| a != ids::CONTEXT);
            chain.0.insert(0, ids::CONTEXT.to_string());
        }
    }

    /// Checks structure only; the chain is never modified.
    pub fn validate_chain(&self, chain: &[String]) -> ChainValidation {
        let mut report = ChainValidation {
            chain_length: chain.len(),
            ..Default::default()
        };
        if chain.is_empty() {
            report.issues.push("Agent chain is empty".to_string());
        }

        let mut seen = Vec::new();
        for id in chain {
            if seen.contains(&id) {
                report.issues.push(format!("Duplicate agent: {}", id));
            } else {
                seen.push(id);
            }
            if profile(id).is_none() {
                report.warnings.push(format!("Unknown agent: {}", id));
            }
        }

        if !chain.is_empty() && !chain.iter().any(|a| PRIMARY.contains(&a.as_str())) {
            report.issues.push("Missing primary action agent".to_string());
        }

        if let Some(review) = chain.iter().position(|a| a == ids::REVIEW) {
            if let Some(later) = chain[review + 1..].iter().find(|a| MUTATING.contains(&a.as_str())) {
                report
                    .warnings
                    .push(format!("Review agent runs before code-modifying agent {}", later));
            }
        }

        report.valid = report.issues.is_empty();
        report
    }

    pub fn agent_info(&self, id: &str) -> Option<AgentInfo> {
        profile(id).map(|p| AgentInfo {
            id: p.id.to_string(),
            description: p.description.to_string(),
            priority: p.priority,
            stage: p.stage,
        })
    }

    pub fn available_agents(&self) -> Vec<AgentInfo> {
        PROFILES.iter().filter_map(|p| self.agent_info(p.id)).collect()
    }

    /// Numbered, human-readable description of a chain.
    pub fn explain_chain(&self, chain: &AgentChain) -> String {
        if chain.is_empty() {
            return "No agents selected".to_string();
        }
        chain
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let desc = profile(id).map_or("custom agent", |p| p.description);
                format!("{}. {}: {}", i + 1, id, desc)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Planner for Orchestrator {
    fn determine_agent_chain(&self, task: &str, context: &EnrichedContext) -> AgentChain {
        let mut proposed = self.template.propose(task, context);
        let source = if proposed.is_empty() {
            proposed = self.keyword.propose(task, context);
            self.keyword.name()
        } else {
            self.template.name()
        };
        proposed.extend(self.heuristics.propose(task, context));

        if proposed.is_empty() {
            proposed = vec![ids::CONTEXT.to_string(), ids::NARRATOR.to_string()];
        }

        // stable: ties keep proposal order
        proposed.sort_by_key(|id| stage_of(id));
        let mut chain: AgentChain = proposed.into_iter().collect();
        self.optimize(&mut chain, context);

        debug!(source, chain = ?chain.ids(), "Agent chain planned");
        chain
    }
}
