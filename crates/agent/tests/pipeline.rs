use async_trait::async_trait;
use legion_agent::agent::ids;
use legion_agent::bus::TOPIC_TASK_PROGRESS;
use legion_agent::{
    Agent, AgentChain, AgentDeps, AgentRegistry, Coordinator, Message, Planner, SnapshotError, SnapshotId,
    SnapshotProvider, TaskStatus,
};
use legion_core::types::{AgentOutput, Completion, EnrichedContext, GenerationRequest, ProviderKind, TaskContext};
use legion_core::{Config, Error, Paths, Result};
use legion_providers::{ModelManager, Provider};
use legion_storage::EventType;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct FixedModel;

#[async_trait]
impl Provider for FixedModel {
    fn name(&self) -> &str {
        "fixed"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<Completion> {
        Ok(Completion {
            text: "```python\ndef parse(s):\n    return s.split()\n```".to_string(),
            ..Default::default()
        })
    }
}

enum Mode {
    Fail,
    Panic,
    Empty,
}

struct BrokenAgent {
    mode: Mode,
}

#[async_trait]
impl Agent for BrokenAgent {
    fn name(&self) -> &str {
        "broken"
    }

    async fn execute(&mut self) -> Result<AgentOutput> {
        match self.mode {
            Mode::Fail => Err(Error::Agent("agent blew up".to_string())),
            Mode::Panic => panic!("agent bug"),
            Mode::Empty => Ok(AgentOutput::new("noop", "")),
        }
    }
}

fn broken_registry(mode: fn() -> Mode) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for id in [
        ids::CONTEXT,
        ids::FIXER,
        ids::COMPLETION,
        ids::REFACTOR,
        ids::TEST_GEN,
        ids::REVIEW,
        ids::NARRATOR,
    ] {
        registry.register(
            id,
            "always broken",
            Arc::new(move |_deps: AgentDeps| -> Result<Box<dyn Agent>> { Ok(Box::new(BrokenAgent { mode: mode() })) }),
        );
    }
    registry
}

struct FixedPlanner(Vec<&'static str>);

impl Planner for FixedPlanner {
    fn determine_agent_chain(&self, _task: &str, _context: &EnrichedContext) -> AgentChain {
        self.0.iter().collect()
    }
}

struct PanickingPlanner;

impl Planner for PanickingPlanner {
    fn determine_agent_chain(&self, _task: &str, _context: &EnrichedContext) -> AgentChain {
        panic!("planner bug")
    }
}

struct FailingSnapshot;

#[async_trait]
impl SnapshotProvider for FailingSnapshot {
    fn name(&self) -> &str {
        "failing"
    }

    async fn create_snapshot(&self, _label: &str) -> std::result::Result<SnapshotId, SnapshotError> {
        Err(SnapshotError::CommandFailed("not a git repository".to_string()))
    }
}

fn coordinator(tmp: &TempDir) -> Coordinator {
    let mut config = Config::default();
    config.snapshot.enabled = false;
    Coordinator::with_config(Paths::new(tmp.path()), config)
        .unwrap()
        .with_models(Arc::new(ModelManager::new(vec![Arc::new(FixedModel)])))
}

fn python_task() -> TaskContext {
    TaskContext::default()
        .with_file("src/parser.py")
        .with_code("def parse(s):\n    pass\n")
}

#[tokio::test]
async fn test_all_agents_failing_is_one_task_error() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(&tmp).with_registry(broken_registry(|| Mode::Fail));
    let task = "complete the parse function";

    let response = coord.request(task, python_task()).await;
    assert_eq!(response.status, TaskStatus::Error);
    assert!(response.error.as_deref().unwrap().contains("agent blew up"));
    assert_eq!(response.metadata["error_type"], json!("AgentError"));

    let errors = coord.journal().entries(Some(&EventType::TaskError), None, 100);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["task"], json!(task));
    assert_eq!(errors[0].data["stage"], json!("executing"));
    assert!(coord
        .journal()
        .entries(Some(&EventType::TaskComplete), None, 100)
        .is_empty());
}

#[tokio::test]
async fn test_success_path_consolidates_last_output() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(&tmp);

    let response = coord.request("complete the parse function", python_task()).await;
    assert!(response.is_success(), "{:?}", response.error);

    let output = response.output.unwrap();
    assert_eq!(output.action, "complete_code");
    assert_eq!(output.output, "def parse(s):\n    return s.split()");
    assert_eq!(
        output.metadata["consolidation"]["agent_results"],
        json!(["gather_context", "complete_code"])
    );
    assert_eq!(response.metadata["agents_used"], json!(["context", "completion"]));
    assert!(response.metadata["rollback_snapshot"].is_null());
    assert!(response.metadata["journal_entries"].as_u64().unwrap() >= 7);

    let journal = coord.journal();
    assert_eq!(journal.entries(Some(&EventType::TaskRequest), None, 10).len(), 1);
    assert_eq!(journal.entries(Some(&EventType::ChainPlanned), None, 10).len(), 1);
    assert_eq!(journal.entries(Some(&EventType::AgentDeployment), None, 10).len(), 2);
    let results = journal.entries(Some(&EventType::AgentResult), None, 10);
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].agent_name.as_deref(), Some("completion"));
    assert_eq!(journal.entries(Some(&EventType::TaskComplete), None, 10).len(), 1);
}

#[tokio::test]
async fn test_unknown_agent_is_resolution_error() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(&tmp).with_planner(Arc::new(FixedPlanner(vec!["context", "ghost"])));

    let response = coord.request("do something", TaskContext::default()).await;
    assert_eq!(response.status, TaskStatus::Error);
    assert_eq!(response.metadata["error_type"], json!("AgentResolutionError"));

    let errors = coord.journal().entries(Some(&EventType::TaskError), None, 10);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["agent"], json!("ghost"));
    // the context agent ran before resolution failed
    assert_eq!(coord.journal().entries(Some(&EventType::AgentResult), None, 10).len(), 1);
    let deployments = coord.journal().entries(Some(&EventType::AgentDeployment), None, 10);
    assert_eq!(deployments.len(), 2);
    assert_eq!(deployments[1].agent_name.as_deref(), Some("ghost"));
}

#[tokio::test]
async fn test_planner_panic_is_one_task_error() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(&tmp).with_planner(Arc::new(PanickingPlanner));

    let response = coord.request("do x", python_task()).await;
    assert_eq!(response.status, TaskStatus::Error);
    assert!(response.error.as_deref().unwrap().contains("panicked"));
    assert_eq!(response.metadata["stage"], json!("context_gathered"));

    let errors = coord.journal().entries(Some(&EventType::TaskError), None, 10);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data["task"], json!("do x"));
    assert!(coord
        .journal()
        .entries(Some(&EventType::AgentDeployment), None, 10)
        .is_empty());
}

#[tokio::test]
async fn test_invalid_and_panicking_agents_are_contained() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(&tmp).with_registry(broken_registry(|| Mode::Empty));
    let response = coord.request("review this", python_task()).await;
    assert_eq!(response.metadata["error_type"], json!("ValidationError"));

    let tmp = TempDir::new().unwrap();
    let coord = coordinator(&tmp).with_registry(broken_registry(|| Mode::Panic));
    let response = coord.request("review this", python_task()).await;
    assert_eq!(response.status, TaskStatus::Error);
    assert!(response.error.unwrap().contains("panicked"));
    assert_eq!(coord.journal().entries(Some(&EventType::TaskError), None, 10).len(), 1);
}

#[tokio::test]
async fn test_snapshot_failure_is_a_warning() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(&tmp).with_snapshot(Box::new(FailingSnapshot));

    let response = coord.request("complete the parse function", python_task()).await;
    assert!(response.is_success());
    let warnings = coord.journal().entries(Some(&EventType::Warning), None, 10);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].data["message"]
        .as_str()
        .unwrap()
        .contains("not a git repository"));
}

#[tokio::test]
async fn test_progress_is_published_on_the_bus() {
    let tmp = TempDir::new().unwrap();
    let coord = coordinator(&tmp);
    let stages = Arc::new(Mutex::new(Vec::new()));
    let sink = stages.clone();
    coord
        .bus()
        .subscribe(
            TOPIC_TASK_PROGRESS,
            Arc::new(move |m: &Message| -> anyhow::Result<()> {
                let stage = m.payload["stage"].as_str().unwrap_or_default().to_string();
                sink.lock().unwrap().push(stage);
                Ok(())
            }),
        )
        .unwrap();

    let response = coord.request("complete the parse function", python_task()).await;
    assert!(response.is_success());

    for _ in 0..50 {
        if stages.lock().unwrap().iter().any(|s| s == "complete") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let seen = stages.lock().unwrap().clone();
    assert_eq!(seen.first().map(String::as_str), Some("received"));
    assert!(seen.iter().any(|s| s == "executing"));
    assert_eq!(seen.last().map(String::as_str), Some("complete"));
    coord.shutdown();
}

#[tokio::test]
async fn test_index_then_status() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("src")).unwrap();
    std::fs::write(tmp.path().join("src/util.py"), "def tokenize(s):\n    return s.split()\n").unwrap();
    let coord = coordinator(&tmp);

    let report = coord.index_project(false).await.unwrap();
    assert_eq!(report.files_indexed, 1);

    let status = coord.status();
    assert!(status.project_indexed);
    assert!(status.registered_agents.contains(&"completion".to_string()));
    assert_eq!(status.providers, vec!["fixed"]);
    assert!(status.journal_entries >= 2);

    let response = coord.request("complete the tokenize helper", python_task()).await;
    assert!(response.is_success());
}
