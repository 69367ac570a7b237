use chrono::{DateTime, Utc};
use futures::FutureExt;
use legion_core::types::{AgentOutput, EnrichedContext, TaskContext};
use legion_core::{Config, Error, Paths, Result};
use legion_providers::ModelManager;
use legion_storage::{EventType, Journal};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentDeps, AgentRegistry};
use crate::bus::{BusStats, MessageBus};
use crate::context_engine::{ContextEngine, IndexReport};
use crate::orchestrator::{AgentChain, Orchestrator, Planner};
use crate::snapshot::{self, snapshot_label, SnapshotError, SnapshotId, SnapshotProvider};

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    ContextGathered,
    ChainPlanned,
    /// Running the agent at this chain index.
    Executing(usize),
    Consolidated,
    SnapshotAttempted,
    Complete,
    Error,
}

impl RequestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStage::Received => "received",
            RequestStage::ContextGathered => "context_gathered",
            RequestStage::ChainPlanned => "chain_planned",
            RequestStage::Executing(_) => "executing",
            RequestStage::Consolidated => "consolidated",
            RequestStage::SnapshotAttempted => "snapshot_attempted",
            RequestStage::Complete => "complete",
            RequestStage::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Error,
}

/// What `request()` always returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Option<AgentOutput>,
    #[serde(default)]
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
}

impl TaskResponse {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub project_root: String,
    pub registered_agents: Vec<String>,
    pub providers: Vec<String>,
    pub journal_entries: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub context_available: bool,
    pub project_indexed: bool,
    pub bus: BusStats,
}

/// Per-request bookkeeping.
struct RequestScope {
    task_id: String,
    task: String,
    started: Instant,
    stage: RequestStage,
    chain: Vec<String>,
    journal_entries: usize,
}

impl RequestScope {
    fn new(task: &str) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task: task.to_string(),
            started: Instant::now(),
            stage: RequestStage::Received,
            chain: Vec::new(),
            journal_entries: 0,
        }
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Entry point of the runtime: plans, runs and records one task at a time per call.
pub struct Coordinator {
    paths: Paths,
    config: Config,
    bus: Arc<MessageBus>,
    journal: Arc<Journal>,
    context: Arc<ContextEngine>,
    models: Arc<ModelManager>,
    planner: Arc<dyn Planner>,
    registry: AgentRegistry,
    snapshot: Box<dyn SnapshotProvider>,
}

impl Coordinator {
    /// Open everything under `<project_root>/.legion` using the project's config.
    pub fn open(project_root: impl AsRef<Path>) -> Result<Self> {
        let paths = Paths::new(project_root);
        let config = Config::load_or_default(&paths)?;
        Self::with_config(paths, config)
    }

    pub fn with_config(paths: Paths, config: Config) -> Result<Self> {
        paths.ensure_dirs()?;
        let journal = Journal::open_with(&paths.journal_file(), config.journal.clone())?;
        let bus = MessageBus::new(&config.bus);
        let context = ContextEngine::open(&paths, &config.context);
        let models = ModelManager::from_config(&config);
        let snapshot = snapshot::from_config(&paths.project_root, &config.snapshot);

        let coordinator = Self {
            bus: Arc::new(bus),
            journal: Arc::new(journal),
            context: Arc::new(context),
            models: Arc::new(models),
            planner: Arc::new(Orchestrator::new()),
            registry: AgentRegistry::with_defaults(),
            snapshot,
            paths,
            config,
        };
        coordinator.log_system("initialized");
        info!(project = %coordinator.paths.project_root.display(), "Legion coordinator ready");
        Ok(coordinator)
    }

    pub fn with_models(mut self, models: Arc<ModelManager>) -> Self {
        self.models = models;
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_snapshot(mut self, snapshot: Box<dyn SnapshotProvider>) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_context_engine(mut self, context: Arc<ContextEngine>) -> Self {
        self.context = context;
        self
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub fn registry_mut(&mut self) -> &mut AgentRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Journal `data`, mirror it on the bus and count it. A journal failure only warns.
    fn record(&self, scope: Option<&mut RequestScope>, event: EventType, data: Value, agent: Option<&str>) {
        match self.journal.log(event, data, agent) {
            Ok(entry) => {
                if let Some(scope) = scope {
                    scope.journal_entries += 1;
                }
                self.bus.publish_journal_entry(&entry);
            }
            Err(e) => warn!(error = %e, "Failed to write journal entry"),
        }
    }

    fn log_system(&self, event: &str) {
        self.record(
            None,
            EventType::System,
            json!({ "event": event, "project_root": self.paths.project_root.display().to_string() }),
            None,
        );
    }

    fn advance(&self, scope: &mut RequestScope, stage: RequestStage, mut details: Value) {
        scope.stage = stage;
        if let (RequestStage::Executing(step), Value::Object(map)) = (stage, &mut details) {
            map.insert("step".to_string(), json!(step));
        }
        self.bus.publish_task_progress(&scope.task_id, stage.as_str(), details);
    }

    /// Run one task through the whole pipeline. Never fails: errors come back as
    /// `status: error` with a single `task_error` journal entry.
    pub async fn request(&self, task: &str, context: TaskContext) -> TaskResponse {
        let mut scope = RequestScope::new(task);
        info!(task_id = %scope.task_id, "Task received");

        self.record(
            Some(&mut scope),
            EventType::TaskRequest,
            json!({ "task": task, "context": context, "user": context.user_name }),
            None,
        );
        self.advance(&mut scope, RequestStage::Received, json!({ "task": task }));

        let outcome = AssertUnwindSafe(self.run(&mut scope, &context)).catch_unwind().await;
        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => self.fail(&mut scope, e),
            Err(_) => {
                let stage = scope.stage.as_str();
                self.fail(&mut scope, Error::Other(format!("Request pipeline panicked at stage '{}'", stage)))
            }
        }
    }

    async fn run(&self, scope: &mut RequestScope, task_context: &TaskContext) -> Result<TaskResponse> {
        let engine = self.context.clone();
        let task = scope.task.clone();
        let retrieval_context = task_context.clone();
        let enriched = tokio::task::spawn_blocking(move || engine.relevant_context(&task, &retrieval_context, None))
            .await
            .map_err(|e| Error::Other(format!("Context retrieval failed: {}", e)))?;
        let enriched = Arc::new(enriched);
        self.advance(
            scope,
            RequestStage::ContextGathered,
            json!({ "chunks": enriched.chunks.len(), "fallback_mode": enriched.fallback_mode }),
        );

        let chain = self.planner.determine_agent_chain(&scope.task, &enriched);
        scope.chain = chain.ids().to_vec();
        let planned = json!({ "task": scope.task, "agent_chain": scope.chain });
        self.record(Some(&mut *scope), EventType::ChainPlanned, planned, None);
        let progress = json!({ "agent_chain": scope.chain });
        self.advance(scope, RequestStage::ChainPlanned, progress);

        let results = self.execute_chain(scope, &chain, &enriched).await?;

        let final_output = consolidate(&results);
        self.advance(scope, RequestStage::Consolidated, json!({ "total_agents": results.len() }));

        let rollback_snapshot = self.attempt_snapshot(scope).await;
        self.advance(
            scope,
            RequestStage::SnapshotAttempted,
            json!({ "rollback_snapshot": rollback_snapshot }),
        );

        let total = scope.elapsed();
        let completed = json!({
            "task": scope.task,
            "final_output": final_output,
            "rollback_snapshot": rollback_snapshot,
            "total_execution_time": total,
            "agents_used": scope.chain,
        });
        self.record(Some(&mut *scope), EventType::TaskComplete, completed, None);
        self.advance(scope, RequestStage::Complete, json!({ "execution_time": total }));
        info!(task_id = %scope.task_id, agents = scope.chain.len(), elapsed = total, "Task complete");

        let mut metadata = Map::new();
        metadata.insert("execution_time".into(), json!(total));
        metadata.insert("agents_used".into(), json!(scope.chain));
        metadata.insert("rollback_snapshot".into(), json!(rollback_snapshot));
        metadata.insert("journal_entries".into(), json!(scope.journal_entries));
        Ok(TaskResponse {
            status: TaskStatus::Success,
            output: Some(final_output),
            error: None,
            metadata,
        })
    }

    async fn execute_chain(
        &self,
        scope: &mut RequestScope,
        chain: &AgentChain,
        enriched: &Arc<EnrichedContext>,
    ) -> Result<Vec<AgentOutput>> {
        let mut results: Vec<AgentOutput> = Vec::with_capacity(chain.len());

        for (step, id) in chain.iter().enumerate() {
            self.advance(scope, RequestStage::Executing(step), json!({ "agent": id }));

            let deps = AgentDeps {
                bus: self.bus.clone(),
                journal: self.journal.clone(),
                context: enriched.clone(),
                models: self.models.clone(),
                task: scope.task.clone(),
                previous: results.last().cloned(),
            };
            let deployment = json!({ "agent": id, "step": step, "task": scope.task });
            self.record(Some(&mut *scope), EventType::AgentDeployment, deployment, Some(id));
            self.bus.publish_agent_status(id, "deploying", json!({ "step": step }));

            let mut agent = self.registry.create(id, deps)?;
            debug!(agent = %id, step, "Executing agent");

            let outcome = AssertUnwindSafe(agent.execute()).catch_unwind().await;
            let checked = match outcome {
                Ok(Ok(output)) if agent.validate_result(&output) => Ok(output),
                Ok(Ok(output)) => Err(Error::Validation(format!(
                    "Agent '{}' returned an invalid result (action '{}')",
                    id, output.action
                ))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Agent(format!("Agent '{}' panicked", id))),
            };
            agent.cleanup().await;
            drop(agent);

            let output = match checked {
                Ok(output) => output,
                Err(e) => {
                    self.bus.publish_agent_status(id, "failed", json!({ "error": e.to_string() }));
                    return Err(e);
                }
            };

            let result = json!({
                "agent": id,
                "step": step,
                "action": output.action,
                "output": output.output,
                "metadata": output.metadata,
                "execution_time": scope.elapsed(),
            });
            self.record(Some(&mut *scope), EventType::AgentResult, result, Some(id));
            self.bus.publish_agent_status(id, "completed", json!({ "action": output.action }));
            results.push(output);
        }

        Ok(results)
    }

    /// `None` when no snapshot was taken; failures become `warning` entries.
    async fn attempt_snapshot(&self, scope: &mut RequestScope) -> Option<SnapshotId> {
        let label = snapshot_label(&self.config.snapshot.label_prefix);
        match self.snapshot.create_snapshot(&label).await {
            Ok(id) => Some(id),
            Err(SnapshotError::Disabled) => None,
            Err(e) => {
                warn!(error = %e, provider = %self.snapshot.name(), "Rollback snapshot not created");
                self.record(
                    Some(scope),
                    EventType::Warning,
                    json!({ "message": format!("Failed to create rollback snapshot: {}", e), "label": label }),
                    None,
                );
                None
            }
        }
    }

    fn fail(&self, scope: &mut RequestScope, e: Error) -> TaskResponse {
        let failed_stage = scope.stage;
        let elapsed = scope.elapsed();
        error!(
            task_id = %scope.task_id,
            stage = failed_stage.as_str(),
            error = %e,
            "Task failed"
        );

        let mut error_data = json!({
            "task": scope.task,
            "error": e.to_string(),
            "error_type": e.kind(),
            "stage": failed_stage.as_str(),
            "execution_time": elapsed,
        });
        if let (RequestStage::Executing(step), Value::Object(map)) = (failed_stage, &mut error_data) {
            map.insert("step".to_string(), json!(step));
            if let Some(agent) = scope.chain.get(step) {
                map.insert("agent".to_string(), json!(agent));
            }
        }
        self.record(Some(&mut *scope), EventType::TaskError, error_data, None);
        self.advance(scope, RequestStage::Error, json!({ "error": e.to_string() }));

        let mut metadata = Map::new();
        metadata.insert("execution_time".into(), json!(elapsed));
        metadata.insert("agents_used".into(), json!(scope.chain));
        metadata.insert("error_type".into(), json!(e.kind()));
        metadata.insert("stage".into(), json!(failed_stage.as_str()));
        metadata.insert("journal_entries".into(), json!(scope.journal_entries));
        TaskResponse {
            status: TaskStatus::Error,
            output: None,
            error: Some(e.to_string()),
            metadata,
        }
    }

    /// Index the project on a blocking thread and journal the report.
    pub async fn index_project(&self, force: bool) -> Result<IndexReport> {
        let engine = self.context.clone();
        let report = tokio::task::spawn_blocking(move || engine.index_project(force))
            .await
            .map_err(|e| Error::Other(format!("Indexing task failed: {}", e)))?;
        self.record(
            None,
            EventType::System,
            json!({ "event": "index_project", "force": force, "report": report }),
            None,
        );
        Ok(report)
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            project_root: self.paths.project_root.display().to_string(),
            registered_agents: self.registry.ids(),
            providers: self.models.provider_names(),
            journal_entries: self.journal.entry_count(),
            last_activity: self.journal.last_entry_time(),
            context_available: self.context.is_available(),
            project_indexed: self.context.is_indexed(),
            bus: self.bus.stats(),
        }
    }

    /// Journal the shutdown and stop all bus workers.
    pub fn shutdown(&self) {
        self.log_system("shutdown");
        self.bus.close();
        info!("Legion coordinator stopped");
    }
}

/// The last result is the primary output; every action taken is summarized in its metadata.
fn consolidate(results: &[AgentOutput]) -> AgentOutput {
    let actions: Vec<&str> = results.iter().map(|r| r.action.as_str()).collect();
    let summary = json!({ "total_agents": results.len(), "agent_results": actions });
    match results.last() {
        Some(last) => last.clone().with_meta("consolidation", summary),
        None => AgentOutput::new("consolidate", "No results to consolidate").with_meta("consolidation", summary),
    }
}
