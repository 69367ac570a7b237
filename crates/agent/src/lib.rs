pub mod agent;
pub mod builtin;
pub mod bus;
pub mod context_engine;
pub mod coordinator;
pub mod orchestrator;
pub mod snapshot;

pub use agent::{Agent, AgentDeps, AgentFactory, AgentRegistry};
pub use bus::{Message, MessageBus, SubscriptionId};
pub use context_engine::{ContextEngine, FileContext, IndexReport, ProjectStats};
pub use coordinator::{Coordinator, CoordinatorStatus, RequestStage, TaskResponse, TaskStatus};
pub use orchestrator::{AgentChain, ChainStrategy, ChainValidation, Orchestrator, Planner};
pub use snapshot::{DisabledSnapshot, GitStashSnapshot, SnapshotError, SnapshotId, SnapshotProvider};
