pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod types;

pub use config::{Config, ProviderConfig};
pub use error::{Error, Result};
pub use paths::Paths;
pub use types::{
    AgentOutput, ChunkKind, Completion, ContextChunk, EnrichedContext, GenerationRequest,
    GenerationResult, ProviderKind, TaskContext, Usage,
};
