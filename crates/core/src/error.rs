use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Agent resolution failed: {0}")]
    AgentResolution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short, stable name of the variant. Recorded as `error_type` in task error entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::Provider(_) => "ProviderError",
            Error::Agent(_) => "AgentError",
            Error::AgentResolution(_) => "AgentResolutionError",
            Error::Storage(_) => "StorageError",
            Error::Snapshot(_) => "SnapshotError",
            Error::Validation(_) => "ValidationError",
            Error::NotFound(_) => "NotFound",
            Error::Timeout(_) => "Timeout",
            Error::Other(_) => "Error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(Error::AgentResolution("x".into()).kind(), "AgentResolutionError");
        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.kind(), "IoError");
        assert!(io.to_string().contains("boom"));
    }
}
