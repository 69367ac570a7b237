use async_trait::async_trait;
use legion_core::config::SnapshotConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Opaque handle to a rollback point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshots are disabled")]
    Disabled,
    #[error("Failed to run snapshot command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Snapshot command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Snapshot command failed: {0}")]
    CommandFailed(String),
    #[error("No local changes to snapshot")]
    NothingToSave,
}

/// Best-effort save point taken after a task completes.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn create_snapshot(&self, label: &str) -> Result<SnapshotId, SnapshotError>;
}

/// `prefix-<8 hex>`.
pub fn snapshot_label(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

/// Stashes the working tree with `git stash push -m <label>`.
pub struct GitStashSnapshot {
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitStashSnapshot {
    pub fn new(repo_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo_root: repo_root.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SnapshotProvider for GitStashSnapshot {
    fn name(&self) -> &str {
        "git-stash"
    }

    async fn create_snapshot(&self, label: &str) -> Result<SnapshotId, SnapshotError> {
        let mut cmd = Command::new("git");
        cmd.args(["stash", "push", "-m", label])
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SnapshotError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SnapshotError::CommandFailed(format!(
                "git exited with code {:?}: {}",
                output.status.code(),
                stderr
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("No local changes to save") {
            debug!(label = %label, "Working tree clean, no stash created");
            return Err(SnapshotError::NothingToSave);
        }

        info!(label = %label, "Rollback snapshot created");
        Ok(SnapshotId(label.to_string()))
    }
}

pub struct DisabledSnapshot;

#[async_trait]
impl SnapshotProvider for DisabledSnapshot {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn create_snapshot(&self, _label: &str) -> Result<SnapshotId, SnapshotError> {
        Err(SnapshotError::Disabled)
    }
}

/// The provider the config asks for.
pub fn from_config(repo_root: impl Into<PathBuf>, config: &SnapshotConfig) -> Box<dyn SnapshotProvider> {
    if config.enabled {
        Box::new(GitStashSnapshot::new(repo_root, Duration::from_secs(config.timeout_secs)))
    } else {
        Box::new(DisabledSnapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_label_format() {
        let label = snapshot_label("legion-auto-stash");
        let suffix = label.strip_prefix("legion-auto-stash-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(label, snapshot_label("legion-auto-stash"));
    }

    #[tokio::test]
    async fn test_disabled() {
        let err = DisabledSnapshot.create_snapshot("x").await.unwrap_err();
        assert!(matches!(err, SnapshotError::Disabled));

        let cfg = SnapshotConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(from_config(".", &cfg).name(), "disabled");
    }

    #[tokio::test]
    async fn test_git_stash_outside_repo_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let snap = GitStashSnapshot::new(tmp.path(), Duration::from_secs(10));
        // either git is missing or the directory is not a repository
        assert!(snap.create_snapshot("legion-auto-stash-test").await.is_err());
    }
}
