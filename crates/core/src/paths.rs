use std::path::{Path, PathBuf};

/// Filesystem layout of a Legion project. Everything lives under `<project>/.legion`.
#[derive(Debug, Clone)]
pub struct Paths {
    pub project_root: PathBuf,
    pub base: PathBuf,
}

impl Paths {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        let project_root = project_root.as_ref().to_path_buf();
        let base = project_root.join(".legion");
        Self { project_root, base }
    }

    /// Keep `project_root` but store state somewhere else (tests, read-only checkouts).
    pub fn with_base(project_root: impl AsRef<Path>, base: PathBuf) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            base,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// `~/.legion/config.json`, consulted when the project has no config of its own.
    pub fn user_config_file() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".legion").join("config.json"))
    }

    pub fn journal_file(&self) -> PathBuf {
        self.base.join("journal.jsonl")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base.join("cache")
    }

    pub fn vector_index_file(&self) -> PathBuf {
        self.cache_dir().join("vector_index.db")
    }

    pub fn file_hashes_file(&self) -> PathBuf {
        self.cache_dir().join("file_hashes.json")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.base.join("agents")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base.join("backups")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.cache_dir())?;
        std::fs::create_dir_all(self.agents_dir())?;
        std::fs::create_dir_all(self.backups_dir())?;
        Ok(())
    }

    /// Express `path` relative to the project root when it lies inside it.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.project_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_and_ensure_dirs() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path());
        paths.ensure_dirs().unwrap();
        assert!(paths.cache_dir().is_dir());
        assert!(paths.agents_dir().is_dir());
        assert!(paths.backups_dir().is_dir());
        assert_eq!(paths.journal_file(), tmp.path().join(".legion/journal.jsonl"));
    }

    #[test]
    fn test_relative() {
        let paths = Paths::new("/work/proj");
        assert_eq!(
            paths.relative(Path::new("/work/proj/src/main.rs")),
            PathBuf::from("src/main.rs")
        );
        assert_eq!(paths.relative(Path::new("lib.rs")), PathBuf::from("lib.rs"));
    }
}
