use legion_core::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub fn content_hash(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

/// Relative file path → MD5 of the content that was last indexed.
pub struct FileHashCache {
    path: PathBuf,
    hashes: Mutex<HashMap<String, String>>,
}

impl FileHashCache {
    /// A missing or unreadable cache file starts empty; everything gets reindexed.
    pub fn load(path: &Path) -> Self {
        let hashes = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "Corrupt file hash cache, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            hashes: Mutex::new(hashes),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.hashes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, file: &str) -> Option<String> {
        self.lock().get(file).cloned()
    }

    pub fn is_unchanged(&self, file: &str, hash: &str) -> bool {
        self.lock().get(file).map(|h| h == hash).unwrap_or(false)
    }

    pub fn record(&self, file: &str, hash: &str) {
        self.lock().insert(file.to_string(), hash.to_string());
    }

    pub fn remove(&self, file: &str) -> bool {
        self.lock().remove(file).is_some()
    }

    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.lock().keys().cloned().collect();
        files.sort();
        files
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&*self.lock())?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_save_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache/file_hashes.json");
        let cache = FileHashCache::load(&path);
        assert!(cache.is_empty());

        let h = content_hash(b"fn main() {}");
        cache.record("src/main.rs", &h);
        assert!(cache.is_unchanged("src/main.rs", &h));
        assert!(!cache.is_unchanged("src/main.rs", &content_hash(b"changed")));
        cache.save().unwrap();

        let reloaded = FileHashCache::load(&path);
        assert_eq!(reloaded.get("src/main.rs"), Some(h));
        assert_eq!(reloaded.files(), vec!["src/main.rs".to_string()]);
        assert!(reloaded.remove("src/main.rs"));
        assert_eq!(reloaded.len(), 0);
    }

    #[test]
    fn test_corrupt_cache_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file_hashes.json");
        std::fs::write(&path, "{oops").unwrap();
        assert!(FileHashCache::load(&path).is_empty());
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(content_hash(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
