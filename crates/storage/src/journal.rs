use chrono::{DateTime, Duration, Utc};
use legion_core::config::JournalConfig;
use legion_core::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    System,
    TaskRequest,
    ChainPlanned,
    AgentDeployment,
    AgentResult,
    AgentActivity,
    TaskComplete,
    TaskError,
    Warning,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::System => "system",
            EventType::TaskRequest => "task_request",
            EventType::ChainPlanned => "chain_planned",
            EventType::AgentDeployment => "agent_deployment",
            EventType::AgentResult => "agent_result",
            EventType::AgentActivity => "agent_activity",
            EventType::TaskComplete => "task_complete",
            EventType::TaskError => "task_error",
            EventType::Warning => "warning",
            EventType::Other(s) => s,
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "system" => EventType::System,
            "task_request" => EventType::TaskRequest,
            "chain_planned" => EventType::ChainPlanned,
            "agent_deployment" => EventType::AgentDeployment,
            "agent_result" => EventType::AgentResult,
            "agent_activity" => EventType::AgentActivity,
            "task_complete" => EventType::TaskComplete,
            "task_error" => EventType::TaskError,
            "warning" => EventType::Warning,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventType::from(s.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub entry_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub event_type: Option<EventType>,
    pub agent_name: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EntryFilter {
    fn matches(&self, entry: &JournalEntry) -> bool {
        if let Some(ref t) = self.event_type {
            if &entry.event_type != t {
                return false;
            }
        }
        if let Some(ref a) = self.agent_name {
            if entry.agent_name.as_deref() != Some(a.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentActivity {
    pub agent: String,
    pub total_entries: usize,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub event_breakdown: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub total_entries: usize,
    pub recent_errors: usize,
    pub recent_successes: usize,
    pub active_agents: usize,
    pub agent_activity: HashMap<String, usize>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackCandidate {
    pub task: String,
    pub timestamp: DateTime<Utc>,
    pub rollback_snapshot: String,
    pub agents_used: Vec<String>,
}

/// Append-only event log backed by a JSON-lines file.
///
/// Every write goes through the entries lock, so concurrent requests serialize here.
/// An entry returned from [`Journal::log`] has already been flushed to disk.
pub struct Journal {
    path: PathBuf,
    entries: Mutex<Vec<JournalEntry>>,
    config: JournalConfig,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, JournalConfig::default())
    }

    pub fn open_with(path: &Path, config: JournalConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries = if path.exists() {
            Self::read_file(path)?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "Journal opened");
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
            config,
        })
    }

    fn read_file(path: &Path) -> Result<Vec<JournalEntry>> {
        let content = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    error!(error = %e, line = lineno + 1, "Failed to parse journal entry, skipping");
                }
            }
        }
        Ok(entries)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JournalEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(
        &self,
        event_type: impl Into<EventType>,
        data: Value,
        agent_name: Option<&str>,
    ) -> Result<JournalEntry> {
        let event_type = event_type.into();
        let entry = JournalEntry {
            timestamp: Utc::now(),
            entry_id: format!("{}_{}", event_type, uuid::Uuid::new_v4().simple()),
            event_type,
            agent_name: agent_name.map(str::to_string),
            data,
        };

        let mut entries = self.lock();
        let line = serde_json::to_string(&entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        if self.config.sync_writes {
            file.sync_data()?;
        }
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Chronological entries matching the filters, truncated to the last `limit`.
    pub fn entries(
        &self,
        event_type: Option<&EventType>,
        agent_name: Option<&str>,
        limit: usize,
    ) -> Vec<JournalEntry> {
        let entries = self.lock();
        let matched: Vec<&JournalEntry> = entries
            .iter()
            .filter(|e| event_type.map_or(true, |t| &e.event_type == t))
            .filter(|e| agent_name.map_or(true, |a| e.agent_name.as_deref() == Some(a)))
            .collect();
        let skip = matched.len().saturating_sub(limit);
        matched.into_iter().skip(skip).cloned().collect()
    }

    pub fn entry_count(&self) -> usize {
        self.lock().len()
    }

    pub fn last_entry_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last().map(|e| e.timestamp)
    }

    /// Case-insensitive substring match over the serialized entry, most recent first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<JournalEntry> {
        let needle = query.to_lowercase();
        let entries = self.lock();
        let mut out = Vec::new();
        for entry in entries.iter().rev() {
            let haystack = match serde_json::to_string(entry) {
                Ok(s) => s.to_lowercase(),
                Err(_) => continue,
            };
            if haystack.contains(&needle) {
                out.push(entry.clone());
                if out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    pub fn agent_activity(&self, agent: &str) -> AgentActivity {
        let entries = self.lock();
        let mine: Vec<&JournalEntry> = entries
            .iter()
            .filter(|e| e.agent_name.as_deref() == Some(agent))
            .collect();
        let mut event_breakdown = HashMap::new();
        for e in &mine {
            *event_breakdown.entry(e.event_type.to_string()).or_insert(0) += 1;
        }
        AgentActivity {
            agent: agent.to_string(),
            total_entries: mine.len(),
            first_activity: mine.first().map(|e| e.timestamp),
            last_activity: mine.last().map(|e| e.timestamp),
            event_breakdown,
        }
    }

    /// `task_request`, `task_complete` and `task_error` entries in order.
    pub fn task_history(&self) -> Vec<JournalEntry> {
        self.lock()
            .iter()
            .filter(|e| {
                matches!(
                    e.event_type,
                    EventType::TaskRequest | EventType::TaskComplete | EventType::TaskError
                )
            })
            .cloned()
            .collect()
    }

    pub fn system_health(&self) -> SystemHealth {
        let entries = self.lock();
        let start = entries.len().saturating_sub(self.config.health_window);
        let recent = &entries[start..];

        let mut agent_activity: HashMap<String, usize> = HashMap::new();
        let mut recent_errors = 0;
        let mut recent_successes = 0;
        for e in recent {
            match e.event_type {
                EventType::TaskError => recent_errors += 1,
                EventType::TaskComplete => recent_successes += 1,
                _ => {}
            }
            if let Some(ref a) = e.agent_name {
                *agent_activity.entry(a.clone()).or_insert(0) += 1;
            }
        }

        SystemHealth {
            total_entries: entries.len(),
            recent_errors,
            recent_successes,
            active_agents: agent_activity.len(),
            agent_activity,
            last_update: entries.last().map(|e| e.timestamp),
        }
    }

    /// Completed tasks that recorded a snapshot, most recent first.
    pub fn rollback_candidates(&self) -> Vec<RollbackCandidate> {
        let entries = self.lock();
        entries
            .iter()
            .rev()
            .filter(|e| e.event_type == EventType::TaskComplete)
            .filter_map(|e| {
                let snapshot = e.data.get("rollback_snapshot")?.as_str()?;
                if snapshot.is_empty() {
                    return None;
                }
                let agents_used = e
                    .data
                    .get("agents_used")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                Some(RollbackCandidate {
                    task: e
                        .data
                        .get("task")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Unknown task")
                        .to_string(),
                    timestamp: e.timestamp,
                    rollback_snapshot: snapshot.to_string(),
                    agents_used,
                })
            })
            .take(self.config.rollback_candidates)
            .collect()
    }

    /// Write matching entries to `path` as JSON lines. Returns how many were written.
    pub fn export(&self, path: &Path, filter: &EntryFilter) -> Result<usize> {
        let selected: Vec<JournalEntry> = self
            .lock()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        for entry in &selected {
            writeln!(file, "{}", serde_json::to_string(entry)?)?;
        }
        file.flush()?;
        Ok(selected.len())
    }

    /// Drop entries older than `days_to_keep` days. The file is replaced atomically.
    pub fn clear_old_entries(&self, days_to_keep: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(days_to_keep));
        let removed = {
            let mut entries = self.lock();
            let before = entries.len();
            let kept: Vec<JournalEntry> = entries
                .iter()
                .filter(|e| e.timestamp > cutoff)
                .cloned()
                .collect();
            let removed = before - kept.len();
            if removed > 0 {
                self.rewrite(&kept)?;
                *entries = kept;
            }
            removed
        };

        if removed > 0 {
            info!(removed, days_to_keep, "Pruned old journal entries");
            self.log(
                EventType::System,
                serde_json::json!({
                    "message": format!("Cleared {} old journal entries", removed),
                    "removed": removed,
                    "days_to_keep": days_to_keep,
                }),
                None,
            )?;
        }
        Ok(removed)
    }

    fn rewrite(&self, entries: &[JournalEntry]) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            for entry in entries {
                writeln!(file, "{}", serde_json::to_string(entry)?)?;
            }
            file.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            Error::Storage(format!("Failed to replace journal file: {}", e))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn journal(dir: &TempDir) -> Journal {
        Journal::open(&dir.path().join("journal.jsonl")).unwrap()
    }

    #[test]
    fn test_order_and_type_filter() {
        let tmp = TempDir::new().unwrap();
        let j = journal(&tmp);
        j.log(EventType::TaskRequest, json!({"task": "a"}), None).unwrap();
        j.log(EventType::AgentResult, json!({"n": 1}), Some("context_agent")).unwrap();
        j.log(EventType::TaskRequest, json!({"task": "b"}), None).unwrap();
        j.log("custom_event", json!({}), None).unwrap();

        let all = j.entries(None, None, 100);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].data["task"], "a");
        assert_eq!(all[3].event_type, EventType::Other("custom_event".into()));

        let requests = j.entries(Some(&EventType::TaskRequest), None, 100);
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|e| e.event_type == EventType::TaskRequest));
        assert_eq!(requests[1].data["task"], "b");

        let last = j.entries(None, None, 1);
        assert_eq!(last[0].event_type.as_str(), "custom_event");

        let by_agent = j.entries(None, Some("context_agent"), 10);
        assert_eq!(by_agent.len(), 1);
    }

    #[test]
    fn test_reload_skips_malformed_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal.jsonl");
        {
            let j = Journal::open(&path).unwrap();
            j.log(EventType::System, json!({"message": "start"}), None).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{not json").unwrap();
        drop(f);
        {
            let j = Journal::open(&path).unwrap();
            j.log(EventType::Warning, json!({}), None).unwrap();
        }

        let j = Journal::open(&path).unwrap();
        assert_eq!(j.entry_count(), 2);
        let first = &j.entries(None, None, 10)[0];
        assert!(first.entry_id.starts_with("system_"));
    }

    #[test]
    fn test_search_most_recent_first() {
        let tmp = TempDir::new().unwrap();
        let j = journal(&tmp);
        j.log(EventType::TaskRequest, json!({"task": "Fix Parser"}), None).unwrap();
        j.log(EventType::TaskRequest, json!({"task": "other"}), None).unwrap();
        j.log(EventType::TaskRequest, json!({"task": "parser again"}), None).unwrap();

        let hits = j.search("PARSER", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].data["task"], "parser again");
        assert_eq!(j.search("parser", 1).len(), 1);
    }

    #[test]
    fn test_health_and_activity() {
        let tmp = TempDir::new().unwrap();
        let j = journal(&tmp);
        j.log(EventType::AgentDeployment, json!({}), Some("review_agent")).unwrap();
        j.log(EventType::AgentResult, json!({}), Some("review_agent")).unwrap();
        j.log(EventType::TaskComplete, json!({"task": "t"}), None).unwrap();
        j.log(EventType::TaskError, json!({"task": "t"}), None).unwrap();

        let health = j.system_health();
        assert_eq!(health.total_entries, 4);
        assert_eq!(health.recent_errors, 1);
        assert_eq!(health.recent_successes, 1);
        assert_eq!(health.active_agents, 1);

        let activity = j.agent_activity("review_agent");
        assert_eq!(activity.total_entries, 2);
        assert_eq!(activity.event_breakdown["agent_result"], 1);
        assert!(activity.first_activity <= activity.last_activity);
        assert_eq!(j.agent_activity("nobody").total_entries, 0);

        assert_eq!(j.task_history().len(), 2);
    }

    #[test]
    fn test_rollback_candidates() {
        let tmp = TempDir::new().unwrap();
        let j = journal(&tmp);
        j.log(EventType::TaskComplete, json!({"task": "one", "rollback_snapshot": "s1", "agents_used": ["a"]}), None).unwrap();
        j.log(EventType::TaskComplete, json!({"task": "two", "rollback_snapshot": null}), None).unwrap();
        j.log(EventType::TaskComplete, json!({"task": "three", "rollback_snapshot": "s3"}), None).unwrap();

        let c = j.rollback_candidates();
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].task, "three");
        assert_eq!(c[1].agents_used, vec!["a".to_string()]);
    }

    #[test]
    fn test_clear_old_entries_rewrites_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal.jsonl");
        let old = JournalEntry {
            timestamp: Utc::now() - Duration::days(90),
            event_type: EventType::TaskRequest,
            agent_name: None,
            data: json!({"task": "ancient"}),
            entry_id: "task_request_old".into(),
        };
        std::fs::write(&path, format!("{}\n", serde_json::to_string(&old).unwrap())).unwrap();

        let j = Journal::open(&path).unwrap();
        j.log(EventType::TaskRequest, json!({"task": "fresh"}), None).unwrap();
        assert_eq!(j.clear_old_entries(30).unwrap(), 1);

        // fresh entry plus the pruning notice
        let entries = j.entries(None, None, 10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].event_type, EventType::System);

        let reloaded = Journal::open(&path).unwrap();
        assert_eq!(reloaded.entry_count(), 2);
        assert_eq!(j.clear_old_entries(30).unwrap(), 0);
    }

    #[test]
    fn test_export_with_filter() {
        let tmp = TempDir::new().unwrap();
        let j = journal(&tmp);
        j.log(EventType::TaskRequest, json!({}), None).unwrap();
        j.log(EventType::TaskError, json!({}), None).unwrap();

        let out = tmp.path().join("export/errors.jsonl");
        let filter = EntryFilter {
            event_type: Some(EventType::TaskError),
            ..Default::default()
        };
        assert_eq!(j.export(&out, &filter).unwrap(), 1);
        let content = std::fs::read_to_string(&out).unwrap();
        assert!(content.contains("task_error"));
        assert!(!content.contains("task_request"));

        let future = EntryFilter {
            since: Some(Utc::now() + Duration::days(1)),
            ..Default::default()
        };
        assert_eq!(j.export(&out, &future).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_writers_are_serialized() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("journal.jsonl");
        let j = std::sync::Arc::new(Journal::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let j = j.clone();
                std::thread::spawn(move || {
                    for n in 0..25 {
                        j.log(EventType::AgentActivity, json!({"thread": t, "n": n}), Some("worker"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(j.entry_count(), 200);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 200);
        for line in &lines {
            serde_json::from_str::<JournalEntry>(line).unwrap();
        }

        let reloaded = Journal::open(&path).unwrap();
        assert_eq!(reloaded.entry_count(), 200);
        let ids: std::collections::HashSet<String> = reloaded
            .entries(None, None, 1000)
            .into_iter()
            .map(|e| e.entry_id)
            .collect();
        assert_eq!(ids.len(), 200);
    }
}
