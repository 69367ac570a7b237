use chrono::{DateTime, Utc};
use legion_core::config::BusConfig;
use legion_core::{Error, Result};
use legion_storage::JournalEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

pub const TOPIC_AGENT_STATUS: &str = "agent.status";
pub const TOPIC_TASK_PROGRESS: &str = "task.progress";
pub const TOPIC_JOURNAL_ENTRY: &str = "journal.entry";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Value,
    #[serde(default)]
    pub sender: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subscriber callback. Runs on the subscription's own worker task; keep it short.
pub type Callback = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub callback_failures: u64,
    pub subscriptions: usize,
    pub topics: usize,
    pub history_len: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    callback_failures: AtomicU64,
}

struct Subscription {
    id: SubscriptionId,
    tx: mpsc::Sender<Arc<Message>>,
}

/// In-process topic pub/sub.
///
/// Each subscription owns a bounded queue drained by a dedicated tokio task, so
/// `publish` never waits on subscriber code and a subscriber sees messages in publish
/// order. When a queue is full the message is dropped for that subscriber only.
pub struct MessageBus {
    subscribers: Mutex<HashMap<String, Vec<Subscription>>>,
    history: Mutex<VecDeque<Arc<Message>>>,
    history_cap: usize,
    queue_cap: usize,
    counters: Arc<Counters>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MessageBus {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_cap: config.history_cap,
            queue_cap: config.subscriber_queue.max(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Register `callback` for `topic`. Must be called from within a tokio runtime.
    pub fn subscribe(&self, topic: &str, callback: Callback) -> Result<SubscriptionId> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("Message bus subscribe needs a tokio runtime: {}", e)))?;

        let id = SubscriptionId(uuid::Uuid::new_v4().to_string());
        let (tx, mut rx) = mpsc::channel::<Arc<Message>>(self.queue_cap);
        let counters = self.counters.clone();
        let sub_id = id.clone();

        handle.spawn(async move {
            while let Some(msg) = rx.recv().await {
                match std::panic::catch_unwind(AssertUnwindSafe(|| callback(msg.as_ref()))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        counters.callback_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(subscription = %sub_id, topic = %msg.topic, error = %e, "Subscriber callback failed");
                    }
                    Err(_) => {
                        counters.callback_failures.fetch_add(1, Ordering::Relaxed);
                        error!(subscription = %sub_id, topic = %msg.topic, "Subscriber callback panicked");
                    }
                }
            }
            debug!(subscription = %sub_id, "Subscriber worker stopped");
        });

        relock(&self.subscribers)
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { id: id.clone(), tx });
        debug!(topic = %topic, subscription = %id, "Subscribed");
        Ok(id)
    }

    /// Remove a subscription. Messages already queued for it are still delivered.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subs = relock(&self.subscribers);
        let mut removed = false;
        subs.retain(|_, list| {
            let before = list.len();
            list.retain(|s| &s.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub fn publish(&self, topic: &str, payload: Value, sender: Option<&str>) -> Message {
        let msg = Arc::new(Message {
            topic: topic.to_string(),
            payload,
            sender: sender.map(str::to_string),
            timestamp: Utc::now(),
            message_id: uuid::Uuid::new_v4().to_string(),
        });
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        {
            let mut history = relock(&self.history);
            history.push_back(msg.clone());
            while history.len() > self.history_cap {
                history.pop_front();
            }
        }

        let subs = relock(&self.subscribers);
        if let Some(list) = subs.get(topic) {
            for sub in list {
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => {
                        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(topic = %topic, subscription = %sub.id, "Subscriber queue full, message dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(topic = %topic, subscription = %sub.id, "Subscriber worker gone");
                    }
                }
            }
        }

        (*msg).clone()
    }

    /// Up to `limit` most recent messages, oldest first.
    pub fn history(&self, topic: Option<&str>, limit: usize) -> Vec<Message> {
        let history = relock(&self.history);
        let matched: Vec<&Arc<Message>> = history
            .iter()
            .filter(|m| topic.map_or(true, |t| m.topic == t))
            .collect();
        let skip = matched.len().saturating_sub(limit);
        matched.into_iter().skip(skip).map(|m| (**m).clone()).collect()
    }

    pub fn clear_history(&self) {
        relock(&self.history).clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        relock(&self.subscribers).get(topic).map_or(0, Vec::len)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = relock(&self.subscribers).keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn stats(&self) -> BusStats {
        let subs = relock(&self.subscribers);
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            callback_failures: self.counters.callback_failures.load(Ordering::Relaxed),
            subscriptions: subs.values().map(Vec::len).sum(),
            topics: subs.len(),
            history_len: relock(&self.history).len(),
        }
    }

    /// Drop every subscription. Workers exit once their queues drain.
    pub fn close(&self) {
        relock(&self.subscribers).clear();
    }

    pub fn publish_agent_status(&self, agent: &str, status: &str, details: Value) -> Message {
        self.publish(
            TOPIC_AGENT_STATUS,
            serde_json::json!({
                "agent": agent,
                "status": status,
                "details": details,
            }),
            Some(agent),
        )
    }

    pub fn publish_task_progress(&self, task_id: &str, stage: &str, details: Value) -> Message {
        self.publish(
            TOPIC_TASK_PROGRESS,
            serde_json::json!({
                "task_id": task_id,
                "stage": stage,
                "details": details,
            }),
            Some("coordinator"),
        )
    }

    pub fn publish_journal_entry(&self, entry: &JournalEntry) -> Message {
        let payload = serde_json::to_value(entry).unwrap_or_else(|e| {
            serde_json::json!({ "entry_id": entry.entry_id, "error": e.to_string() })
        });
        self.publish(TOPIC_JOURNAL_ENTRY, payload, Some("journal"))
    }
}
