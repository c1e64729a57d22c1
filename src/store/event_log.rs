//! Append-only per-stream log. Entries are never rewritten; readers advance
//! with a `last_id` cursor and can block until new entries arrive instead of
//! polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};

pub const GLOBAL_JOB_EVENTS: &str = "job-events";
pub const AGENT_HEALTH_EVENTS: &str = "agent-health-events";
pub const AGENT_DISCOVERY_EVENTS: &str = "agent-discovery-events";
pub const ROUTING_DECISIONS: &str = "routing-decisions";

pub fn job_stream(job_id: &str) -> String {
    format!("job-stream:{job_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: u64,
    pub fields: Value,
    pub at: DateTime<Utc>,
}

struct Stream {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    notify: Notify,
}

impl Stream {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            notify: Notify::new(),
        }
    }
}

/// Reference append-only log backing C1's streaming contract. Lives entirely
/// in process memory; survives for the lifetime of the orchestrator process.
#[derive(Clone)]
pub struct EventLog {
    streams: Arc<RwLock<HashMap<String, Arc<Stream>>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn stream_for(&self, name: &str) -> Arc<Stream> {
        if let Some(stream) = self.streams.read().await.get(name) {
            return Arc::clone(stream);
        }
        let mut streams = self.streams.write().await;
        Arc::clone(
            streams
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Stream::new())),
        )
    }

    pub async fn append(&self, stream: &str, fields: Value) -> u64 {
        let stream = self.stream_for(stream).await;
        let id = stream.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Entry {
            id,
            fields,
            at: Utc::now(),
        };
        stream.entries.lock().await.push(entry);
        stream.notify.notify_waiters();
        id
    }

    /// Returns entries with id > `last_id`, up to `max_count`. If none are
    /// immediately available and `block` is non-zero, waits up to `block`
    /// for new entries before returning whatever (possibly nothing) arrived.
    pub async fn read_from(
        &self,
        stream: &str,
        last_id: u64,
        max_count: usize,
        block: Duration,
    ) -> Vec<Entry> {
        let stream = self.stream_for(stream).await;

        let collect = |entries: &[Entry]| -> Vec<Entry> {
            entries
                .iter()
                .filter(|e| e.id > last_id)
                .take(max_count)
                .cloned()
                .collect()
        };

        {
            let entries = stream.entries.lock().await;
            let ready = collect(&entries);
            if !ready.is_empty() || block.is_zero() {
                return ready;
            }
        }

        let notified = stream.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(block) => {}
        }

        let entries = stream.entries.lock().await;
        collect(&entries)
    }

    pub async fn len(&self, stream: &str) -> usize {
        self.stream_for(stream).await.entries.lock().await.len()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn appends_get_monotonic_ids() {
        let log = EventLog::new();
        let id1 = log.append("s", json!({"a": 1})).await;
        let id2 = log.append("s", json!({"a": 2})).await;
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn read_from_respects_last_id() {
        let log = EventLog::new();
        log.append("s", json!({"a": 1})).await;
        let id2 = log.append("s", json!({"a": 2})).await;
        let entries = log.read_from("s", id2 - 1, 10, Duration::from_millis(0)).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id2);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let log = EventLog::new();
        let log2 = log.clone();
        let reader = tokio::spawn(async move {
            log2.read_from("s", 0, 10, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("s", json!({"a": 1})).await;
        let entries = reader.await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn non_blocking_read_returns_empty_immediately() {
        let log = EventLog::new();
        let entries = log.read_from("s", 0, 10, Duration::from_millis(0)).await;
        assert!(entries.is_empty());
    }
}
