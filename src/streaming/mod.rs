//! Live fan-out over C1's event log (C5). Two subscription scopes — per-job
//! and global — both backed by the same bounded, drop-oldest-non-terminal
//! queue; the HTTP layer only has to turn a `Subscription` into WebSocket or
//! SSE frames.

use crate::store::event_log;
use crate::store::model::JobStatus;
use crate::store::Store;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const READ_BLOCK: Duration = Duration::from_secs(5);
const READ_BATCH: usize = 100;

fn is_terminal_event(event: &Value) -> bool {
    match event.get("event_type").and_then(Value::as_str) {
        Some("task_completed") | Some("task_failed") => true,
        Some("job_status_changed") => event
            .get("status")
            .and_then(Value::as_str)
            .map(|s| matches!(s, "COMPLETED" | "FAILED" | "CANCELED"))
            .unwrap_or(false),
        _ => false,
    }
}

fn backpressure_frame() -> Value {
    json!({"event_type": "backpressure", "timestamp": chrono::Utc::now()})
}

fn connected_frame() -> Value {
    json!({"event_type": "connected", "timestamp": chrono::Utc::now()})
}

fn error_frame(detail: &str) -> Value {
    json!({"event_type": "error", "detail": detail, "timestamp": chrono::Utc::now()})
}

fn pong_frame() -> Value {
    json!({"event_type": "pong", "timestamp": chrono::Utc::now()})
}

/// Bounded per-subscriber queue. Overflow drops the oldest non-terminal
/// entry and appends one `backpressure` marker; terminal entries are never
/// dropped, even past capacity.
struct SubscriberQueue {
    entries: Mutex<VecDeque<Value>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    async fn push(&self, event: Value) {
        let terminal = is_terminal_event(&event);
        let mut entries = self.entries.lock().await;

        if entries.len() >= self.capacity {
            if let Some(pos) = entries.iter().position(|e| !is_terminal_event(e)) {
                entries.remove(pos);
                if !terminal {
                    entries.push_back(backpressure_frame());
                }
            } else if !terminal {
                // Queue is saturated with undropped terminal events and this
                // new event isn't one either; nothing safe to evict, so the
                // new non-terminal event is the one that's dropped.
                drop(entries);
                return;
            }
        }
        entries.push_back(event);
        drop(entries);
        self.notify.notify_waiters();
    }

    async fn recv(&self) -> Option<Value> {
        loop {
            {
                let mut entries = self.entries.lock().await;
                if let Some(event) = entries.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// A live subscription. Dropping it cancels the background forwarder.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    _forwarder: JoinHandle<()>,
}

impl Subscription {
    pub async fn recv(&self) -> Option<Value> {
        self.queue.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
        self._forwarder.abort();
    }
}

pub struct StreamingGateway {
    store: Arc<Store>,
    queue_capacity: usize,
}

impl StreamingGateway {
    pub fn new(store: Arc<Store>, queue_capacity: usize) -> Self {
        Self { store, queue_capacity }
    }

    /// `None` when `job_id` doesn't resolve to a known job; the caller is
    /// expected to emit one `error` frame and close the connection.
    pub async fn subscribe_job(&self, job_id: &str) -> Option<Subscription> {
        let job = self.store.get_job(job_id).await?;
        let tasks = self.store.tasks_for_job(job_id).await;
        let queue = SubscriberQueue::new(self.queue_capacity);

        queue
            .push(json!({
                "event_type": "job_status",
                "job_id": job.id,
                "status": job.status,
                "tasks": tasks,
                "timestamp": chrono::Utc::now(),
            }))
            .await;

        let store = Arc::clone(&self.store);
        let stream = event_log::job_stream(job_id);
        let forward_queue = Arc::clone(&queue);
        let forwarder = tokio::spawn(async move {
            let mut last_id = 0u64;
            let mut ping = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    entries = store.events.read_from(&stream, last_id, READ_BATCH, READ_BLOCK) => {
                        if entries.is_empty() {
                            continue;
                        }
                        for entry in entries {
                            last_id = entry.id;
                            forward_queue.push(entry.fields).await;
                        }
                    }
                    _ = ping.tick() => {
                        forward_queue.push(pong_frame()).await;
                    }
                }
            }
        });

        Some(Subscription {
            queue,
            _forwarder: forwarder,
        })
    }

    /// Fans out every job's events plus periodic pings; never fails (there
    /// is nothing scoped to validate up front).
    pub async fn subscribe_global(&self) -> Subscription {
        let queue = SubscriberQueue::new(self.queue_capacity);
        queue.push(connected_frame()).await;

        let store = Arc::clone(&self.store);
        let forward_queue = Arc::clone(&queue);
        let forwarder = tokio::spawn(async move {
            let mut last_id = 0u64;
            let mut ping = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    entries = store.events.read_from(
                        event_log::GLOBAL_JOB_EVENTS,
                        last_id,
                        READ_BATCH,
                        READ_BLOCK,
                    ) => {
                        if entries.is_empty() {
                            continue;
                        }
                        for entry in entries {
                            last_id = entry.id;
                            forward_queue.push(entry.fields).await;
                        }
                    }
                    _ = ping.tick() => {
                        forward_queue.push(pong_frame()).await;
                    }
                }
            }
        });

        Subscription {
            queue,
            _forwarder: forwarder,
        }
    }

    pub fn unknown_job_error(&self, job_id: &str) -> Value {
        error_frame(&format!("unknown job id: {job_id}"))
    }
}

/// Parses an inbound WebSocket text frame. Only `{"type":"ping"}` is
/// recognized; anything else is reported back as an `error` frame without
/// closing the connection, matching the "invalid client frames don't kill
/// the connection" rule.
pub fn handle_client_frame(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v) if v.get("type").and_then(Value::as_str) == Some("ping") => pong_frame(),
        Ok(_) => error_frame("unrecognized frame"),
        Err(e) => {
            debug!(error = %e, "malformed client frame");
            error_frame("malformed json frame")
        }
    }
}

pub fn job_status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Planning => "PLANNING",
        JobStatus::Running => "RUNNING",
        JobStatus::Completed => "COMPLETED",
        JobStatus::Failed => "FAILED",
        JobStatus::Canceled => "CANCELED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> Value {
        json!({"event_type": event_type, "timestamp": chrono::Utc::now()})
    }

    #[tokio::test]
    async fn overflow_drops_oldest_non_terminal_and_marks_backpressure() {
        let queue = SubscriberQueue::new(2);
        queue.push(event("task_status_changed")).await;
        queue.push(event("task_status_changed")).await;
        queue.push(event("task_status_changed")).await;

        let first = queue.recv().await.unwrap();
        assert_eq!(first.get("event_type").unwrap(), "task_status_changed");
        let second = queue.recv().await.unwrap();
        assert_eq!(second.get("event_type").unwrap(), "backpressure");
    }

    #[tokio::test]
    async fn terminal_events_are_never_dropped() {
        let queue = SubscriberQueue::new(1);
        queue.push(event("task_completed")).await;
        queue.push(event("task_failed")).await;

        let first = queue.recv().await.unwrap();
        assert_eq!(first.get("event_type").unwrap(), "task_completed");
        let second = queue.recv().await.unwrap();
        assert_eq!(second.get("event_type").unwrap(), "task_failed");
    }

    #[tokio::test]
    async fn recv_returns_none_after_close_and_drain() {
        let queue = SubscriberQueue::new(4);
        queue.push(event("pong")).await;
        queue.close();
        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_job_subscription_returns_none() {
        let store = Arc::new(Store::new());
        let gateway = StreamingGateway::new(store, 64);
        assert!(gateway.subscribe_job("missing").await.is_none());
    }

    #[test]
    fn client_ping_frame_yields_pong() {
        let frame = handle_client_frame(r#"{"type":"ping"}"#);
        assert_eq!(frame.get("event_type").unwrap(), "pong");
    }

    #[test]
    fn malformed_client_frame_yields_error_without_panicking() {
        let frame = handle_client_frame("not json");
        assert_eq!(frame.get("event_type").unwrap(), "error");
    }
}
