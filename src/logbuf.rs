//! In-memory log ring for SSE streaming.
//!
//! One bounded FIFO per work order id, guarded by a single mutex; critical
//! sections are dictionary and deque operations only. Entries for idle work
//! orders are evicted after an hour so long-lived processes don't accumulate
//! dead buffers.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const MAX_LOGS_PER_WORK_ORDER: usize = 1000;
pub const CLEANUP_THRESHOLD: Duration = Duration::from_secs(3600);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// One buffered log record. Arbitrary structured fields ride in `fields`
/// and are flattened into the serialized object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub work_order_id: String,
    pub level: String,
    pub event: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogEntry {
    fn step(&self) -> Option<&str> {
        self.fields.get("step").and_then(Value::as_str)
    }
}

/// Filters applied by [`LogBuffer::get`]. `since` is strict (entries with
/// `timestamp > since`); timestamps are RFC 3339 UTC so plain string
/// comparison is chronological.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub step: Option<String>,
    pub since: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Default)]
struct Inner {
    buffers: HashMap<String, VecDeque<LogEntry>>,
    last_activity: HashMap<String, Instant>,
}

#[derive(Default)]
pub struct LogBuffer {
    inner: Mutex<Inner>,
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        work_order_id: &str,
        level: &str,
        event: &str,
        timestamp: Option<String>,
        fields: Map<String, Value>,
    ) {
        let entry = LogEntry {
            work_order_id: work_order_id.to_string(),
            level: level.to_string(),
            event: event.to_string(),
            timestamp: timestamp.unwrap_or_else(now_timestamp),
            fields,
        };
        let mut inner = self.inner.lock();
        let buffer = inner.buffers.entry(work_order_id.to_string()).or_default();
        if buffer.len() == MAX_LOGS_PER_WORK_ORDER {
            buffer.pop_front();
        }
        buffer.push_back(entry);
        inner
            .last_activity
            .insert(work_order_id.to_string(), Instant::now());
    }

    /// Snapshot of the work order's entries matching the query, in
    /// chronological (insertion) order.
    pub fn get(&self, work_order_id: &str, query: &LogQuery) -> Vec<LogEntry> {
        let snapshot: Vec<LogEntry> = {
            let inner = self.inner.lock();
            match inner.buffers.get(work_order_id) {
                Some(buffer) => buffer.iter().cloned().collect(),
                None => return Vec::new(),
            }
        };

        let filtered = snapshot.into_iter().filter(|entry| {
            if let Some(level) = &query.level {
                if !entry.level.eq_ignore_ascii_case(level) {
                    return false;
                }
            }
            if let Some(step) = &query.step {
                if entry.step() != Some(step.as_str()) {
                    return false;
                }
            }
            if let Some(since) = &query.since {
                if entry.timestamp.as_str() <= since.as_str() {
                    return false;
                }
            }
            true
        });

        let filtered = filtered.skip(query.offset);
        match query.limit {
            Some(limit) => filtered.take(limit).collect(),
            None => filtered.collect(),
        }
    }

    /// Entries strictly newer than `since`, for tailing.
    pub fn get_since(
        &self,
        work_order_id: &str,
        since: &str,
        level: Option<&str>,
        step: Option<&str>,
    ) -> Vec<LogEntry> {
        self.get(
            work_order_id,
            &LogQuery {
                level: level.map(str::to_string),
                step: step.map(str::to_string),
                since: Some(since.to_string()),
                ..LogQuery::default()
            },
        )
    }

    pub fn clear(&self, work_order_id: &str) {
        let mut inner = self.inner.lock();
        inner.buffers.remove(work_order_id);
        inner.last_activity.remove(work_order_id);
    }

    /// Evict ids whose last activity is older than `threshold`. Returns how
    /// many were dropped.
    pub fn cleanup_old(&self, threshold: Duration) -> usize {
        let mut inner = self.inner.lock();
        let stale: Vec<String> = inner
            .last_activity
            .iter()
            .filter(|(_, at)| at.elapsed() > threshold)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.buffers.remove(id);
            inner.last_activity.remove(id);
        }
        stale.len()
    }

    pub fn work_order_count(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn log_count(&self, work_order_id: &str) -> usize {
        self.inner
            .lock()
            .buffers
            .get(work_order_id)
            .map_or(0, VecDeque::len)
    }
}

/// Run `cleanup_old` every [`CLEANUP_INTERVAL`] until the token is
/// cancelled.
pub fn spawn_cleanup_task(buffer: Arc<LogBuffer>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                    let removed = buffer.cleanup_old(CLEANUP_THRESHOLD);
                    if removed > 0 {
                        debug!(removed, "log_buffer_cleanup_completed");
                    }
                }
            }
        }
    })
}
