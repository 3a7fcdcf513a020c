//! Server-sent-events log streaming: replay what's buffered, then tail.
//!
//! The stream itself is expressed over a small event enum so it can be
//! tested without dressing entries up as wire-format SSE frames; the axum
//! layer maps it onto `Event`s. Client disconnect just drops the stream,
//! which ends the generator cleanly.

use std::{convert::Infallible, sync::Arc, time::Duration};

use async_stream::stream;
use axum::response::sse::{Event, Sse};
use futures::{Stream, StreamExt as _};
use tracing::warn;

use crate::logbuf::{LogBuffer, LogEntry, LogQuery};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
// 30 polls x 0.5s = a keep-alive comment roughly every 15 seconds, enough
// to stop proxies from reaping an idle connection.
const POLLS_PER_KEEPALIVE: u32 = 30;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Entry(LogEntry),
    KeepAlive,
}

/// Optional filters for a log stream.
#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    pub level: Option<String>,
    pub step: Option<String>,
    pub since: Option<String>,
}

/// Yield the already-buffered entries matching the filter, then poll for
/// new ones every 0.5s, emitting a keep-alive marker during quiet spells.
pub fn log_stream(
    buffer: Arc<LogBuffer>,
    work_order_id: String,
    filter: StreamFilter,
) -> impl Stream<Item = StreamEvent> {
    stream! {
        let existing = buffer.get(
            &work_order_id,
            &LogQuery {
                level: filter.level.clone(),
                step: filter.step.clone(),
                since: filter.since.clone(),
                ..LogQuery::default()
            },
        );

        // High-watermark: everything yielded so far is <= this timestamp.
        let mut last_timestamp = existing
            .last()
            .map(|entry| entry.timestamp.clone())
            .or(filter.since.clone())
            .unwrap_or_default();
        for entry in existing {
            yield StreamEvent::Entry(entry);
        }

        let mut polls_since_keepalive = 0u32;
        loop {
            let fresh = buffer.get_since(
                &work_order_id,
                &last_timestamp,
                filter.level.as_deref(),
                filter.step.as_deref(),
            );
            for entry in fresh {
                last_timestamp = entry.timestamp.clone();
                yield StreamEvent::Entry(entry);
            }

            polls_since_keepalive += 1;
            if polls_since_keepalive >= POLLS_PER_KEEPALIVE {
                polls_since_keepalive = 0;
                yield StreamEvent::KeepAlive;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// The same stream dressed up as an SSE response.
pub fn sse_response(
    buffer: Arc<LogBuffer>,
    work_order_id: String,
    filter: StreamFilter,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = log_stream(buffer, work_order_id, filter).map(|event| {
        Ok(match event {
            StreamEvent::KeepAlive => Event::default().comment("keepalive"),
            StreamEvent::Entry(entry) => match serde_json::to_string(&entry) {
                Ok(data) => Event::default().data(data),
                Err(err) => {
                    // Can't happen for a LogEntry, but don't kill the
                    // stream over it.
                    warn!(error = %err, "log_entry_serialization_failed");
                    Event::default().comment("serialization-error")
                }
            },
        })
    });
    Sse::new(events)
}
