//! Tracing setup.
//!
//! Events use the `<subsystem>_<noun>_<verb_past_tense>` naming convention
//! as their message (`workflow_started`, `sandbox_cleanup_completed`), with
//! structured fields alongside. Each workflow runs inside a span carrying
//! its `work_order_id`; [`BufferLayer`] forwards every event that can be
//! attributed to a work order (via event field or enclosing span) into the
//! in-memory log buffer that backs the SSE stream.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{
    field::{Field, Visit},
    span::{Attributes, Id},
    Event, Level, Subscriber,
};
use tracing_subscriber::{
    layer::{Context, SubscriberExt as _},
    registry::LookupSpan,
    util::SubscriberInitExt as _,
    EnvFilter, Layer,
};

use crate::logbuf::LogBuffer;

/// Install the global subscriber: console formatting plus the log-buffer
/// sink, filtered by `RUST_LOG` when set, else `log_level`.
pub fn init(log_level: &str, buffer: Arc<LogBuffer>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    // try_init so a second call (tests, embedding) is harmless.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(BufferLayer::new(buffer))
        .try_init();
}

/// Forwards events into the [`LogBuffer`] whenever a `work_order_id` is in
/// scope. Sink errors don't exist here by construction: the buffer is
/// lock-and-push only.
pub struct BufferLayer {
    buffer: Arc<LogBuffer>,
}

impl BufferLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

// Span fields captured at creation so events inside the span can inherit
// the work order id.
struct SpanFields(Map<String, Value>);

impl<S> Layer<S> for BufferLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        if visitor.fields.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanFields(visitor.fields));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut work_order_id = visitor
            .fields
            .get("work_order_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        if work_order_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope.from_root() {
                    if let Some(fields) = span.extensions().get::<SpanFields>() {
                        if let Some(id) = fields.0.get("work_order_id").and_then(Value::as_str) {
                            work_order_id = Some(id.to_string());
                        }
                    }
                }
            }
        }
        let Some(work_order_id) = work_order_id else {
            return;
        };

        let event_name = visitor
            .message
            .unwrap_or_else(|| event.metadata().name().to_string());
        let mut fields = visitor.fields;
        fields.remove("work_order_id");
        self.buffer.add(
            &work_order_id,
            level_name(*event.metadata().level()),
            &event_name,
            None,
            fields,
        );
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warning",
        Level::INFO => "info",
        Level::DEBUG | Level::TRACE => "debug",
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl Visit for JsonVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // The message of e.g. info!("workflow_started") lands here as
        // fmt::Arguments, whose Debug impl is the formatted text.
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields
                .insert(field.name().to_string(), Value::from(rendered));
        }
    }
}
