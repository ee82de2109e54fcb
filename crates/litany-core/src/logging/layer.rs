//! A tracing layer that writes every event to the instance's JSONL file.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::entry::{JsonLogEntry, LogInstance};
use super::writer::InstanceLogWriter;

/// Writes events to `logs/raw/<date>_<instance>.jsonl`
#[derive(Clone)]
pub struct JsonlLayer {
    writer: Arc<InstanceLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, instance: LogInstance) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(InstanceLogWriter::new(logs_dir, instance)?),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn instance(&self) -> &str {
        self.writer.instance()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = JsonLogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.instance(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );

        if !visitor.fields.is_empty() {
            entry = entry.with_fields(Value::Object(visitor.fields));
        }

        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        // A failing log write must never take the chat down
        let _ = self.writer.write(&entry);
    }
}

/// Collects the message and structured fields of an event
#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }

    fn insert_text(&mut self, field: &Field, text: String) {
        if field.name() == "message" {
            self.message = Some(text);
        } else {
            self.insert(field, Value::String(text));
        }
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(buf, "{:?}", value);
        self.insert_text(field, buf);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert_text(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;
    use tempfile::TempDir;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_jsonl_layer_captures_events() {
        let temp = TempDir::new().unwrap();
        let layer = JsonlLayer::new(temp.path(), LogInstance::Chat(PeerId::new(2).unwrap())).unwrap();
        let log_path = layer.log_path().to_path_buf();

        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let peer = PeerId::new(2).unwrap();
            tracing::info!(%peer, "Tunnel established");
            tracing::warn!(id = 42u64, len = 5usize, "Resending message");
        });

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first = JsonLogEntry::from_json_line(lines[0]).unwrap();
        assert_eq!(first.level, "info");
        assert_eq!(first.instance, "chat-02");
        assert_eq!(first.msg, "Tunnel established");
        assert_eq!(first.field("peer"), Some(&Value::String("02".into())));

        let second = JsonLogEntry::from_json_line(lines[1]).unwrap();
        assert_eq!(second.level, "warn");
        assert_eq!(second.field("id"), Some(&Value::from(42u64)));
    }

    #[test]
    fn test_span_names_are_recorded() {
        let temp = TempDir::new().unwrap();
        let layer = JsonlLayer::new(temp.path(), LogInstance::Roster).unwrap();
        let log_path = layer.log_path().to_path_buf();

        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("liturgy");
            let _guard = span.enter();
            tracing::debug!("Sending liturgy");
        });

        let content = std::fs::read_to_string(&log_path).unwrap();
        let entry = JsonLogEntry::from_json_line(content.trim()).unwrap();
        assert_eq!(entry.span.as_deref(), Some("liturgy"));
    }
}
