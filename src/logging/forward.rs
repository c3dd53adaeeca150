//! `tracing` layer that mirrors application events into a [`Logger`].

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::logger::Logger;
use super::transformer::LogOptions;

/// Targets never forwarded: the pipeline itself and the HTTP stack it drives.
const EXCLUDED_TARGETS: &[&str] = &["docgen::logging", "reqwest", "hyper", "h2", "rustls"];

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedEvent {
    pub level: &'static str,
    pub payload: Value,
}

/// Captures events and queues them on an unbounded channel.
#[derive(Debug, Clone)]
pub struct ForwardLayer {
    tx: mpsc::UnboundedSender<ForwardedEvent>,
}

impl ForwardLayer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ForwardedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<S> Layer<S> for ForwardLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_excluded(metadata.target()) {
            return;
        }

        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        let _ = self.tx.send(ForwardedEvent {
            level: level_name(*metadata.level()),
            payload: visitor.into_payload(),
        });
    }
}

/// Drain forwarded events into `logger` until every layer handle is gone.
pub fn spawn_forwarder(
    logger: Arc<Logger>,
    mut events: mpsc::UnboundedReceiver<ForwardedEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            logger
                .log(&event.payload, &LogOptions::level(event.level))
                .await;
        }
    })
}

fn is_excluded(target: &str) -> bool {
    EXCLUDED_TARGETS.iter().any(|prefix| {
        target
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldCollector {
    /// Plain events become text; events with fields become structured data.
    fn into_payload(self) -> Value {
        if self.fields.is_empty() {
            return self.message.map(Value::String).unwrap_or(Value::Null);
        }
        let mut fields = self.fields;
        if let Some(message) = self.message {
            fields.insert("message".to_string(), Value::String(message));
        }
        Value::Object(fields)
    }

    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(text) => text,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }
}
