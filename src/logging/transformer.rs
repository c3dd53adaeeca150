//! Normalises arbitrary log input into [`LogRecord`]s.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::domain::records::LogRecord;

pub const DEFAULT_ENV: &str = "development";
pub const DEFAULT_LEVEL: &str = "info";
pub const DEFAULT_RETENTION: &str = "default";

/// Attempts to turn a text message into structured data.
pub type ParseFn = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;

/// Instance-wide defaults applied to every record.
#[derive(Debug, Clone, Default)]
pub struct TransformerConfig {
    pub env: Option<String>,
    pub level: Option<String>,
    pub pattern: Option<String>,
    pub retention: Option<String>,
    /// Attached verbatim to every record.
    pub metadata: Option<Map<String, Value>>,
    /// Default fields merged into structured messages.
    pub data: Option<Map<String, Value>>,
}

/// Per-call overrides. Anything unset falls back to the instance defaults.
#[derive(Clone, Default)]
pub struct LogOptions {
    pub env: Option<String>,
    pub level: Option<String>,
    pub pattern: Option<String>,
    pub retention: Option<String>,
    pub parse: Option<ParseFn>,
}

impl LogOptions {
    pub fn level(level: impl Into<String>) -> Self {
        Self {
            level: Some(level.into()),
            ..Default::default()
        }
    }

    pub fn with_parser<F>(mut self, parse: F) -> Self
    where
        F: Fn(&str) -> Option<Value> + Send + Sync + 'static,
    {
        self.parse = Some(Arc::new(parse));
        self
    }
}

impl fmt::Debug for LogOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOptions")
            .field("env", &self.env)
            .field("level", &self.level)
            .field("pattern", &self.pattern)
            .field("retention", &self.retention)
            .field("parse", &self.parse.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Defaults {
    env: String,
    level: String,
    pattern: String,
    retention: String,
}

#[derive(Debug, Clone)]
pub struct Transformer {
    defaults: Defaults,
    metadata: Option<Map<String, Value>>,
    data: Option<Map<String, Value>>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new(TransformerConfig::default())
    }
}

impl Transformer {
    pub fn new(config: TransformerConfig) -> Self {
        let pick = |value: Option<String>, fallback: &str| {
            value
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };

        Self {
            defaults: Defaults {
                env: pick(config.env, DEFAULT_ENV),
                level: pick(config.level, DEFAULT_LEVEL),
                pattern: config.pattern.unwrap_or_default(),
                retention: pick(config.retention, DEFAULT_RETENTION),
            },
            metadata: config.metadata,
            data: config.data,
        }
    }

    /// Build a record from `message`, or `None` when nothing loggable remains.
    ///
    /// Strings are trimmed and, when a parser is supplied and succeeds, become
    /// structured `data`. Objects become `data` directly and arrays are
    /// wrapped as `{"value": [..]}`; either way the instance default fields
    /// are filled in where the caller left them out.
    pub fn xform(&self, message: &Value, options: &LogOptions) -> Option<LogRecord> {
        if is_falsy(message) {
            return None;
        }

        let mut text = None;
        let mut data = None;

        match message {
            Value::String(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    let parsed = options
                        .parse
                        .as_ref()
                        .and_then(|parse| parse(trimmed))
                        .filter(|value| !is_falsy(value));
                    match parsed {
                        Some(Value::Object(fields)) => data = Some(fields),
                        Some(other) => data = Some(wrap_value(other)),
                        None => text = Some(trimmed.to_string()),
                    }
                }
            }
            Value::Object(fields) => data = Some(self.with_default_data(fields.clone())),
            Value::Array(_) => data = Some(self.with_default_data(wrap_value(message.clone()))),
            _ => {}
        }

        if text.is_none() && data.is_none() {
            return None;
        }

        let choose = |value: &Option<String>, fallback: &String| {
            value
                .as_ref()
                .filter(|value| !value.is_empty())
                .unwrap_or(fallback)
                .clone()
        };

        Some(LogRecord {
            message: text,
            data,
            pattern: choose(&options.pattern, &self.defaults.pattern),
            level: choose(&options.level, &self.defaults.level),
            retention: choose(&options.retention, &self.defaults.retention),
            env: choose(&options.env, &self.defaults.env),
            metadata: self.metadata.clone(),
        })
    }

    fn with_default_data(&self, mut fields: Map<String, Value>) -> Map<String, Value> {
        if let Some(defaults) = &self.data {
            for (key, value) in defaults {
                fields.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        fields
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n == 0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn wrap_value(value: Value) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("value".to_string(), value);
    fields
}
