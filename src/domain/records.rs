//! Canonical common-logging record shipped to the remote collector.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One normalised log entry.
///
/// Exactly one of `message` and `data` is populated; the transformer discards
/// inputs that would produce neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    pub pattern: String,
    pub level: String,
    pub retention: String,
    pub env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl LogRecord {
    /// Single-line rendering used by the stdout transport.
    pub fn display_line(&self) -> String {
        match (&self.message, &self.data) {
            (Some(message), _) => message.trim().to_string(),
            (None, Some(data)) => Value::Object(data.clone()).to_string(),
            (None, None) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serialises_without_absent_fields() {
        let record = LogRecord {
            message: Some("started".into()),
            data: None,
            pattern: String::new(),
            level: "info".into(),
            retention: "default".into(),
            env: "dev".into(),
            metadata: None,
        };

        let value = serde_json::to_value(&record).expect("serialise");
        assert_eq!(
            value,
            json!({
                "message": "started",
                "pattern": "",
                "level": "info",
                "retention": "default",
                "env": "dev"
            })
        );
    }

    #[test]
    fn display_line_prefers_message_then_data() {
        let mut data = Map::new();
        data.insert("x".into(), json!("42"));
        let record = LogRecord {
            message: None,
            data: Some(data),
            pattern: String::new(),
            level: "info".into(),
            retention: "default".into(),
            env: "dev".into(),
            metadata: None,
        };
        assert_eq!(record.display_line(), r#"{"x":"42"}"#);
    }
}
