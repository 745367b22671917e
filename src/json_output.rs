//! JSON Output for robot and queue events
//!
//! One JSON object per line on stdout, so the daemon's output can be piped
//! into external tools and monitoring systems.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::audit::{AuditCategory, UsageRecord};
use crate::signals::Signal;

/// Get current timestamp as f64 seconds since UNIX epoch with consistent precision
pub fn current_timestamp() -> f64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    // Round to 6 decimal places for consistent formatting
    (timestamp * 1_000_000.0).round() / 1_000_000.0
}

/// A signal stamped with the time it was written out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub timestamp: f64,
    #[serde(flatten)]
    pub signal: Signal,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub category: AuditCategory,
    pub message: String,
}

/// Usage fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub record: UsageRecord,
}

/// Request or processing error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
}

impl SignalEvent {
    pub fn new(signal: Signal) -> Self {
        Self {
            timestamp: current_timestamp(),
            signal,
        }
    }
}

impl AuditEvent {
    pub fn new(message: &str, category: AuditCategory) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "audit".to_string(),
            category,
            message: message.to_string(),
        }
    }
}

impl UsageEvent {
    pub fn new(record: UsageRecord) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "usage".to_string(),
            record,
        }
    }
}

impl ErrorEvent {
    pub fn new(error: &str, request: Option<&str>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            error: error.to_string(),
            request: request.map(str::to_string),
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}

/// Convenience functions for outputting specific event types
pub mod output {
    use super::*;

    pub fn signal(signal: Signal) {
        output_event(&SignalEvent::new(signal));
    }

    pub fn audit(message: &str, category: AuditCategory) {
        output_event(&AuditEvent::new(message, category));
    }

    pub fn usage(record: UsageRecord) {
        output_event(&UsageEvent::new(record));
    }

    pub fn error(error: &str, request: Option<&str>) {
        output_event(&ErrorEvent::new(error, request));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::UsageSubject;
    use chrono::Utc;

    #[test]
    fn test_signal_event_is_flat() {
        let json = serde_json::to_value(SignalEvent::new(Signal::Progress { current: 1, total: 3 })).unwrap();

        assert_eq!(json["type"], "progress");
        assert_eq!(json["current"], 1);
        assert_eq!(json["total"], 3);
        assert!(json["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_usage_event_carries_record() {
        let record = UsageRecord {
            subject: UsageSubject::Ingredient(4),
            context_id: Some(9),
            recorded_at: Utc::now(),
        };
        let line = serde_json::to_string(&UsageEvent::new(record)).unwrap();
        assert_eq!(line.matches("\"timestamp\"").count(), 1);

        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["type"], "usage");
        assert_eq!(json["subject"]["ingredient"], 4);
        assert_eq!(json["context_id"], 9);
        assert!(json["timestamp"].is_f64());
        assert!(json["recorded_at"].is_string());
    }

    #[test]
    fn test_error_event_omits_missing_request() {
        let json = serde_json::to_string(&ErrorEvent::new("Not found: drink 3", None)).unwrap();
        assert!(!json.contains("request"));
    }
}
