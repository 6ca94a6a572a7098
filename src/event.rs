//! Event record shared by the collection engine and the publish pipeline.
//!
//! The JSON form of [`Event`] is the body of every message published to the
//! broker, so field names here are part of the wire contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event severity, following the Windows event type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    AuditSuccess,
    AuditFailure,
}

impl Severity {
    /// Get all severities, ordered by their event type code.
    pub fn all() -> &'static [Severity] {
        &[
            Severity::Info,
            Severity::Warning,
            Severity::Error,
            Severity::AuditSuccess,
            Severity::AuditFailure,
        ]
    }

    /// Numeric event type code used by the event log (1 to 5).
    pub fn code(&self) -> u8 {
        match self {
            Severity::Info => 1,
            Severity::Warning => 2,
            Severity::Error => 3,
            Severity::AuditSuccess => 4,
            Severity::AuditFailure => 5,
        }
    }

    /// Look up a severity by its event type code.
    pub fn from_code(code: u8) -> Option<Severity> {
        Severity::all().iter().copied().find(|s| s.code() == code)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::AuditSuccess => write!(f, "audit_success"),
            Severity::AuditFailure => write!(f, "audit_failure"),
        }
    }
}

/// A single event read from a log channel.
///
/// Events are built whole by a source and never modified afterwards; the
/// pipeline moves them by value from the sink to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Record id assigned by the source
    pub id: u64,

    /// When the event occurred, at second resolution
    pub timestamp: DateTime<Utc>,

    /// Provider that emitted the event
    pub source: String,

    /// Event severity
    pub severity: Severity,

    /// Grouping label, the canonical name of the log
    pub category: String,

    /// Event text, never truncated by the pipeline
    pub message: String,

    /// Host the event was collected on
    pub origin_host: String,

    /// Channel the event was read from
    pub log_channel: String,
}

impl Event {
    /// Serialize the event into the UTF-8 JSON document published to the broker.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse an event from a published message body.
    pub fn from_json_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    /// Build an event with a fixed timestamp and the given id.
    pub fn event(id: u64) -> Event {
        Event {
            id,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 15).unwrap(),
            source: "Service Control Manager".to_string(),
            severity: Severity::Info,
            category: "System".to_string(),
            message: format!("test event {}", id),
            origin_host: "test-host".to_string(),
            log_channel: "System".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_serialization() {
        assert_eq!(
            serde_json::to_string(&Severity::AuditFailure).unwrap(),
            r#""audit_failure""#
        );
        let severity: Severity = serde_json::from_str(r#""warning""#).unwrap();
        assert_eq!(severity, Severity::Warning);
    }

    #[test]
    fn test_severity_codes() {
        for severity in Severity::all() {
            assert_eq!(Severity::from_code(severity.code()), Some(*severity));
        }
        assert_eq!(Severity::Info.code(), 1);
        assert_eq!(Severity::AuditFailure.code(), 5);
        assert_eq!(Severity::from_code(0), None);
        assert_eq!(Severity::from_code(6), None);
    }

    #[test]
    fn test_severity_display_matches_serde() {
        for severity in Severity::all() {
            let json = serde_json::to_string(severity).unwrap();
            assert_eq!(json, format!("\"{}\"", severity));
        }
    }

    #[test]
    fn test_event_json_field_names() {
        let event = fixtures::event(4242);
        let value: serde_json::Value = serde_json::from_slice(&event.to_json_bytes().unwrap()).unwrap();

        assert_eq!(value["id"], 4242);
        assert_eq!(value["timestamp"], "2024-03-01T12:30:15Z");
        assert_eq!(value["source"], "Service Control Manager");
        assert_eq!(value["severity"], "info");
        assert_eq!(value["category"], "System");
        assert_eq!(value["origin_host"], "test-host");
        assert_eq!(value["log_channel"], "System");
    }

    #[test]
    fn test_event_round_trip_preserves_all_fields() {
        let mut event = fixtures::event(7);
        event.severity = Severity::AuditSuccess;
        event.message = "Успешный вход в систему ".repeat(500);

        let body = event.to_json_bytes().unwrap();
        let decoded = Event::from_json_bytes(&body).unwrap();

        assert_eq!(decoded, event);
        assert_eq!(decoded.message.len(), event.message.len());
    }

    #[test]
    fn test_event_body_is_utf8() {
        let mut event = fixtures::event(1);
        event.message = "Сервер DNS запущен".to_string();
        let body = event.to_json_bytes().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("Сервер DNS запущен"));
    }
}
