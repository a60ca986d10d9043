use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::safe_json::{is_blocked_key, safe_json_value};
use crate::core::safety::{is_sensitive_key, sanitize_for_log, scrub, SanitizeOptions};

/// Value of `_sigAlg` on every entry this crate signs.
pub const SIGNATURE_ALGORITHM: &str = "HMAC-SHA256";

/// Longest string kept inside entry details.
pub const MAX_DETAIL_STRING_LEN: usize = 2048;

/// Serialized details larger than this are replaced by a truncation marker.
pub const MAX_DETAILS_BYTES: usize = 64 * 1024;

const MAX_EVENT_TYPE_LEN: usize = 100;

/// Stands in for values stored under sensitive keys.
pub const REDACTED: &str = "[REDACTED]";

/// Severity levels for audit events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Ord, PartialOrd, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditSeverity::Debug => write!(f, "DEBUG"),
            AuditSeverity::Info => write!(f, "INFO"),
            AuditSeverity::Warning => write!(f, "WARN"),
            AuditSeverity::Error => write!(f, "ERROR"),
            AuditSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl std::str::FromStr for AuditSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(AuditSeverity::Debug),
            "info" => Ok(AuditSeverity::Info),
            "warn" | "warning" => Ok(AuditSeverity::Warning),
            "error" => Ok(AuditSeverity::Error),
            "critical" => Ok(AuditSeverity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// Fixed vocabulary for security events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    RateLimitExceeded,
    RateLimitReset,
    StateTamperingDetected,
    FilePermissionMismatch,
    InvalidInput,
    SignatureInvalid,
    KeyRotated,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ViolationType::RateLimitReset => "RATE_LIMIT_RESET",
            ViolationType::StateTamperingDetected => "STATE_TAMPERING_DETECTED",
            ViolationType::FilePermissionMismatch => "FILE_PERMISSION_MISMATCH",
            ViolationType::InvalidInput => "INVALID_INPUT",
            ViolationType::SignatureInvalid => "SIGNATURE_INVALID",
            ViolationType::KeyRotated => "KEY_ROTATED",
        }
    }

    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            ViolationType::RateLimitExceeded => AuditSeverity::Warning,
            ViolationType::RateLimitReset => AuditSeverity::Warning,
            ViolationType::StateTamperingDetected => AuditSeverity::Critical,
            ViolationType::FilePermissionMismatch => AuditSeverity::Error,
            ViolationType::InvalidInput => AuditSeverity::Warning,
            ViolationType::SignatureInvalid => AuditSeverity::Critical,
            ViolationType::KeyRotated => AuditSeverity::Info,
        }
    }
}

impl std::fmt::Display for ViolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the audit log.
///
/// `id` and `timestamp` are fixed at creation. The underscore fields are
/// filled in by signing; `_keyId` is itself covered by the signature.
/// Unknown fields are kept in `extra` so they stay part of the signed form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<AuditSeverity>,
    #[serde(default)]
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "_keyId", default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(rename = "_signature", default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(rename = "_sigAlg", default, skip_serializing_if = "Option::is_none")]
    pub sig_alg: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuditEntry {
    pub fn new(event_type: impl Into<String>, details: Value) -> Self {
        Self::at(event_type, details, Utc::now())
    }

    /// Entry stamped with an explicit time
    pub fn at(event_type: impl Into<String>, details: Value, timestamp: DateTime<Utc>) -> Self {
        let event_type = sanitize_for_log(
            &event_type.into(),
            &SanitizeOptions::with_max_len(MAX_EVENT_TYPE_LEN),
        );

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: format_timestamp(&timestamp),
            event_type,
            severity: None,
            details,
            correlation_id: None,
            key_id: None,
            signature: None,
            sig_alg: None,
            extra: Map::new(),
        }
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Copy with all signing metadata removed
    pub fn unsigned(&self) -> Self {
        let mut entry = self.clone();
        entry.key_id = None;
        entry.signature = None;
        entry.sig_alg = None;
        entry
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// Human-readable single line for terminals
    pub fn to_log_line(&self) -> String {
        let severity = self
            .severity
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());

        let details_str = match &self.details {
            Value::Null => String::new(),
            Value::Object(map) if map.is_empty() => String::new(),
            d => format!(" | {}", d),
        };

        format!(
            "[{}] {} {}{}",
            self.timestamp,
            severity,
            self.event_type,
            sanitize_for_log(&details_str, &SanitizeOptions::default())
        )
    }
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Prepare caller-supplied details for persistence.
///
/// Every string (keys included) is sanitized and redacted. Values under
/// sensitive keys are replaced whole and blocked keys are dropped. Oversized
/// payloads collapse to a truncation marker.
pub fn scrub_details(details: Value) -> Value {
    safe_json_value(&scrub_node(details), MAX_DETAILS_BYTES)
}

fn scrub_node(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(scrub(&s, MAX_DETAIL_STRING_LEN)),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !is_blocked_key(k))
                .map(|(k, v)| {
                    let key = sanitize_for_log(&k, &SanitizeOptions::with_max_len(MAX_EVENT_TYPE_LEN));
                    let value = if is_sensitive_key(&key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        scrub_node(v)
                    };
                    (key, value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(scrub_node).collect()),
        other => other,
    }
}
