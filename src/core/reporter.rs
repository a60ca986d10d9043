use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::core::audit::AuditLog;
pub use crate::core::audit::ViolationType;
use crate::core::safe_json::safe_json_stringify;
use crate::core::safety::{sanitize_for_log, SanitizeOptions};

const MAX_CONTEXT_FIELD_LEN: usize = 200;
const LOG_DETAILS_MAX_BYTES: usize = 2048;

/// Who/what triggered a security event
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EventContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EventContext {
    pub fn for_command(command: &str) -> Self {
        Self {
            command: Some(clean_field(command)),
            ..Default::default()
        }
    }

    /// Context for the invoking OS user
    pub fn current_user(command: &str) -> Self {
        let actor = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok();

        Self {
            actor: actor.map(|a| clean_field(&a)),
            ..Self::for_command(command)
        }
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = Some(clean_field(actor));
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(clean_field(source));
        self
    }
}

fn clean_field(raw: &str) -> String {
    sanitize_for_log(raw, &SanitizeOptions::with_max_len(MAX_CONTEXT_FIELD_LEN))
}

/// Anything that can take a security event. Recording never fails from
/// the caller's point of view.
pub trait SecurityEventSink: Send + Sync {
    fn record(&self, violation: ViolationType, details: Value, context: &EventContext);
}

/// Writes security events into the audit log as signed entries.
pub struct SecurityReporter {
    audit: Arc<AuditLog>,
}

impl SecurityReporter {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Fire-and-forget: emits a warning log line and appends a signed entry.
    pub fn log_security_violation(&self, violation: ViolationType, details: Value, context: &EventContext) {
        let details = merge_context(details, context);

        warn!(
            violation = %violation,
            details = %safe_json_stringify(&details, LOG_DETAILS_MAX_BYTES),
            "Security event"
        );

        if !self
            .audit
            .log_event(violation.as_str(), violation.default_severity(), details)
        {
            warn!(violation = %violation, "Security event could not be written to the audit log");
        }
    }
}

impl SecurityEventSink for SecurityReporter {
    fn record(&self, violation: ViolationType, details: Value, context: &EventContext) {
        self.log_security_violation(violation, details, context);
    }
}

/// Sink that only logs. Used when the audit log is switched off.
#[derive(Debug, Default)]
pub struct TracingSink;

impl SecurityEventSink for TracingSink {
    fn record(&self, violation: ViolationType, details: Value, context: &EventContext) {
        let details = merge_context(details, context);
        warn!(
            violation = %violation,
            details = %safe_json_stringify(&details, LOG_DETAILS_MAX_BYTES),
            "Security event (audit disabled)"
        );
    }
}

/// Keeps events in memory; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(ViolationType, Value)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(ViolationType, Value)> {
        self.events.lock().map(|e| e.to_vec()).unwrap_or_default()
    }

    pub fn count(&self, violation: ViolationType) -> usize {
        self.events()
            .iter()
            .filter(|(v, _)| *v == violation)
            .count()
    }
}

impl SecurityEventSink for MemorySink {
    fn record(&self, violation: ViolationType, details: Value, context: &EventContext) {
        if let Ok(mut events) = self.events.lock() {
            events.push((violation, merge_context(details, context)));
        }
    }
}

fn merge_context(details: Value, context: &EventContext) -> Value {
    let mut map = match details {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    if *context != EventContext::default() {
        map.insert("context".to_string(), json!(context));
    }

    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditSettings;
    use crate::core::clock::SystemClock;
    use crate::core::correlation::FixedCorrelation;
    use tempfile::tempdir;

    #[test]
    fn test_violation_written_to_audit_log() {
        let dir = tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(
            dir.path(),
            AuditSettings::default(),
            Arc::new(SystemClock),
            Arc::new(FixedCorrelation::none()),
        ));
        let reporter = SecurityReporter::new(audit.clone());

        reporter.log_security_violation(
            ViolationType::RateLimitExceeded,
            json!({"command": "deploy", "max": 3}),
            &EventContext::for_command("deploy").with_actor("ci-bot"),
        );

        let entries = audit.read_recent(5);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, "RATE_LIMIT_EXCEEDED");
        assert_eq!(entries[0].details["context"]["actor"], "ci-bot");
        assert!(audit.verify_entry(&entries[0]));
    }

    #[test]
    fn test_context_fields_are_sanitized() {
        let ctx = EventContext::for_command("deploy\nFAKE").with_source("\x1b[2Jcli");
        assert_eq!(ctx.command.as_deref(), Some("deploy\\nFAKE"));
        assert_eq!(ctx.source.as_deref(), Some("cli"));
    }

    #[test]
    fn test_memory_sink_merges_context() {
        let sink = MemorySink::new();
        sink.record(
            ViolationType::InvalidInput,
            json!("bad"),
            &EventContext::for_command("x"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["value"], "bad");
        assert_eq!(events[0].1["context"]["command"], "x");
        assert_eq!(sink.count(ViolationType::InvalidInput), 1);
    }
}
