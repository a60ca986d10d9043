use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::entry::parse_timestamp;
use super::signing::{verify_with_ring, SigningKey};
use crate::core::safe_json::safe_json_parse;

/// Nesting allowed for a single audit line
pub const AUDIT_LINE_MAX_DEPTH: usize = 32;

/// Options for an integrity scan
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    /// Only look at entries from the last N hours
    pub hours: Option<u64>,
    /// Collect per-line diagnostics
    pub verbose: bool,
}

/// A single problem found during a scan
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub file: String,
    pub line: usize,
    pub error: String,
}

/// Aggregate result of [`AuditLog::verify_integrity`](super::AuditLog::verify_integrity)
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub valid: bool,
    pub total_entries: usize,
    pub valid_signatures: usize,
    pub invalid_signatures: usize,
    pub unsigned_entries: usize,
    pub parse_errors: usize,
    pub files_checked: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<IntegrityIssue>,
}

/// How one line of a log file classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineStatus {
    Valid,
    Invalid,
    Unsigned,
    /// Older than the requested window
    OutsideWindow,
    Malformed(String),
}

/// Classify one raw log line. Never panics on hostile input.
pub fn classify_line(line: &str, cutoff: Option<DateTime<Utc>>, ring: &[SigningKey]) -> LineStatus {
    let Some(value) = safe_json_parse(line, AUDIT_LINE_MAX_DEPTH, false) else {
        return LineStatus::Malformed("unparseable or unsafe JSON".to_string());
    };

    if !value.is_object() {
        return LineStatus::Malformed("entry is not a JSON object".to_string());
    }

    if let Some(cutoff) = cutoff {
        let timestamp = value
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        // Entries without a readable timestamp can't be shown to be old, so they stay in
        if matches!(timestamp, Some(ts) if ts < cutoff) {
            return LineStatus::OutsideWindow;
        }
    }

    if value.get("_signature").is_none() {
        return LineStatus::Unsigned;
    }

    if verify_with_ring(&value, ring) {
        LineStatus::Valid
    } else {
        LineStatus::Invalid
    }
}

impl IntegrityReport {
    pub fn record(&mut self, file: &str, line: usize, status: LineStatus, verbose: bool) {
        match status {
            LineStatus::OutsideWindow => {}
            LineStatus::Valid => {
                self.total_entries += 1;
                self.valid_signatures += 1;
            }
            LineStatus::Unsigned => {
                self.total_entries += 1;
                self.unsigned_entries += 1;
            }
            LineStatus::Invalid => {
                self.total_entries += 1;
                self.invalid_signatures += 1;
                if verbose {
                    self.push_issue(file, line, "signature mismatch");
                }
            }
            LineStatus::Malformed(reason) => {
                self.parse_errors += 1;
                if verbose {
                    self.push_issue(file, line, &reason);
                }
            }
        }
    }

    pub fn record_unreadable(&mut self, file: &str, error: &str) {
        self.parse_errors += 1;
        self.push_issue(file, 0, error);
    }

    pub fn finish(mut self) -> Self {
        self.valid = self.invalid_signatures == 0 && self.parse_errors == 0;
        self
    }

    fn push_issue(&mut self, file: &str, line: usize, error: &str) {
        self.errors.push(IntegrityIssue {
            file: file.to_string(),
            line,
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::entry::AuditEntry;
    use crate::core::audit::signing::{sign_entry, KEY_LEN};
    use chrono::Duration;
    use serde_json::json;

    fn ring() -> Vec<SigningKey> {
        vec![SigningKey::from_bytes(&[3u8; KEY_LEN]).unwrap()]
    }

    fn signed_line(entry: &AuditEntry) -> String {
        serde_json::to_string(&sign_entry(entry, &ring()[0])).unwrap()
    }

    #[test]
    fn test_classify_valid_and_unsigned() {
        let entry = AuditEntry::new("X", json!({}));
        assert_eq!(classify_line(&signed_line(&entry), None, &ring()), LineStatus::Valid);

        let unsigned = serde_json::to_string(&entry).unwrap();
        assert_eq!(classify_line(&unsigned, None, &ring()), LineStatus::Unsigned);
    }

    #[test]
    fn test_classify_tampered() {
        let line = signed_line(&AuditEntry::new("X", json!({"user": "alice"})));
        let tampered = line.replace("alice", "mallory");
        assert_eq!(classify_line(&tampered, None, &ring()), LineStatus::Invalid);
    }

    #[test]
    fn test_classify_malformed() {
        assert!(matches!(
            classify_line("{broken", None, &ring()),
            LineStatus::Malformed(_)
        ));
        assert!(matches!(
            classify_line("[1,2]", None, &ring()),
            LineStatus::Malformed(_)
        ));
        assert!(matches!(
            classify_line(r#"{"__proto__": {}}"#, None, &ring()),
            LineStatus::Malformed(_)
        ));
    }

    #[test]
    fn test_window_cutoff() {
        let old = AuditEntry::at("X", json!({}), Utc::now() - Duration::hours(5));
        let cutoff = Some(Utc::now() - Duration::hours(1));
        assert_eq!(
            classify_line(&signed_line(&old), cutoff, &ring()),
            LineStatus::OutsideWindow
        );
    }

    #[test]
    fn test_report_validity() {
        let mut report = IntegrityReport::default();
        report.record("audit.log", 1, LineStatus::Valid, true);
        report.record("audit.log", 2, LineStatus::Unsigned, true);
        let report = report.finish();
        assert!(report.valid);
        assert_eq!(report.total_entries, 2);

        let mut report = IntegrityReport::default();
        report.record("audit.log", 1, LineStatus::Invalid, true);
        let report = report.finish();
        assert!(!report.valid);
        assert_eq!(report.errors[0].line, 1);
    }
}
