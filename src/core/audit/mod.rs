// ============================================
// OPSGUARD - Tamper-Evident Audit Log
// Signed append-only event store with key rotation
// ============================================

mod entry;
mod integrity;
mod keys;
mod signing;

pub use entry::{
    format_timestamp, parse_timestamp, scrub_details, AuditEntry, AuditSeverity, ViolationType,
    SIGNATURE_ALGORITHM,
};
pub use integrity::{classify_line, IntegrityIssue, IntegrityReport, LineStatus, VerifyOptions};
pub use keys::{KeyRotation, KeyStore, KEY_ARCHIVE_DIR, KEY_FILE};
pub use signing::{
    canonical_json, generate_entry_signature, sign_entry, signature_for_value,
    verify_entry_signature, verify_value_signature, verify_with_ring, SigningKey, KEY_LEN,
};

use std::fs;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AuditSettings;
use crate::core::clock::Clock;
use crate::core::correlation::CorrelationIdProvider;
use crate::core::safe_json::safe_json_parse;
use crate::core::secure_fs::{open_private_append, FileLock};

pub const AUDIT_LOG_FILE: &str = "audit.log";

lazy_static! {
    static ref ROTATED_LOG_NAME: Regex = Regex::new(r"^audit\.(\d{1,4})\.log$").unwrap();
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("audit serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid signing key: expected 32 bytes, found {len}")]
    InvalidKey { len: usize },

    #[error("a rotation is already in progress")]
    RotationInProgress,
}

/// Clears the rotation flag when dropped.
#[derive(Debug)]
pub struct RotationGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The audit log session.
///
/// Owns the log directory, the signing key store, the injected clock and
/// correlation-id provider, and the in-process rotation flag. Every audit
/// operation goes through one of these.
pub struct AuditLog {
    dir: PathBuf,
    settings: AuditSettings,
    keys: KeyStore,
    clock: Arc<dyn Clock>,
    correlation: Arc<dyn CorrelationIdProvider>,
    rotating: AtomicBool,
}

impl AuditLog {
    pub fn new(
        dir: impl Into<PathBuf>,
        settings: AuditSettings,
        clock: Arc<dyn Clock>,
        correlation: Arc<dyn CorrelationIdProvider>,
    ) -> Self {
        let dir = dir.into();
        Self {
            keys: KeyStore::new(&dir),
            dir,
            settings,
            clock,
            correlation,
            rotating: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &AuditSettings {
        &self.settings
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn active_log_path(&self) -> PathBuf {
        self.dir.join(AUDIT_LOG_FILE)
    }

    pub fn rotated_log_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("audit.{}.log", n))
    }

    /// Active file first, then rotated files from newest (`audit.1.log`) to oldest.
    pub fn log_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();

        let active = self.active_log_path();
        if active.is_file() {
            files.push(active);
        }

        let mut rotated: Vec<(usize, PathBuf)> = match fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    let n = ROTATED_LOG_NAME
                        .captures(&name)
                        .and_then(|caps| caps[1].parse::<usize>().ok())?;
                    Some((n, e.path()))
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        rotated.sort_by_key(|(n, _)| *n);
        files.extend(rotated.into_iter().map(|(_, path)| path));

        files
    }

    /// Fresh unsigned entry stamped with this session's clock and correlation id.
    pub fn create_entry(&self, event_type: &str, details: Value) -> AuditEntry {
        let now = Utc
            .timestamp_millis_opt(self.clock.now_ms())
            .single()
            .unwrap_or_else(Utc::now);

        let mut entry = AuditEntry::at(event_type, scrub_details(details), now);
        if let Some(id) = self.correlation.correlation_id() {
            entry = entry.with_correlation_id(id);
        }
        entry
    }

    /// The active signing key, created on first use.
    pub fn signing_key(&self) -> Result<SigningKey, AuditError> {
        let key = self.keys.signing_key()?;

        if let Some(mode) = self.keys.loose_mode() {
            warn!(mode = %format!("{:o}", mode), "Signing key file permissions too open");
            if self.keys.harden()? {
                self.append(self.create_entry(
                    ViolationType::FilePermissionMismatch.as_str(),
                    json!({
                        "file": KEY_FILE,
                        "expected": "600",
                        "actual": format!("{:o}", mode),
                        "action": "re-hardened",
                    }),
                )
                .with_severity(ViolationType::FilePermissionMismatch.default_severity()));
            }
        }

        Ok(key)
    }

    pub fn sign_entry(&self, entry: &AuditEntry) -> Result<AuditEntry, AuditError> {
        Ok(sign_entry(entry, &self.signing_key()?))
    }

    /// Verify against the active key and every archived key.
    pub fn verify_entry(&self, entry: &AuditEntry) -> bool {
        verify_with_ring(&entry.to_value(), &self.keys.key_ring())
    }

    /// Sign (if needed) and append. Best effort: failures are logged, never raised.
    pub fn append(&self, entry: AuditEntry) -> bool {
        if !self.settings.enabled {
            debug!(event_type = %entry.event_type, "Audit logging disabled, dropping entry");
            return false;
        }

        match self.try_append(entry) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to write audit entry");
                false
            }
        }
    }

    /// Create, scrub, sign and append an event in one call.
    pub fn log_event(&self, event_type: &str, severity: AuditSeverity, details: Value) -> bool {
        let entry = self.create_entry(event_type, details).with_severity(severity);
        self.append(entry)
    }

    fn try_append(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let signed = if entry.is_signed() {
            entry
        } else {
            self.sign_entry(&entry)?
        };

        let mut line = serde_json::to_string(&signed)?;
        line.push('\n');

        let active = self.active_log_path();
        let _lock = FileLock::acquire(&FileLock::path_for(&active))?;

        if let Err(e) = self.rotate_logs_if_needed() {
            warn!(error = %e, "Audit log rotation failed, appending to active file");
        }

        let mut file = open_private_append(&active)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        debug!(event_type = %signed.event_type, id = %signed.id, "Audit entry written");
        Ok(())
    }

    /// Claim the rotation flag, or `None` if a rotation is already running.
    pub fn try_begin_rotation(&self) -> Option<RotationGuard<'_>> {
        self.rotating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RotationGuard {
                flag: &self.rotating,
            })
    }

    pub fn is_rotating(&self) -> bool {
        self.rotating.load(Ordering::SeqCst)
    }

    /// Shift log files when the active one has outgrown its size cap.
    /// Returns whether a rotation happened.
    pub fn rotate_logs_if_needed(&self) -> io::Result<bool> {
        let active = self.active_log_path();
        let size = match fs::metadata(&active) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        if size < self.settings.max_file_bytes {
            return Ok(false);
        }

        let Some(_guard) = self.try_begin_rotation() else {
            debug!("Audit log rotation already in progress, skipping");
            return Ok(false);
        };

        let keep = self.settings.max_rotated_files.max(1);

        let oldest = self.rotated_log_path(keep);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..keep).rev() {
            let from = self.rotated_log_path(n);
            if from.exists() {
                fs::rename(&from, self.rotated_log_path(n + 1))?;
            }
        }
        fs::rename(&active, self.rotated_log_path(1))?;

        info!(size, keep, "Rotated audit log");
        Ok(true)
    }

    /// Replace the signing key. The old key is archived so existing entries
    /// keep verifying; the rotation itself is logged under the new key.
    pub fn rotate_signing_key(&self) -> Result<KeyRotation, AuditError> {
        let rotation = {
            let Some(_guard) = self.try_begin_rotation() else {
                return Err(AuditError::RotationInProgress);
            };
            self.keys.rotate()?
        };

        self.log_event(
            ViolationType::KeyRotated.as_str(),
            ViolationType::KeyRotated.default_severity(),
            json!({
                "previousKeyId": rotation.previous,
                "currentKeyId": rotation.current.fingerprint(),
            }),
        );

        Ok(rotation)
    }

    /// Re-check every signature in the active and rotated log files.
    pub fn verify_integrity(&self, options: VerifyOptions) -> IntegrityReport {
        let ring = self.keys.key_ring();
        let cutoff = options.hours.and_then(|hours| {
            let now = Utc.timestamp_millis_opt(self.clock.now_ms()).single()?;
            let hours = i64::try_from(hours).ok()?;
            // Windows past chrono's range mean no cutoff
            now.checked_sub_signed(Duration::try_hours(hours)?)
        });

        let mut report = IntegrityReport::default();

        for path in self.log_files() {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            report.files_checked += 1;

            let file = match fs::File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!(file = %file_name, error = %e, "Could not open audit log");
                    report.record_unreadable(&file_name, &e.to_string());
                    continue;
                }
            };

            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line_no = idx + 1;
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        report.record(
                            &file_name,
                            line_no,
                            LineStatus::Malformed(e.to_string()),
                            options.verbose,
                        );
                        continue;
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }

                let status = classify_line(&line, cutoff, &ring);
                report.record(&file_name, line_no, status, options.verbose);
            }
        }

        let report = report.finish();
        if report.valid {
            info!(
                entries = report.total_entries,
                files = report.files_checked,
                "Audit log integrity verified"
            );
        } else {
            warn!(
                invalid = report.invalid_signatures,
                parse_errors = report.parse_errors,
                "Audit log integrity check failed"
            );
        }
        report
    }

    /// Last `count` parseable entries of the active file, oldest first.
    pub fn read_recent(&self, count: usize) -> Vec<AuditEntry> {
        let content = match fs::read_to_string(self.active_log_path()) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(error = %e, "Could not read audit log");
                }
                return Vec::new();
            }
        };

        let mut entries: Vec<AuditEntry> = content
            .lines()
            .rev()
            .filter_map(|line| safe_json_parse(line, integrity::AUDIT_LINE_MAX_DEPTH, false))
            .filter_map(AuditEntry::from_value)
            .take(count)
            .collect();
        entries.reverse();
        entries
    }
}
