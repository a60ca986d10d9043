use std::collections::BTreeMap;
use std::path::Path;

use chrono::{TimeZone, Utc};
use colored::Colorize;

use crate::config::{Settings, CONFIG_FILE};
use crate::core::audit::{format_timestamp, AuditEntry, AuditSeverity, IntegrityReport, KeyRotation};
use crate::core::rate_limit::{CommandStatus, RateLimitDecision};

pub struct Console;

impl Console {
    pub fn new() -> Self {
        Self
    }

    pub fn info(&self, message: &str) {
        println!("{} {}", "[INFO]".blue(), message);
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {}", "[WARN]".yellow(), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", "[ERROR]".red(), message);
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", "[OK]".green(), message);
    }

    pub fn show_config(&self, settings: &Settings, home: &Path) {
        println!("\n{}", "CONFIGURATION".bold().underline());
        println!("{}", "─".repeat(50));

        println!("\n  {}", "Rate Limits:".yellow());
        for (name, limit) in settings.rate_limit_config().commands() {
            let overridden = settings.rate_limits.contains_key(name);
            let marker = if overridden { "→ " } else { "  " };
            println!(
                "  {}{} {}",
                marker.green(),
                name.cyan().bold(),
                format!("{} per {}", limit.max, describe_ms(limit.window_ms)).dimmed()
            );
        }

        println!("\n  {}", "Audit Log:".yellow());
        println!(
            "    Enabled: {}",
            if settings.audit.enabled {
                "yes".green()
            } else {
                "no".red()
            }
        );
        println!("    Max file size: {} bytes", settings.audit.max_file_bytes);
        println!("    Rotated files kept: {}", settings.audit.max_rotated_files);

        println!(
            "\n  {} {}",
            "Home:".yellow(),
            home.display().to_string().dimmed()
        );
        let path = home.join(CONFIG_FILE);
        let note = if path.exists() { "" } else { " (not present, using defaults)" };
        println!(
            "  {} {}{}",
            "Config file:".yellow(),
            path.display().to_string().dimmed(),
            note.dimmed()
        );
        println!();
    }

    pub fn limit_status(&self, status: &BTreeMap<String, CommandStatus>) {
        println!("\n{}", "RATE LIMITS".bold().underline());
        println!("{}", "─".repeat(60));
        println!(
            "  {:<20} {:>6} {:>6} {:>9} {:>8}  {}",
            "COMMAND", "USED", "LIMIT", "REMAINING", "WINDOW", "RESETS"
        );

        for (name, s) in status {
            let remaining = if s.remaining == 0 {
                s.remaining.to_string().red()
            } else {
                s.remaining.to_string().green()
            };
            let resets = s
                .reset_time
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .map(|ts| format_timestamp(&ts))
                .unwrap_or_else(|| "-".to_string());

            println!(
                "  {:<20} {:>6} {:>6} {:>9} {:>8}  {}",
                name.cyan(),
                s.used,
                s.limit,
                remaining,
                describe_ms(s.window_ms),
                resets.dimmed()
            );
        }
        println!();
    }

    pub fn decision(&self, decision: &RateLimitDecision) {
        if decision.allowed {
            self.success(&format!(
                "'{}' allowed ({}/{} in {})",
                decision.command,
                decision.current_count,
                decision.max,
                describe_ms(decision.window_ms)
            ));
        } else {
            self.error(&decision.message());
        }
    }

    pub fn integrity_report(&self, report: &IntegrityReport) {
        println!("\n{}", "AUDIT LOG INTEGRITY".bold().underline());
        println!("{}", "─".repeat(50));
        println!("  Files checked:      {}", report.files_checked);
        println!("  Entries:            {}", report.total_entries);
        println!("  Valid signatures:   {}", report.valid_signatures.to_string().green());
        println!(
            "  Invalid signatures: {}",
            if report.invalid_signatures > 0 {
                report.invalid_signatures.to_string().red()
            } else {
                report.invalid_signatures.to_string().normal()
            }
        );
        println!("  Unsigned entries:   {}", report.unsigned_entries);
        println!("  Unparseable lines:  {}", report.parse_errors);

        if !report.errors.is_empty() {
            println!("\n  {}", "Problems:".yellow());
            for issue in &report.errors {
                println!(
                    "    {} {}:{} {}",
                    "•".red(),
                    issue.file,
                    issue.line,
                    issue.error.dimmed()
                );
            }
        }

        println!();
        if report.valid {
            self.success("Audit log integrity verified");
        } else {
            self.error("Audit log integrity check FAILED");
        }
    }

    pub fn entries(&self, entries: &[AuditEntry]) {
        if entries.is_empty() {
            self.info("Audit log is empty");
            return;
        }

        for entry in entries {
            let line = entry.to_log_line();
            match entry.severity {
                Some(AuditSeverity::Critical) | Some(AuditSeverity::Error) => println!("{}", line.red()),
                Some(AuditSeverity::Warning) => println!("{}", line.yellow()),
                _ => println!("{}", line),
            }
        }
    }

    pub fn key_rotation(&self, rotation: &KeyRotation) {
        self.success(&format!(
            "Signing key rotated: {} → {}",
            rotation.previous.as_deref().unwrap_or("(none)"),
            rotation.current.fingerprint()
        ));
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_ms(ms: u64) -> String {
    const MINUTE: u64 = 60 * 1000;
    const HOUR: u64 = 60 * MINUTE;

    if ms >= HOUR && ms % HOUR == 0 {
        format!("{}h", ms / HOUR)
    } else if ms >= MINUTE && ms % MINUTE == 0 {
        format!("{}m", ms / MINUTE)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}
