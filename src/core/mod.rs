pub mod audit;
pub mod clock;
pub mod correlation;
pub mod rate_limit;
pub mod reporter;
pub mod safe_json;
pub mod safety;
pub mod secure_fs;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use audit::{AuditLog, IntegrityReport, VerifyOptions};
pub use clock::{Clock, SystemClock};
pub use correlation::{CorrelationIdProvider, SessionCorrelation};
pub use rate_limit::{CheckOptions, RateLimitDecision, RateLimitError, RateLimiter};
pub use reporter::{EventContext, SecurityEventSink, SecurityReporter, TracingSink};

use crate::config::Settings;
use rate_limit::STATE_FILE;

/// Subdirectory of the home directory holding the audit log and keys
pub const AUDIT_DIR: &str = "audit";

/// Everything needed to admit commands and record what happened.
pub struct SecurityCore {
    home: PathBuf,
    audit: Arc<AuditLog>,
    sink: Arc<dyn SecurityEventSink>,
    limiter: RateLimiter,
}

impl SecurityCore {
    pub fn open(home: &Path, settings: &Settings) -> Self {
        Self::with_parts(
            home,
            settings,
            Arc::new(SystemClock),
            Arc::new(SessionCorrelation::new()),
        )
    }

    pub fn with_parts(
        home: &Path,
        settings: &Settings,
        clock: Arc<dyn Clock>,
        correlation: Arc<dyn CorrelationIdProvider>,
    ) -> Self {
        let audit = Arc::new(AuditLog::new(
            home.join(AUDIT_DIR),
            settings.audit.clone(),
            clock.clone(),
            correlation.clone(),
        ));

        let sink: Arc<dyn SecurityEventSink> = if settings.audit.enabled {
            Arc::new(SecurityReporter::new(audit.clone()))
        } else {
            Arc::new(TracingSink)
        };

        let limiter = RateLimiter::new(
            settings.rate_limit_config(),
            home.join(STATE_FILE),
            clock,
            sink.clone(),
            correlation,
        );

        Self {
            home: home.to_path_buf(),
            audit,
            sink,
            limiter,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn reporter(&self) -> &Arc<dyn SecurityEventSink> {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::ViolationType;
    use crate::core::clock::ManualClock;
    use crate::core::correlation::FixedCorrelation;
    use crate::core::rate_limit::RateLimit;
    use tempfile::tempdir;

    #[test]
    fn test_rejection_lands_in_signed_audit_log() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings
            .rate_limits
            .insert("deploy".to_string(), RateLimit::new(1, 60_000));

        let core = SecurityCore::with_parts(
            dir.path(),
            &settings,
            Arc::new(ManualClock::starting_now()),
            Arc::new(FixedCorrelation::new("run-42")),
        );

        let ctx = EventContext::for_command("deploy");
        assert!(core.limiter().enforce("deploy", &ctx).is_ok());
        assert!(core.limiter().enforce("deploy", &ctx).is_err());

        let entries = core.audit().read_recent(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, ViolationType::RateLimitExceeded.as_str());
        assert_eq!(entries[0].correlation_id.as_deref(), Some("run-42"));

        let report = core.audit().verify_integrity(VerifyOptions::default());
        assert!(report.valid);
        assert_eq!(report.valid_signatures, 1);
    }

    #[test]
    fn test_disabled_audit_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.audit.enabled = false;
        settings
            .rate_limits
            .insert("deploy".to_string(), RateLimit::new(1, 60_000));

        let core = SecurityCore::open(dir.path(), &settings);
        let ctx = EventContext::for_command("deploy");
        core.limiter().enforce("deploy", &ctx).unwrap();
        assert!(core.limiter().enforce("deploy", &ctx).is_err());

        assert!(!core.audit().active_log_path().exists());
    }
}
