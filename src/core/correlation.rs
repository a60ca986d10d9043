use crate::core::safety::{sanitize_for_log, SanitizeOptions};

/// Environment variable a parent process can set to tie audit entries together.
pub const CORRELATION_ENV: &str = "OPSGUARD_CORRELATION_ID";

const MAX_CORRELATION_LEN: usize = 128;

/// Supplies the correlation id stamped on audit entries and log lines.
pub trait CorrelationIdProvider: Send + Sync {
    fn correlation_id(&self) -> Option<String>;
}

/// One id per process: taken from the environment when present, otherwise a fresh uuid.
#[derive(Debug, Clone)]
pub struct SessionCorrelation {
    id: String,
}

impl SessionCorrelation {
    pub fn new() -> Self {
        let id = std::env::var(CORRELATION_ENV)
            .ok()
            .map(|raw| sanitize_for_log(raw.trim(), &SanitizeOptions::with_max_len(MAX_CORRELATION_LEN)))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self { id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Default for SessionCorrelation {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIdProvider for SessionCorrelation {
    fn correlation_id(&self) -> Option<String> {
        Some(self.id.clone())
    }
}

/// Always returns the same id, or none at all.
#[derive(Debug, Clone, Default)]
pub struct FixedCorrelation(pub Option<String>);

impl FixedCorrelation {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Some(id.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CorrelationIdProvider for FixedCorrelation {
    fn correlation_id(&self) -> Option<String> {
        self.0.clone()
    }
}
