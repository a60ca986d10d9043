// ============================================
// OPSGUARD - Rate Limiter
// Persisted sliding-window admission control per command
// ============================================

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::correlation::CorrelationIdProvider;
use crate::core::reporter::{EventContext, SecurityEventSink, ViolationType};
use crate::core::safe_json::{contains_blocked_key, find_blocked_key, safe_json_parse};
use crate::core::safety::{sanitize_for_log, SanitizeOptions};
use crate::core::secure_fs::{harden_permissions, is_owner_only, mode_of, write_private_atomic, FileLock};

pub const STATE_FILE: &str = "rate-limits.json";

/// Name of the fallback entry in the limit table.
pub const DEFAULT_COMMAND: &str = "default";

/// Entries older than this are dropped on every load.
pub const RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// Timestamps kept per command after pruning.
pub const MAX_RETAINED_PER_COMMAND: usize = 100;

/// Anything longer than this in a state file is treated as tampering.
pub const MAX_STORED_PER_COMMAND: usize = 2 * MAX_RETAINED_PER_COMMAND;

const MAX_FUTURE_SKEW_MS: i64 = 60 * 1000;
const MAX_AGE_MS: i64 = 365 * 24 * 60 * 60 * 1000;
const MAX_STATE_COMMANDS: usize = 1000;
const STATE_MAX_DEPTH: usize = 2;

lazy_static! {
    static ref COMMAND_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]{1,100}$").unwrap();
}

/// Command names usable as state keys
pub fn is_valid_command_name(name: &str) -> bool {
    COMMAND_NAME.is_match(name) && !contains_blocked_key(name)
}

/// Limit for one command: at most `max` calls per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    pub window_ms: u64,
}

impl RateLimit {
    pub const fn new(max: u32, window_ms: u64) -> Self {
        Self { max, window_ms }
    }
}

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;

const BUILTIN_LIMITS: [(&str, RateLimit); 10] = [
    (DEFAULT_COMMAND, RateLimit::new(100, MINUTE_MS)),
    ("deploy", RateLimit::new(10, HOUR_MS)),
    ("backup", RateLimit::new(5, HOUR_MS)),
    ("restore", RateLimit::new(3, HOUR_MS)),
    ("secrets-rotate", RateLimit::new(3, HOUR_MS)),
    ("terraform-apply", RateLimit::new(5, HOUR_MS)),
    ("terraform-destroy", RateLimit::new(2, HOUR_MS)),
    ("container-exec", RateLimit::new(30, MINUTE_MS)),
    ("workflow-run", RateLimit::new(20, HOUR_MS)),
    ("login", RateLimit::new(5, 15 * MINUTE_MS)),
];

/// Immutable command → limit table with a `default` fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    limits: BTreeMap<String, RateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RateLimitConfig {
    pub fn builtin() -> Self {
        Self {
            limits: BUILTIN_LIMITS
                .iter()
                .map(|(name, limit)| (name.to_string(), *limit))
                .collect(),
        }
    }

    /// Built-in table with `overrides` layered on top
    pub fn with_overrides(overrides: &BTreeMap<String, RateLimit>) -> Self {
        let mut config = Self::builtin();
        for (name, limit) in overrides {
            config.limits.insert(name.clone(), *limit);
        }
        config
    }

    pub fn from_limits(limits: BTreeMap<String, RateLimit>) -> Self {
        Self { limits }
    }

    pub fn limit_for(&self, command: &str) -> RateLimit {
        self.limits
            .get(command)
            .or_else(|| self.limits.get(DEFAULT_COMMAND))
            .copied()
            .unwrap_or(BUILTIN_LIMITS[0].1)
    }

    pub fn commands(&self) -> impl Iterator<Item = (&String, &RateLimit)> {
        self.limits.iter()
    }
}

/// Why a state file was thrown away
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateRejection {
    #[error("state is not a valid JSON object")]
    Malformed,
    #[error("blocked key '{0}' present")]
    BlockedKey(String),
    #[error("invalid command name")]
    InvalidCommand,
    #[error("too many commands ({0})")]
    TooManyCommands(usize),
    #[error("command '{command}' has {len} entries")]
    TooManyEntries { command: String, len: usize },
    #[error("command '{command}' has an out-of-range timestamp")]
    InvalidTimestamp { command: String },
}

/// Per-command history of admitted calls, in epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RateLimitState {
    entries: BTreeMap<String, Vec<i64>>,
}

impl RateLimitState {
    /// Validate a raw state document. Any structural problem rejects the
    /// whole document.
    pub fn from_json(text: &str, now_ms: i64) -> Result<Self, StateRejection> {
        let value = safe_json_parse(text, STATE_MAX_DEPTH, true).ok_or(StateRejection::Malformed)?;

        if let Some(key) = find_blocked_key(&value) {
            return Err(StateRejection::BlockedKey(key));
        }

        let Value::Object(map) = value else {
            return Err(StateRejection::Malformed);
        };

        if map.len() > MAX_STATE_COMMANDS {
            return Err(StateRejection::TooManyCommands(map.len()));
        }

        let mut entries = BTreeMap::new();
        for (command, raw) in map {
            if !is_valid_command_name(&command) {
                return Err(StateRejection::InvalidCommand);
            }

            let Value::Array(items) = raw else {
                return Err(StateRejection::Malformed);
            };

            if items.len() > MAX_STORED_PER_COMMAND {
                return Err(StateRejection::TooManyEntries {
                    command,
                    len: items.len(),
                });
            }

            let mut timestamps = Vec::with_capacity(items.len());
            for item in &items {
                match item.as_f64().filter(|ts| is_plausible_timestamp(*ts, now_ms)) {
                    Some(ts) => timestamps.push(ts as i64),
                    None => return Err(StateRejection::InvalidTimestamp { command }),
                }
            }

            entries.insert(command, timestamps);
        }

        Ok(Self { entries })
    }

    pub fn timestamps(&self, command: &str) -> &[i64] {
        self.entries.get(command).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn record(&mut self, command: &str, at_ms: i64) {
        self.entries.entry(command.to_string()).or_default().push(at_ms);
    }

    /// Drop one command's history, or everything. Returns how many timestamps went.
    pub fn clear(&mut self, command: Option<&str>) -> usize {
        match command {
            Some(c) => self.entries.remove(c).map(|v| v.len()).unwrap_or(0),
            None => {
                let total = self.entries.values().map(Vec::len).sum();
                self.entries.clear();
                total
            }
        }
    }

    /// Remove entries older than the retention period and cap each history.
    pub fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - RETENTION_MS;
        for timestamps in self.entries.values_mut() {
            timestamps.retain(|&ts| ts > cutoff);
            timestamps.sort_unstable();
            if timestamps.len() > MAX_RETAINED_PER_COMMAND {
                let excess = timestamps.len() - MAX_RETAINED_PER_COMMAND;
                timestamps.drain(..excess);
            }
        }
        self.entries.retain(|_, timestamps| !timestamps.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn commands(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

fn is_plausible_timestamp(ts: f64, now_ms: i64) -> bool {
    let now = now_ms as f64;
    ts.is_finite() && ts > 0.0 && ts <= now + MAX_FUTURE_SKEW_MS as f64 && ts >= now - MAX_AGE_MS as f64
}

/// Options for [`RateLimiter::check`]
#[derive(Debug, Clone, Copy)]
pub struct CheckOptions {
    /// Record this call when it is admitted
    pub increment: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self { increment: true }
    }
}

impl CheckOptions {
    /// Look without recording
    pub fn peek() -> Self {
        Self { increment: false }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub command: String,
    pub allowed: bool,
    /// Calls inside the window, including this one when it was recorded
    pub current_count: usize,
    pub max: u32,
    pub window_ms: u64,
    pub retry_after_ms: u64,
    pub retry_after_sec: u64,
}

impl RateLimitDecision {
    pub fn message(&self) -> String {
        format!(
            "Rate limit exceeded for '{}': {} calls per {}. Retry in {}s.",
            self.command,
            self.max,
            describe_window(self.window_ms),
            self.retry_after_sec
        )
    }
}

fn describe_window(window_ms: u64) -> String {
    if window_ms % HOUR_MS == 0 {
        format!("{}h", window_ms / HOUR_MS)
    } else if window_ms % MINUTE_MS == 0 {
        format!("{}m", window_ms / MINUTE_MS)
    } else if window_ms % 1000 == 0 {
        format!("{}s", window_ms / 1000)
    } else {
        format!("{}ms", window_ms)
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("{}", .0.message())]
    Exceeded(RateLimitDecision),

    #[error("refusing to reset rate limits without force")]
    ForceRequired,

    #[error("invalid command name: {0}")]
    InvalidCommand(String),
}

impl RateLimitError {
    pub fn decision(&self) -> Option<&RateLimitDecision> {
        match self {
            RateLimitError::Exceeded(decision) => Some(decision),
            _ => None,
        }
    }
}

/// Snapshot of one configured command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatus {
    pub limit: u32,
    pub used: usize,
    pub remaining: u32,
    pub window_ms: u64,
    /// When the oldest call in the window expires (epoch ms)
    pub reset_time: Option<i64>,
}

/// Sliding-window rate limiter backed by a JSON state file.
pub struct RateLimiter {
    config: RateLimitConfig,
    state_path: PathBuf,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SecurityEventSink>,
    correlation: Arc<dyn CorrelationIdProvider>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        state_path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn SecurityEventSink>,
        correlation: Arc<dyn CorrelationIdProvider>,
    ) -> Self {
        Self {
            config,
            state_path: state_path.into(),
            clock,
            sink,
            correlation,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Decide whether `command` may run now, recording it when admitted
    /// and `options.increment` is set.
    pub fn check(&self, command: &str, options: CheckOptions) -> Result<RateLimitDecision, RateLimitError> {
        if !is_valid_command_name(command) {
            return Err(RateLimitError::InvalidCommand(clean_name(command)));
        }

        let limit = self.config.limit_for(command);
        let now = self.clock.now_ms();

        let _lock = self.lock_state();
        let mut state = self.load_state(now);

        let recent = in_window(state.timestamps(command), now, limit.window_ms);
        let allowed = recent.len() < limit.max as usize;
        let mut current_count = recent.len();

        if allowed && options.increment {
            state.record(command, now);
            state.prune(now);
            current_count += 1;
            self.save_state(&state);
        }

        let retry_after_ms = if allowed {
            0
        } else {
            recent
                .iter()
                .min()
                .map(|oldest| (oldest + limit.window_ms as i64 - now).max(0) as u64)
                .unwrap_or(0)
        };

        let decision = RateLimitDecision {
            command: command.to_string(),
            allowed,
            current_count,
            max: limit.max,
            window_ms: limit.window_ms,
            retry_after_ms,
            retry_after_sec: retry_after_ms.div_ceil(1000),
        };

        let correlation_id = self.correlation.correlation_id().unwrap_or_default();
        debug!(
            command,
            allowed,
            count = decision.current_count,
            max = limit.max,
            %correlation_id,
            "Rate limit check"
        );

        Ok(decision)
    }

    /// Like [`check`](Self::check), but a rejection becomes an error after
    /// being reported as a security event.
    pub fn enforce(&self, command: &str, context: &EventContext) -> Result<RateLimitDecision, RateLimitError> {
        let decision = match self.check(command, CheckOptions::default()) {
            Ok(decision) => decision,
            Err(RateLimitError::InvalidCommand(name)) => {
                self.sink.record(
                    ViolationType::InvalidInput,
                    json!({ "field": "command", "value": name, "reason": "invalid command name" }),
                    context,
                );
                return Err(RateLimitError::InvalidCommand(name));
            }
            Err(e) => return Err(e),
        };

        if decision.allowed {
            return Ok(decision);
        }

        let correlation_id = self.correlation.correlation_id().unwrap_or_default();
        warn!(
            command,
            max = decision.max,
            retry_after_sec = decision.retry_after_sec,
            %correlation_id,
            "Rate limit exceeded"
        );

        self.sink.record(
            ViolationType::RateLimitExceeded,
            json!({
                "command": decision.command,
                "attemptedCount": decision.current_count + 1,
                "max": decision.max,
                "windowMs": decision.window_ms,
                "retryAfterMs": decision.retry_after_ms,
                "retryAfterSec": decision.retry_after_sec,
            }),
            context,
        );

        Err(RateLimitError::Exceeded(decision))
    }

    /// Usage of every configured command. Never writes state.
    pub fn status(&self) -> BTreeMap<String, CommandStatus> {
        let now = self.clock.now_ms();
        let state = self.load_state(now);

        self.config
            .commands()
            .map(|(name, limit)| {
                let recent = in_window(state.timestamps(name), now, limit.window_ms);
                let used = recent.len();
                let status = CommandStatus {
                    limit: limit.max,
                    used,
                    remaining: limit.max.saturating_sub(used as u32),
                    window_ms: limit.window_ms,
                    reset_time: recent.iter().min().map(|oldest| oldest + limit.window_ms as i64),
                };
                (name.clone(), status)
            })
            .collect()
    }

    /// Clear history for one command or all of them. Without `force` nothing
    /// is touched and [`RateLimitError::ForceRequired`] is returned. Every
    /// attempt is reported. `Ok(false)` means the cleared state could not
    /// be persisted.
    pub fn reset(&self, command: Option<&str>, force: bool) -> Result<bool, RateLimitError> {
        if let Some(c) = command {
            if !is_valid_command_name(c) {
                let name = clean_name(c);
                self.sink.record(
                    ViolationType::RateLimitReset,
                    json!({ "scope": name, "outcome": "rejected", "reason": "invalid command name" }),
                    &EventContext::current_user(&name),
                );
                return Err(RateLimitError::InvalidCommand(name));
            }
        }

        let scope = command.unwrap_or("*");
        let context = EventContext::current_user(scope);

        if !force {
            self.sink.record(
                ViolationType::RateLimitReset,
                json!({ "scope": scope, "outcome": "refused", "reason": "force not set" }),
                &context,
            );
            return Err(RateLimitError::ForceRequired);
        }

        let now = self.clock.now_ms();
        let _lock = self.lock_state();
        let mut state = self.load_state(now);
        let cleared = state.clear(command);
        let saved = self.save_state(&state);

        info!(scope, cleared, "Rate limits reset");
        self.sink.record(
            ViolationType::RateLimitReset,
            json!({ "scope": scope, "outcome": "reset", "clearedEntries": cleared }),
            &context,
        );

        Ok(saved)
    }

    fn lock_state(&self) -> Option<FileLock> {
        match FileLock::acquire(&FileLock::path_for(&self.state_path)) {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!(error = %e, "Could not lock rate limit state, continuing unlocked");
                None
            }
        }
    }

    /// Read, validate and prune the state file. Anything suspicious yields
    /// an empty state.
    fn load_state(&self, now_ms: i64) -> RateLimitState {
        let text = match fs::read_to_string(&self.state_path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return RateLimitState::default(),
            Err(e) => {
                warn!(error = %e, "Could not read rate limit state, starting empty");
                return RateLimitState::default();
            }
        };

        self.check_state_permissions();

        if text.trim().is_empty() {
            return RateLimitState::default();
        }

        match RateLimitState::from_json(&text, now_ms) {
            Ok(mut state) => {
                state.prune(now_ms);
                state
            }
            Err(rejection) => {
                warn!(reason = %rejection, "Discarding rate limit state");
                self.sink.record(
                    ViolationType::StateTamperingDetected,
                    json!({ "file": STATE_FILE, "reason": rejection.to_string() }),
                    &EventContext::default(),
                );
                RateLimitState::default()
            }
        }
    }

    fn check_state_permissions(&self) {
        if let Ok(false) = is_owner_only(&self.state_path) {
            let actual = mode_of(&self.state_path).map(|m| format!("{:o}", m));
            let hardened = harden_permissions(&self.state_path).unwrap_or(false);
            self.sink.record(
                ViolationType::FilePermissionMismatch,
                json!({
                    "file": STATE_FILE,
                    "expected": "600",
                    "actual": actual,
                    "action": if hardened { "re-hardened" } else { "harden-failed" },
                }),
                &EventContext::default(),
            );
        }
    }

    /// Persist state. Failures are reported, never raised.
    fn save_state(&self, state: &RateLimitState) -> bool {
        let bytes = match serde_json::to_vec(state) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Could not serialize rate limit state");
                return false;
            }
        };

        if let Err(e) = write_private_atomic(&self.state_path, &bytes) {
            warn!(error = %e, "Could not write rate limit state");
            return false;
        }

        match harden_permissions(&self.state_path) {
            Ok(true) => true,
            outcome => {
                let error = match outcome {
                    Err(e) => e.to_string(),
                    _ => "mode did not match after chmod".to_string(),
                };
                warn!(%error, "Rate limit state permissions could not be hardened");
                self.sink.record(
                    ViolationType::FilePermissionMismatch,
                    json!({
                        "file": STATE_FILE,
                        "expected": "600",
                        "actual": mode_of(&self.state_path).map(|m| format!("{:o}", m)),
                        "error": error,
                    }),
                    &EventContext::default(),
                );
                false
            }
        }
    }
}

fn in_window(timestamps: &[i64], now_ms: i64, window_ms: u64) -> Vec<i64> {
    let window_start = now_ms - window_ms as i64;
    timestamps.iter().copied().filter(|&ts| ts > window_start).collect()
}

fn clean_name(raw: &str) -> String {
    sanitize_for_log(raw, &SanitizeOptions::with_max_len(120))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::correlation::FixedCorrelation;
    use crate::core::reporter::MemorySink;
    use tempfile::{tempdir, TempDir};

    const START: i64 = 1_800_000_000_000;

    struct Harness {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        sink: Arc<MemorySink>,
        limiter: RateLimiter,
    }

    fn harness(limits: &[(&str, RateLimit)]) -> Harness {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let sink = Arc::new(MemorySink::new());
        let mut table = BTreeMap::new();
        table.insert(DEFAULT_COMMAND.to_string(), RateLimit::new(100, MINUTE_MS));
        for (name, limit) in limits {
            table.insert(name.to_string(), *limit);
        }
        let limiter = RateLimiter::new(
            RateLimitConfig::from_limits(table),
            dir.path().join(STATE_FILE),
            clock.clone(),
            sink.clone(),
            Arc::new(FixedCorrelation::none()),
        );
        Harness {
            _dir: dir,
            clock,
            sink,
            limiter,
        }
    }

    #[test]
    fn test_sliding_window() {
        let h = harness(&[("deploy", RateLimit::new(3, 60_000))]);

        for expected in 1..=3 {
            let d = h.limiter.check("deploy", CheckOptions::default()).unwrap();
            assert!(d.allowed);
            assert_eq!(d.current_count, expected);
        }

        h.clock.advance_ms(10_000);
        let denied = h.limiter.check("deploy", CheckOptions::default()).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 50_000);
        assert_eq!(denied.retry_after_sec, 50);

        h.clock.advance_ms(50_000);
        assert!(h.limiter.check("deploy", CheckOptions::default()).unwrap().allowed);
    }

    #[test]
    fn test_peek_does_not_record() {
        let h = harness(&[("backup", RateLimit::new(1, 60_000))]);

        for _ in 0..5 {
            assert!(h.limiter.check("backup", CheckOptions::peek()).unwrap().allowed);
        }
        assert!(!h.limiter.state_path().exists());
    }

    #[test]
    fn test_unlisted_command_uses_default() {
        let h = harness(&[]);
        let d = h.limiter.check("whatever", CheckOptions::default()).unwrap();
        assert_eq!(d.max, 100);
        assert_eq!(d.window_ms, MINUTE_MS);
    }

    #[test]
    fn test_invalid_command_names() {
        let h = harness(&[]);
        let too_long = "x".repeat(101);
        for bad in ["", "has space", "semi;colon", "__proto__", "my-constructor", too_long.as_str()] {
            assert!(matches!(
                h.limiter.check(bad, CheckOptions::default()),
                Err(RateLimitError::InvalidCommand(_))
            ));
        }
    }

    #[test]
    fn test_enforce_reports_before_failing() {
        let h = harness(&[("restore", RateLimit::new(1, 60_000))]);
        let ctx = EventContext::for_command("restore");

        assert!(h.limiter.enforce("restore", &ctx).is_ok());
        let err = h.limiter.enforce("restore", &ctx).unwrap_err();

        let decision = err.decision().unwrap();
        assert!(!decision.allowed);
        assert_eq!(h.sink.count(ViolationType::RateLimitExceeded), 1);

        let (_, details) = &h.sink.events()[0];
        assert_eq!(details["attemptedCount"], 2);
        assert_eq!(details["max"], 1);
        assert!(err.to_string().contains("restore"));
    }

    #[test]
    fn test_status_is_read_only() {
        let h = harness(&[("deploy", RateLimit::new(3, 60_000))]);
        h.limiter.check("deploy", CheckOptions::default()).unwrap();
        let before = fs::read_to_string(h.limiter.state_path()).unwrap();

        let status = h.limiter.status();
        let deploy = &status["deploy"];
        assert_eq!(deploy.used, 1);
        assert_eq!(deploy.remaining, 2);
        assert_eq!(deploy.reset_time, Some(START + 60_000));
        assert_eq!(status[DEFAULT_COMMAND].used, 0);

        assert_eq!(fs::read_to_string(h.limiter.state_path()).unwrap(), before);
    }

    #[test]
    fn test_reset_requires_force() {
        let h = harness(&[("deploy", RateLimit::new(1, 60_000))]);
        h.limiter.check("deploy", CheckOptions::default()).unwrap();

        assert!(matches!(
            h.limiter.reset(Some("deploy"), false),
            Err(RateLimitError::ForceRequired)
        ));
        assert!(!h.limiter.check("deploy", CheckOptions::peek()).unwrap().allowed);

        assert!(h.limiter.reset(Some("deploy"), true).unwrap());
        assert!(h.limiter.check("deploy", CheckOptions::peek()).unwrap().allowed);
        assert_eq!(h.sink.count(ViolationType::RateLimitReset), 2);
    }

    #[test]
    fn test_reset_with_invalid_name_is_reported() {
        let h = harness(&[("deploy", RateLimit::new(1, 60_000))]);
        h.limiter.check("deploy", CheckOptions::default()).unwrap();

        assert!(matches!(
            h.limiter.reset(Some("bad name\n"), true),
            Err(RateLimitError::InvalidCommand(_))
        ));
        assert!(!h.limiter.check("deploy", CheckOptions::peek()).unwrap().allowed);

        assert_eq!(h.sink.count(ViolationType::RateLimitReset), 1);
        let (_, details) = h.sink.events().pop().unwrap();
        assert_eq!(details["outcome"], "rejected");
        assert_eq!(details["scope"], "bad name\\n");
    }

    #[test]
    fn test_reset_all() {
        let h = harness(&[]);
        h.limiter.check("a", CheckOptions::default()).unwrap();
        h.limiter.check("b", CheckOptions::default()).unwrap();

        assert!(h.limiter.reset(None, true).unwrap());
        let status = h.limiter.status();
        assert!(status.values().all(|s| s.used == 0));
        let (_, details) = h.sink.events().pop().unwrap();
        assert_eq!(details["clearedEntries"], 2);
    }

    #[test]
    fn test_polluted_state_is_discarded() {
        let h = harness(&[("deploy", RateLimit::new(1, 60_000))]);
        let polluted = format!(r#"{{"deploy": [{}], "__proto__": {{"polluted": true}}}}"#, START);
        fs::write(h.limiter.state_path(), polluted).unwrap();

        assert!(h.limiter.check("deploy", CheckOptions::peek()).unwrap().allowed);
        assert!(h.sink.count(ViolationType::StateTamperingDetected) >= 1);
    }

    #[test]
    fn test_state_validation() {
        let ok = format!(r#"{{"deploy": [{}, {}]}}"#, START - 1000, START);
        assert_eq!(RateLimitState::from_json(&ok, START).unwrap().timestamps("deploy").len(), 2);

        let future = format!(r#"{{"deploy": [{}]}}"#, START + 120_000);
        assert!(matches!(
            RateLimitState::from_json(&future, START),
            Err(StateRejection::InvalidTimestamp { .. })
        ));

        let ancient = format!(r#"{{"deploy": [{}]}}"#, START - MAX_AGE_MS - 1);
        assert!(RateLimitState::from_json(&ancient, START).is_err());

        assert!(RateLimitState::from_json(r#"{"deploy": [-5]}"#, START).is_err());
        assert!(RateLimitState::from_json(r#"{"deploy": ["1"]}"#, START).is_err());
        assert!(RateLimitState::from_json(r#"{"deploy": 5}"#, START).is_err());
        assert!(RateLimitState::from_json(r#"["deploy"]"#, START).is_err());
        assert!(RateLimitState::from_json(r#"{"bad key": []}"#, START).is_err());
        assert!(RateLimitState::from_json(r#"{"deploy": [{"__proto__": 1}]}"#, START).is_err());
        assert!(RateLimitState::from_json(r#"{"deploy": [1], "x": {"prototype": {}}}"#, START).is_err());

        let oversized = format!(r#"{{"deploy": [{}]}}"#, vec![START.to_string(); 201].join(","));
        assert!(matches!(
            RateLimitState::from_json(&oversized, START),
            Err(StateRejection::TooManyEntries { len: 201, .. })
        ));
    }

    #[test]
    fn test_prune_drops_old_and_caps_length() {
        let mut state = RateLimitState::default();
        state.record("old", START - RETENTION_MS - 1);
        for i in 0..150 {
            state.record("busy", START - 150 + i);
        }
        state.prune(START);

        assert!(state.timestamps("old").is_empty());
        assert_eq!(state.timestamps("busy").len(), MAX_RETAINED_PER_COMMAND);
        assert_eq!(*state.timestamps("busy").last().unwrap(), START - 1);
        assert_eq!(state.commands().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_state_file_is_private() {
        let h = harness(&[]);
        h.limiter.check("deploy", CheckOptions::default()).unwrap();
        assert_eq!(mode_of(h.limiter.state_path()), Some(0o600));
    }

    #[cfg(unix)]
    #[test]
    fn test_loose_state_permissions_reported() {
        use std::os::unix::fs::PermissionsExt;

        let h = harness(&[]);
        h.limiter.check("deploy", CheckOptions::default()).unwrap();
        fs::set_permissions(h.limiter.state_path(), fs::Permissions::from_mode(0o644)).unwrap();

        h.limiter.status();
        assert_eq!(h.sink.count(ViolationType::FilePermissionMismatch), 1);
        assert_eq!(mode_of(h.limiter.state_path()), Some(0o600));
    }

    #[test]
    fn test_describe_window() {
        assert_eq!(describe_window(HOUR_MS), "1h");
        assert_eq!(describe_window(15 * MINUTE_MS), "15m");
        assert_eq!(describe_window(1500), "1500ms");
    }
}
