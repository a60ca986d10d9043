use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::rate_limit::{is_valid_command_name, RateLimit, RateLimitConfig, MAX_RETAINED_PER_COMMAND};

/// Overrides the config/state directory
pub const HOME_ENV: &str = "OPSGUARD_HOME";
pub const CONFIG_FILE: &str = "config.toml";

const MAX_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Per-command overrides layered over the built-in table
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimit>,

    #[serde(default)]
    pub audit: AuditSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    #[serde(default = "default_max_rotated_files")]
    pub max_rotated_files: usize,
}

fn default_true() -> bool {
    true
}
fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_max_rotated_files() -> usize {
    5
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_file_bytes: default_max_file_bytes(),
            max_rotated_files: default_max_rotated_files(),
        }
    }
}

impl Settings {
    /// Load `config.toml` from the home directory. A missing file means defaults.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content).context("Failed to parse config file")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, limit) in &self.rate_limits {
            if !is_valid_command_name(name) {
                bail!("Invalid command name in [rate_limits]: {:?}", name);
            }
            if limit.max == 0 || limit.max as usize > MAX_RETAINED_PER_COMMAND {
                bail!(
                    "rate_limits.{}.max must be between 1 and {}",
                    name,
                    MAX_RETAINED_PER_COMMAND
                );
            }
            if limit.window_ms == 0 || limit.window_ms > MAX_WINDOW_MS {
                bail!("rate_limits.{}.window_ms must be between 1 and {}", name, MAX_WINDOW_MS);
            }
        }

        if self.audit.max_file_bytes == 0 {
            bail!("audit.max_file_bytes must be greater than zero");
        }

        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Directory holding config, state and the audit log.
    pub fn home_dir() -> Result<PathBuf> {
        if let Ok(home) = std::env::var(HOME_ENV) {
            if !home.trim().is_empty() {
                return Ok(PathBuf::from(home));
            }
        }

        let dirs = directories::ProjectDirs::from("dev", "opsguard", "opsguard")
            .context("Could not determine config directory")?;
        Ok(dirs.config_dir().to_path_buf())
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join(CONFIG_FILE))
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::with_overrides(&self.rate_limits)
    }
}
