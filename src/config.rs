//! Governor configuration.
//!
//! Loaded from a YAML or JSON file (`GovernorConfig::from_file`), from the
//! environment (`GovernorConfig::from_env`), or built in code. Keys use the
//! camelCase option names (`sessionCap`, `maxConcurrentRuns`, ...).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::{BudgetLimits, PricingConfig};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Cap for {scope} must be positive, got {value}")]
    InvalidCap { scope: String, value: f64 },

    #[error("Thresholds must satisfy 0 < warning ({warning}) < critical ({critical}) <= 1")]
    InvalidThresholds { warning: f64, critical: f64 },

    #[error("Rate for {provider}/{model} must be a finite, non-negative amount, got {value}")]
    InvalidRate {
        provider: String,
        model: String,
        value: f64,
    },

    #[error("maxConcurrentRuns must be at least 1")]
    InvalidConcurrency,

    #[error("{0} must be greater than zero")]
    InvalidInterval(&'static str),
}

/// Complete configuration for a [`crate::governor::Governor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GovernorConfig {
    #[serde(flatten)]
    pub limits: BudgetLimits,
    pub max_concurrent_runs: usize,
    pub budget_check_interval_ms: u64,
    pub graceful_shutdown_timeout_ms: u64,
    /// Entries retained per session for `recent_entries` and projections.
    pub history_capacity: usize,
    /// Entries averaged by the overrun projection.
    pub overrun_window: usize,
    /// Calls looked ahead by the overrun projection.
    pub overrun_lookahead: u32,
    pub pricing: PricingConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            limits: BudgetLimits::default(),
            max_concurrent_runs: 4,
            budget_check_interval_ms: 5_000,
            graceful_shutdown_timeout_ms: 10_000,
            history_capacity: 100,
            overrun_window: 5,
            overrun_lookahead: 10,
            pricing: PricingConfig::default(),
        }
    }
}

impl GovernorConfig {
    /// Load from a file; `.json` is parsed as JSON, anything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            _ => serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `GOVERNOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Apply `GOVERNOR_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_parse("GOVERNOR_SESSION_CAP")? {
            self.limits.session_cap = v;
        }
        if let Some(v) = env_parse("GOVERNOR_WARNING_THRESHOLD")? {
            self.limits.warning_threshold = v;
        }
        if let Some(v) = env_parse("GOVERNOR_CRITICAL_THRESHOLD")? {
            self.limits.critical_threshold = v;
        }
        if let Some(v) = env_parse("GOVERNOR_MAX_CONCURRENT_RUNS")? {
            self.max_concurrent_runs = v;
        }
        if let Some(v) = env_parse("GOVERNOR_CHECK_INTERVAL_MS")? {
            self.budget_check_interval_ms = v;
        }
        if let Some(v) = env_parse("GOVERNOR_SHUTDOWN_TIMEOUT_MS")? {
            self.graceful_shutdown_timeout_ms = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        self.pricing.validate()?;
        if self.max_concurrent_runs == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        if self.budget_check_interval_ms == 0 {
            return Err(ConfigError::InvalidInterval("budgetCheckIntervalMs"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidInterval("historyCapacity"));
        }
        Ok(())
    }

    pub fn budget_check_interval(&self) -> Duration {
        Duration::from_millis(self.budget_check_interval_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}
