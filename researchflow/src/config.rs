//! Orchestrator configuration.
//!
//! Configuration can be set via environment variables:
//! - `RESEARCHFLOW_MAX_CONCURRENT_STAGES` - Size of the worker pool. Defaults to `4`.
//! - `RESEARCHFLOW_MAX_CONCURRENT_STAGES_PER_TASK` - Dispatch ceiling per task. Defaults to `2`.
//! - `RESEARCHFLOW_DEFAULT_STAGE_TIMEOUT_SECS` - Timeout for stages built by the
//!   fixtures. Defaults to `30`.
//! - `RESEARCHFLOW_DEFAULT_MAX_ATTEMPTS` - Attempts for stages built by the
//!   fixtures. Defaults to `3`.
//! - `RESEARCHFLOW_STORE_CONFLICT_RETRIES` - Retries on a store version
//!   conflict. Defaults to `5`.
//! - `RESEARCHFLOW_LOG_LEVEL` - Default log level. Defaults to `info`.
//! - `RESEARCHFLOW_LOG_FORMAT` - `text` or `json`. Defaults to `text`.
//! - `RESEARCHFLOW_ENVIRONMENT` - `development`, `testing` or `production`.
//!   Defaults to `development`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const ENV_PREFIX: &str = "RESEARCHFLOW_";

/// Errors raised while loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set to something unusable.
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Local development.
    #[default]
    Development,
    /// Test runs.
    Testing,
    /// Production.
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "testing" | "test" => Ok(Self::Testing),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

fn default_max_concurrent_stages() -> usize {
    4
}

fn default_max_concurrent_stages_per_task() -> usize {
    2
}

fn default_stage_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_store_conflict_retries() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of stage calls in flight across all tasks.
    #[serde(default = "default_max_concurrent_stages")]
    pub max_concurrent_stages: usize,

    /// Number of stage calls in flight for one task.
    #[serde(default = "default_max_concurrent_stages_per_task")]
    pub max_concurrent_stages_per_task: usize,

    /// Stage timeout used by the fixture workflows.
    #[serde(default = "default_stage_timeout_secs")]
    pub default_stage_timeout_secs: u64,

    /// Stage attempt limit used by the fixture workflows.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// How often a write is retried after a store version conflict.
    #[serde(default = "default_store_conflict_retries")]
    pub store_conflict_retries: u32,

    /// Default log level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: default_max_concurrent_stages(),
            max_concurrent_stages_per_task: default_max_concurrent_stages_per_task(),
            default_stage_timeout_secs: default_stage_timeout_secs(),
            default_max_attempts: default_max_attempts(),
            store_conflict_retries: default_store_conflict_retries(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            environment: Environment::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from `RESEARCHFLOW_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable or out-of-range
    /// values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let config = Self {
            max_concurrent_stages: parse_or(
                &get,
                "MAX_CONCURRENT_STAGES",
                defaults.max_concurrent_stages,
            )?,
            max_concurrent_stages_per_task: parse_or(
                &get,
                "MAX_CONCURRENT_STAGES_PER_TASK",
                defaults.max_concurrent_stages_per_task,
            )?,
            default_stage_timeout_secs: parse_or(
                &get,
                "DEFAULT_STAGE_TIMEOUT_SECS",
                defaults.default_stage_timeout_secs,
            )?,
            default_max_attempts: parse_or(
                &get,
                "DEFAULT_MAX_ATTEMPTS",
                defaults.default_max_attempts,
            )?,
            store_conflict_retries: parse_or(
                &get,
                "STORE_CONFLICT_RETRIES",
                defaults.store_conflict_retries,
            )?,
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: parse_or(&get, "LOG_FORMAT", defaults.log_format)?,
            environment: parse_or(&get, "ENVIRONMENT", defaults.environment)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the offending variable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("MAX_CONCURRENT_STAGES", self.max_concurrent_stages as u64),
            (
                "MAX_CONCURRENT_STAGES_PER_TASK",
                self.max_concurrent_stages_per_task as u64,
            ),
            ("DEFAULT_STAGE_TIMEOUT_SECS", self.default_stage_timeout_secs),
            ("DEFAULT_MAX_ATTEMPTS", u64::from(self.default_max_attempts)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    format!("{ENV_PREFIX}{name}"),
                    "must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Sets the worker pool size.
    #[must_use]
    pub const fn with_max_concurrent_stages(mut self, n: usize) -> Self {
        self.max_concurrent_stages = n;
        self
    }

    /// Sets the per-task dispatch ceiling.
    #[must_use]
    pub const fn with_max_concurrent_stages_per_task(mut self, n: usize) -> Self {
        self.max_concurrent_stages_per_task = n;
        self
    }

    /// Returns the default stage timeout.
    #[must_use]
    pub const fn default_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.default_stage_timeout_secs)
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(format!("{ENV_PREFIX}{name}"), e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_stages, 4);
        assert_eq!(config.max_concurrent_stages_per_task, 2);
        assert_eq!(config.default_stage_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.environment, Environment::Development);
    }

    #[test]
    fn test_empty_lookup_gives_defaults() {
        let config = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("RESEARCHFLOW_MAX_CONCURRENT_STAGES", "8"),
            ("RESEARCHFLOW_MAX_CONCURRENT_STAGES_PER_TASK", " 3 "),
            ("RESEARCHFLOW_LOG_LEVEL", "debug"),
            ("RESEARCHFLOW_LOG_FORMAT", "json"),
            ("RESEARCHFLOW_ENVIRONMENT", "prod"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent_stages, 8);
        assert_eq!(config.max_concurrent_stages_per_task, 3);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.environment, Environment::Production);
    }

    #[test]
    fn test_invalid_number() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(
            "RESEARCHFLOW_MAX_CONCURRENT_STAGES",
            "many",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "RESEARCHFLOW_MAX_CONCURRENT_STAGES"));
    }

    #[test]
    fn test_zero_rejected() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(
            "RESEARCHFLOW_DEFAULT_MAX_ATTEMPTS",
            "0",
        )]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue(
                "RESEARCHFLOW_DEFAULT_MAX_ATTEMPTS".to_string(),
                "must be greater than zero".to_string()
            )
        );
    }

    #[test]
    fn test_serde_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"max_concurrent_stages": 16}"#).unwrap();
        assert_eq!(config.max_concurrent_stages, 16);
        assert_eq!(config.store_conflict_retries, 5);
    }
}
