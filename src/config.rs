//! Configuration management for Ratewarden.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, WardenError};

/// Prefix of environment variables overriding settings, e.g.
/// `RATEWARDEN__LOGGING__LEVEL=debug`.
const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration for the Ratewarden tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the rate limit rules file
    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,

    /// Interval between purges of expired state, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Upper bound on stored limiter states
    #[serde(default = "default_max_states")]
    pub max_states: usize,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: default_rules_path(),
            purge_interval_secs: default_purge_interval(),
            max_states: default_max_states(),
        }
    }
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("rate_limiter.yaml")
}

fn default_purge_interval() -> u64 {
    60
}

fn default_max_states() -> usize {
    100_000
}

impl WardenConfig {
    /// Load configuration from an optional file plus `RATEWARDEN__*` variables.
    ///
    /// Without a path, `ratewarden.yaml` in the working directory is read if
    /// present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("ratewarden").required(false),
        };

        let config: WardenConfig = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.rate_limiting.purge_interval_secs == 0 {
            return Err(WardenError::Config(
                "rate_limiting.purge_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.max_states == 0 {
            return Err(WardenError::Config(
                "rate_limiting.max_states must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.rate_limiting.rules_path, PathBuf::from("rate_limiter.yaml"));
        assert_eq!(config.rate_limiting.purge_interval_secs, 60);
        assert_eq!(config.rate_limiting.max_states, 100_000);
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ratewarden-{}-{}.yaml", name, std::process::id()))
    }

    #[test]
    fn test_load_partial_file() {
        let path = temp_path("config");
        std::fs::write(
            &path,
            "logging:\n  format: json\nrate_limiting:\n  rules_path: /etc/ratewarden/rules.yaml\n",
        )
        .unwrap();

        let config = WardenConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.rate_limiting.rules_path,
            PathBuf::from("/etc/ratewarden/rules.yaml")
        );
        assert_eq!(config.rate_limiting.max_states, 100_000);
    }

    #[test]
    fn test_load_layers_file() {
        let path = temp_path("layered");
        std::fs::write(&path, "rate_limiting:\n  purge_interval_secs: 5\n").unwrap();

        let config = WardenConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.rate_limiting.purge_interval_secs, 5);
        assert_eq!(config.rate_limiting.max_states, 100_000);
    }

    #[test]
    fn test_zero_purge_interval_rejected() {
        let path = temp_path("invalid");
        std::fs::write(&path, "rate_limiting:\n  purge_interval_secs: 0\n").unwrap();

        let result = WardenConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();

        assert!(result.is_err());
    }
}
