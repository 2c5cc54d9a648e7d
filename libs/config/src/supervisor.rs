//! Supervisor Configuration Module
//!
//! Loads the supervisor configuration from a TOML file with `HURST_`-prefixed
//! environment overrides. Nested keys use a double underscore, e.g.
//! `HURST_LOGGING__LEVEL=debug` or `HURST_DISPATCHER__MAX_EXIT_ATTEMPTS=8`.

use crate::defaults;
use crate::error::{ConfigError, Result};
use crate::instance::InstanceConfig;
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Default location of the supervisor configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/hurst_channel.toml";

/// Main supervisor configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Instances created at boot
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Retry policy of the per-instance signal dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_exit_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub persistence_attempts: u32,
    pub queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_exit_attempts: defaults::dispatcher::MAX_EXIT_ATTEMPTS,
            initial_backoff_ms: defaults::dispatcher::INITIAL_BACKOFF_MS,
            max_backoff_ms: defaults::dispatcher::MAX_BACKOFF_MS,
            persistence_attempts: defaults::dispatcher::PERSISTENCE_ATTEMPTS,
            queue_size: defaults::dispatcher::QUEUE_SIZE,
        }
    }
}

impl DispatcherConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the ceiling
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(32);
        self.initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_exit_attempts == 0 {
            return Err(ConfigError::invalid(
                "dispatcher.max_exit_attempts",
                "must be at least 1",
            ));
        }
        if self.persistence_attempts == 0 {
            return Err(ConfigError::invalid(
                "dispatcher.persistence_attempts",
                "must be at least 1",
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::invalid(
                "dispatcher.initial_backoff_ms",
                format!(
                    "must not exceed max_backoff_ms ({} > {})",
                    self.initial_backoff_ms, self.max_backoff_ms
                ),
            ));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::invalid("dispatcher.queue_size", "must be at least 1"));
        }
        Ok(())
    }
}

impl SupervisorConfig {
    /// Load configuration from a file with environment overrides
    ///
    /// A missing file is accepted when no explicit path is given, so the
    /// supervisor can run from environment variables alone.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };

        info!("Loading supervisor config: {:?}", file);
        let builder = Config::builder()
            .add_source(File::from(file).required(required))
            // Override with environment variables (HURST_ prefix)
            .add_source(
                Environment::with_prefix("HURST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: SupervisorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        debug!(
            instances = config.instances.len(),
            "Supervisor configuration loaded"
        );
        Ok(config)
    }

    /// Validate the dispatcher policy and every declared instance
    pub fn validate(&self) -> Result<()> {
        self.dispatcher.validate()?;
        for instance in &self.instances {
            instance.validate()?;
        }
        Ok(())
    }
}

/// Convenience function to load configuration from an optional path
pub fn load_config(path: Option<&Path>) -> Result<SupervisorConfig> {
    SupervisorConfig::load(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::fs;
    use tempfile::tempdir;
    use types::CandleInterval;

    #[test]
    fn test_load_base_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("hurst_channel.toml");

        let config_content = r#"
[dispatcher]
max_exit_attempts = 3

[[instances]]
symbol = "BTCUSDT"
initial_capital = 1000
test_mode = true

[[instances]]
symbol = "ETHUSDT"
initial_capital = 500

[instances.hurst]
interval = "1h"
periods = 40
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = SupervisorConfig::load(Some(&config_path)).unwrap();

        assert_eq!(config.dispatcher.max_exit_attempts, 3);
        assert_eq!(config.dispatcher.initial_backoff_ms, 500);
        assert_eq!(config.instances.len(), 2);
        assert!(config.instances[0].test_mode);
        assert_eq!(config.instances[0].initial_capital, dec!(1000));
        assert_eq!(config.instances[1].hurst.interval, CandleInterval::ONE_HOUR);
        assert_eq!(config.instances[1].hurst.periods, 40);
    }

    #[test]
    fn test_environment_override() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("hurst_channel.toml");
        fs::write(&config_path, "[logging]\nlevel = \"info\"\n").unwrap();

        std::env::set_var("HURST_LOGGING__FORMAT", "json");
        let config = SupervisorConfig::load(Some(&config_path)).unwrap();
        std::env::remove_var("HURST_LOGGING__FORMAT");

        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_instance_fails_load() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("hurst_channel.toml");
        fs::write(
            &config_path,
            "[[instances]]\nsymbol = \"BTCUSDT\"\ninitial_capital = 0\n",
        )
        .unwrap();

        let err = SupervisorConfig::load(Some(&config_path)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { field: "initial_capital", .. }));
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = DispatcherConfig::default();
        assert_eq!(policy.backoff_ms(1), 500);
        assert_eq!(policy.backoff_ms(2), 1_000);
        assert_eq!(policy.backoff_ms(4), 4_000);
        assert_eq!(policy.backoff_ms(10), 30_000);
        assert_eq!(policy.backoff_ms(200), 30_000);
    }
}
