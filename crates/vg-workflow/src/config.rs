//! YAML configuration loader for the approval engine.
//!
//! Hosts load an `engine.yaml` (path overridable via the
//! `VENDORGATE_ENGINE_CONFIG` environment variable) or fall back to
//! defaults. Sweep cadence lives here but is consumed by the hosting
//! process; the engine itself never schedules anything.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use thiserror::Error;

/// Environment variable pointing at the engine configuration file.
pub const ENGINE_CONFIG_ENV: &str = "VENDORGATE_ENGINE_CONFIG";

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn default_max_cas_retries() -> u32 {
    3
}

fn default_escalation_ceiling() -> u32 {
    3
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_event_capacity() -> usize {
    1024
}

fn default_event_history() -> usize {
    1000
}

/// Tunables for the approval engine and escalation scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bounded retries for lost compare-and-swap races before surfacing
    /// a conflict to the caller.
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,

    /// Consecutive timeout escalations on the same (request, step) before
    /// the request auto-expires.
    #[serde(default = "default_escalation_ceiling")]
    pub escalation_ceiling: u32,

    /// Cadence the hosting process should run the escalation sweep at.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Broadcast capacity of the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Bounded event history kept for diagnostics.
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: default_max_cas_retries(),
            escalation_ceiling: default_escalation_ceiling(),
            sweep_interval_secs: default_sweep_interval_secs(),
            event_capacity: default_event_capacity(),
            event_history: default_event_history(),
        }
    }
}

impl EngineConfig {
    /// Validates value ranges that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.escalation_ceiling == 0 {
            return Err(ConfigError::InvalidValue(
                "escalation_ceiling must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads the engine configuration from a YAML file.
pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: EngineConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Loads configuration from `VENDORGATE_ENGINE_CONFIG` when set, otherwise
/// returns defaults.
pub fn load_engine_config_from_env() -> Result<EngineConfig, ConfigError> {
    match env::var(ENGINE_CONFIG_ENV) {
        Ok(path) => load_engine_config(path),
        Err(_) => Ok(EngineConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = env::temp_dir().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_cas_retries, 3);
        assert_eq!(config.escalation_ceiling, 3);
        assert_eq!(config.sweep_interval_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_full_yaml() {
        let path = write_temp(
            "vg-engine-full.yaml",
            r#"
max_cas_retries: 5
escalation_ceiling: 2
sweep_interval_secs: 30
event_capacity: 256
event_history: 100
"#,
        );

        let config = load_engine_config(&path).unwrap();
        assert_eq!(config.max_cas_retries, 5);
        assert_eq!(config.escalation_ceiling, 2);
        assert_eq!(config.sweep_interval_secs, 30);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let path = write_temp("vg-engine-partial.yaml", "escalation_ceiling: 5\n");

        let config = load_engine_config(&path).unwrap();
        assert_eq!(config.escalation_ceiling, 5);
        assert_eq!(config.max_cas_retries, 3);
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let path = write_temp("vg-engine-zero.yaml", "escalation_ceiling: 0\n");

        let result = load_engine_config(&path);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = load_engine_config("/definitely/not/a/path.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let path = write_temp("vg-engine-broken.yaml", "max_cas_retries: [not a number\n");

        let result = load_engine_config(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
