//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Prefix for environment variable overrides, e.g. `TURNSTILE__LIMITER__MAX_ATTEMPTS=5`.
const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Longest reaper interval accepted (one year).
pub const MAX_CLEANUP_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Parameters of the sliding window limiter and its reaper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Length of the trailing window in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Admissions allowed per identifier within one window
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Seconds between reaper sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Longest identifier accepted, in bytes
    #[serde(default = "default_max_identifier_len")]
    pub max_identifier_len: usize,

    /// Whether the reaper drops identifiers with no attempts left in the window
    #[serde(default = "default_evict_idle")]
    pub evict_idle: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_attempts: default_max_attempts(),
            cleanup_interval_secs: default_cleanup_interval(),
            max_identifier_len: default_max_identifier_len(),
            evict_idle: default_evict_idle(),
        }
    }
}

impl LimiterConfig {
    /// The window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// The reaper interval as a `Duration`.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Check that every parameter is usable.
    pub fn validate(&self) -> Result<()> {
        if self.window_secs == 0 {
            return Err(TurnstileError::Config(
                "limiter.window_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(TurnstileError::Config(
                "limiter.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "limiter.cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_interval_secs > MAX_CLEANUP_INTERVAL_SECS {
            return Err(TurnstileError::Config(format!(
                "limiter.cleanup_interval_secs must be at most {}",
                MAX_CLEANUP_INTERVAL_SECS
            )));
        }
        if self.max_identifier_len == 0 {
            return Err(TurnstileError::Config(
                "limiter.max_identifier_len must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_attempts() -> usize {
    10
}

fn default_cleanup_interval() -> u64 {
    300
}

// Long enough for any textual IPv6 address with a zone suffix.
fn default_max_identifier_len() -> usize {
    64
}

fn default_evict_idle() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.limiter.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional YAML file, then
    /// `TURNSTILE__*` environment variables, in increasing precedence.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&str>, env: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Yaml));
        }

        let config: TurnstileConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.limiter.validate()?;
        Ok(config)
    }
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config() {
        let config = TurnstileConfig::default();
        assert_eq!(config.limiter.window(), Duration::from_secs(60));
        assert_eq!(config.limiter.max_attempts, 10);
        assert_eq!(config.limiter.cleanup_interval(), Duration::from_secs(300));
        assert!(config.limiter.evict_idle);
        assert_eq!(config.logging.level, "info");
        assert_ok!(config.limiter.validate());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
limiter:
  max_attempts: 3
  evict_idle: false
"#;
        let config = assert_ok!(TurnstileConfig::from_yaml(yaml));
        assert_eq!(config.limiter.max_attempts, 3);
        assert!(!config.limiter.evict_idle);
        assert_eq!(config.limiter.window_secs, 60);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_from_yaml_rejects_zero_window() {
        let yaml = "limiter:\n  window_secs: 0\n";
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = LimiterConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_err!(config.validate());
    }

    #[test]
    fn test_validate_rejects_huge_cleanup_interval() {
        let config = LimiterConfig {
            cleanup_interval_secs: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TurnstileError::Config(_))));

        let config = LimiterConfig {
            cleanup_interval_secs: MAX_CLEANUP_INTERVAL_SECS,
            ..Default::default()
        };
        assert_ok!(config.validate());
    }

    #[test]
    fn test_load_env_rejects_huge_cleanup_interval() {
        let mut vars = HashMap::new();
        vars.insert(
            "TURNSTILE__LIMITER__CLEANUP_INTERVAL_SECS".to_string(),
            u64::MAX.to_string(),
        );

        let err = TurnstileConfig::load_with_env(None, environment().source(Some(vars))).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_load_layers_file_then_env() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("turnstile.yaml");
        std::fs::write(
            &path,
            "limiter:\n  window_secs: 30\n  max_attempts: 4\nlogging:\n  level: debug\n",
        )
        .unwrap();

        let mut vars = HashMap::new();
        vars.insert(
            "TURNSTILE__LIMITER__MAX_ATTEMPTS".to_string(),
            "7".to_string(),
        );

        let config = assert_ok!(TurnstileConfig::load_with_env(
            path.to_str(),
            environment().source(Some(vars))
        ));
        // File over defaults
        assert_eq!(config.limiter.window_secs, 30);
        assert_eq!(config.logging.level, "debug");
        // Env over file
        assert_eq!(config.limiter.max_attempts, 7);
        // Untouched defaults
        assert_eq!(config.limiter.cleanup_interval_secs, 300);
        assert!(config.limiter.evict_idle);
    }

    #[test]
    fn test_load_env_overrides() {
        let mut vars = HashMap::new();
        vars.insert(
            "TURNSTILE__LIMITER__MAX_ATTEMPTS".to_string(),
            "5".to_string(),
        );
        vars.insert("TURNSTILE__LOGGING__JSON".to_string(), "true".to_string());

        let config = assert_ok!(TurnstileConfig::load_with_env(
            None,
            environment().source(Some(vars))
        ));
        assert_eq!(config.limiter.max_attempts, 5);
        assert_eq!(config.limiter.window_secs, 60);
        assert!(config.logging.json);
    }

    #[test]
    fn test_from_file_missing() {
        let err = TurnstileConfig::from_file("/nonexistent/turnstile.yaml").unwrap_err();
        assert!(matches!(err, TurnstileError::Io(_)));
    }
}
