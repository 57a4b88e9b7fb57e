#![deny(unsafe_code)]

//! Configuration loading and validation for inkbind.
//!
//! Loads TOML configuration files and validates them against expected values.
//! Provides the [`AppConfig`] type as the central configuration structure
//! consumed by the core service. Configuration changes are pushed into the
//! running service by the host (a `config_changed` call); nothing here polls
//! the filesystem.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Valid values for the session sharing policy fields.
pub const VALID_POLICIES: [&str; 4] = ["follow-global", "all", "program", "no"];

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Session sharing and option configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Notification window configuration.
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Deploy/sync coordinator configuration.
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How engine sessions are shared between input contexts, and which option
/// values new sessions start with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sharing policy: "follow-global", "all", "program", or "no".
    #[serde(default = "default_policy")]
    pub policy: String,

    /// The host framework's global sharing default, resolved when `policy`
    /// is "follow-global". Absent or unusable values resolve to "no".
    #[serde(default)]
    pub global_policy: Option<String>,

    /// Option values applied to every newly created session.
    #[serde(default)]
    pub default_options: HashMap<String, bool>,

    /// Per-program option overrides, keyed by program identity.
    /// Overrides take precedence over `default_options`.
    #[serde(default)]
    pub program_options: HashMap<String, HashMap<String, bool>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            global_policy: None,
            default_options: HashMap::new(),
            program_options: HashMap::new(),
        }
    }
}

fn default_policy() -> String {
    "all".to_string()
}

/// Durations for the notification gate's windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// How long user-requested feedback stays allow-listed, in seconds.
    #[serde(default = "default_allow_window_secs")]
    pub allow_window_secs: u64,

    /// How long noisy notifications are silenced after a deploy finishes,
    /// in seconds.
    #[serde(default = "default_silence_window_secs")]
    pub silence_window_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            allow_window_secs: default_allow_window_secs(),
            silence_window_secs: default_silence_window_secs(),
        }
    }
}

fn default_allow_window_secs() -> u64 {
    60
}

fn default_silence_window_secs() -> u64 {
    30
}

/// Deploy/sync coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Maximum number of key events buffered while a deploy cycle is in
    /// flight. Further events are dropped with a warning.
    #[serde(default = "default_max_buffered_keys")]
    pub max_buffered_keys: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            max_buffered_keys: default_max_buffered_keys(),
        }
    }
}

fn default_max_buffered_keys() -> usize {
    32
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_POLICIES.contains(&self.session.policy.as_str()) {
            return Err(ConfigError::Validation(format!(
                "session.policy must be one of {:?}, got {:?}",
                VALID_POLICIES, self.session.policy
            )));
        }
        // A present-but-misspelled global policy is a config mistake and is
        // rejected here; "follow-global" as the global value itself parses
        // but resolves conservatively at lookup time.
        if let Some(global) = &self.session.global_policy {
            if !VALID_POLICIES.contains(&global.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "session.global_policy must be one of {:?}, got {:?}",
                    VALID_POLICIES, global
                )));
            }
        }
        for program in self.session.program_options.keys() {
            if program.is_empty() {
                return Err(ConfigError::Validation(
                    "session.program_options keys must not be empty".to_string(),
                ));
            }
        }
        if self.notifications.allow_window_secs == 0 {
            return Err(ConfigError::Validation(
                "notifications.allow_window_secs must be non-zero".to_string(),
            ));
        }
        if self.deploy.max_buffered_keys == 0 {
            return Err(ConfigError::Validation(
                "deploy.max_buffered_keys must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.session.policy, "all");
        assert_eq!(config.session.global_policy, None);
        assert!(config.session.program_options.is_empty());
        assert_eq!(config.notifications.allow_window_secs, 60);
        assert_eq!(config.notifications.silence_window_secs, 30);
        assert_eq!(config.deploy.max_buffered_keys, 32);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.session.policy, "all");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [session]
            policy = "program"
            global_policy = "no"

            [session.default_options]
            ascii_mode = false

            [session.program_options."org.example.terminal"]
            ascii_mode = true

            [notifications]
            allow_window_secs = 10
            silence_window_secs = 5

            [deploy]
            max_buffered_keys = 8

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.session.policy, "program");
        assert_eq!(config.session.global_policy.as_deref(), Some("no"));
        assert_eq!(config.session.default_options.get("ascii_mode"), Some(&false));
        assert_eq!(
            config
                .session
                .program_options
                .get("org.example.terminal")
                .and_then(|opts| opts.get("ascii_mode")),
            Some(&true)
        );
        assert_eq!(config.notifications.allow_window_secs, 10);
        assert_eq!(config.deploy.max_buffered_keys, 8);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_unknown_policy() {
        let toml = r#"
            [session]
            policy = "everyone"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_global_policy() {
        let toml = r#"
            [session]
            global_policy = "sometimes"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_follow_global_as_global_policy_parses() {
        // Resolution handles this case conservatively at lookup time.
        let toml = r#"
            [session]
            policy = "follow-global"
            global_policy = "follow-global"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.session.policy, "follow-global");
    }

    #[test]
    fn test_validation_rejects_zero_allow_window() {
        let toml = r#"
            [notifications]
            allow_window_secs = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_key_buffer() {
        let toml = r#"
            [deploy]
            max_buffered_keys = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_program_key() {
        let toml = r#"
            [session.program_options.""]
            ascii_mode = true
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("inkbind.toml");
        tokio::fs::write(&path, b"[session]\npolicy = \"no\"\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.session.policy, "no");
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/inkbind.toml")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        assert!(AppConfig::load(&path).await.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }
}
