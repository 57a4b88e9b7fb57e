//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::PathBuf;

use inkbind_config::AppConfig;
use tempfile::TempDir;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .policy("program")
///     .program_option("terminal", "ascii_mode", true)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn policy(mut self, policy: &str) -> Self {
        self.config.session.policy = policy.to_string();
        self
    }

    pub fn global_policy(mut self, policy: &str) -> Self {
        self.config.session.global_policy = Some(policy.to_string());
        self
    }

    pub fn default_option(mut self, name: &str, value: bool) -> Self {
        self.config
            .session
            .default_options
            .insert(name.to_string(), value);
        self
    }

    pub fn program_option(mut self, program: &str, name: &str, value: bool) -> Self {
        self.config
            .session
            .program_options
            .entry(program.to_string())
            .or_default()
            .insert(name.to_string(), value);
        self
    }

    pub fn allow_window_secs(mut self, secs: u64) -> Self {
        self.config.notifications.allow_window_secs = secs;
        self
    }

    pub fn silence_window_secs(mut self, secs: u64) -> Self {
        self.config.notifications.silence_window_secs = secs;
        self
    }

    pub fn max_buffered_keys(mut self, n: usize) -> Self {
        self.config.deploy.max_buffered_keys = n;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A config file in an owned temp directory.
///
/// The temp directory is deleted automatically when this value is dropped,
/// guaranteeing cleanup even on panic.
pub struct TestConfigFile {
    pub path: PathBuf,
    _temp_dir: TempDir,
}

impl TestConfigFile {
    /// Write the given TOML to a fresh temp file.
    pub async fn with_toml(toml_content: &str) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("inkbind.toml");
        tokio::fs::write(&path, toml_content)
            .await
            .expect("failed to write test config");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Overwrite the temp config file with new content (for reload testing).
    pub async fn write(&self, toml_content: &str) {
        tokio::fs::write(&self.path, toml_content)
            .await
            .expect("failed to write updated config");
    }

    /// Load the file back through the normal config path.
    pub async fn load(&self) -> AppConfig {
        AppConfig::load(&self.path)
            .await
            .expect("failed to parse test config")
    }
}
