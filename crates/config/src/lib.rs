//! Configuration loading and validation for parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use parley_flow::{DefinitionError, EventDecl, Vocabulary};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scheduler limits and action settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Which flow files to load and which flows to activate
    #[serde(default)]
    pub flows: FlowsConfig,

    /// Extra event tags on top of the standard vocabulary
    #[serde(default)]
    pub events: Vec<EventDecl>,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduler and action bridge limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Event deliveries allowed in one turn before the session is declared
    /// unreachable and discarded
    #[serde(default = "default_max_cascade_steps")]
    pub max_cascade_steps: usize,

    /// Instructions one flow may run without blocking
    #[serde(default = "default_max_steps_per_activation")]
    pub max_steps_per_activation: usize,

    /// Finished instances kept for status queries
    #[serde(default = "default_archive_limit")]
    pub archive_limit: usize,

    /// Seconds before an in-flight action is failed with a timeout
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,

    /// Buffer size of per-session output channels
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,
}

fn default_max_cascade_steps() -> usize {
    256
}
fn default_max_steps_per_activation() -> usize {
    10_000
}
fn default_archive_limit() -> usize {
    1_000
}
fn default_action_timeout_secs() -> u64 {
    30
}
fn default_output_capacity() -> usize {
    128
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_cascade_steps: default_max_cascade_steps(),
            max_steps_per_activation: default_max_steps_per_activation(),
            archive_limit: default_archive_limit(),
            action_timeout_secs: default_action_timeout_secs(),
            output_capacity: default_output_capacity(),
        }
    }
}

/// Flow sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowsConfig {
    /// Flow files (TOML or JSON), relative to the working directory
    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// Root flows activated when a session starts
    #[serde(default = "default_main_flows")]
    pub main: Vec<String>,
}

fn default_main_flows() -> Vec<String> {
    vec!["main".into()]
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            paths: vec![],
            main: default_main_flows(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Environment overrides:
    /// - `PARLEY_MAX_CASCADE_STEPS`
    /// - `PARLEY_FLOWS` (colon-separated flow file paths)
    /// - `PARLEY_LOG`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from `path`, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment-like lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(steps) = lookup("PARLEY_MAX_CASCADE_STEPS") {
            self.runtime.max_cascade_steps = steps.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "PARLEY_MAX_CASCADE_STEPS must be a positive integer, got '{steps}'"
                ))
            })?;
        }

        if let Some(paths) = lookup("PARLEY_FLOWS") {
            self.flows.paths = paths
                .split(':')
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Some(level) = lookup("PARLEY_LOG") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.max_cascade_steps == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.max_cascade_steps must be > 0".into(),
            ));
        }

        if self.runtime.max_steps_per_activation == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.max_steps_per_activation must be > 0".into(),
            ));
        }

        if self.runtime.output_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.output_capacity must be > 0".into(),
            ));
        }

        if self.runtime.action_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.action_timeout_secs must be > 0".into(),
            ));
        }

        if self.flows.main.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "flows.main entries cannot be empty".into(),
            ));
        }

        if let Some(decl) = self.events.iter().find(|e| e.name.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "event declaration with empty name (kind {:?})",
                decl.kind
            )));
        }

        Ok(())
    }

    /// The standard vocabulary extended with `[[events]]`.
    pub fn vocabulary(&self) -> Result<Vocabulary, ConfigError> {
        let mut vocabulary = Vocabulary::standard();
        vocabulary.extend(&self.events)?;
        Ok(vocabulary)
    }

    /// Generate a default config TOML string (for `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            flows: FlowsConfig::default(),
            events: vec![],
            logging: LoggingConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<DefinitionError> for ConfigError {
    fn from(err: DefinitionError) -> Self {
        ConfigError::ValidationError(err.to_string())
    }
}

impl From<ConfigError> for parley_core::Error {
    fn from(err: ConfigError) -> Self {
        parley_core::Error::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_flow::EventKind;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.max_cascade_steps, 256);
        assert_eq!(config.runtime.max_steps_per_activation, 10_000);
        assert_eq!(config.flows.main, vec!["main"]);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.runtime.archive_limit, config.runtime.archive_limit);
        assert_eq!(parsed.flows.main, config.flows.main);
    }

    #[test]
    fn zero_cascade_steps_rejected() {
        let mut config = AppConfig::default();
        config.runtime.max_cascade_steps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.runtime.action_timeout_secs, 30);
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("max_cascade_steps"));
        assert!(toml_str.contains("256"));
    }

    #[test]
    fn load_from_file_with_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[runtime]
max_cascade_steps = 64

[flows]
paths = ["flows/main.toml"]
main = ["main", "greeting"]

[[events]]
name = "BotShowCard"
kind = "output"

[[events]]
name = "UserClicked"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.runtime.max_cascade_steps, 64);
        assert_eq!(config.runtime.max_steps_per_activation, 10_000);
        assert_eq!(config.flows.main, vec!["main", "greeting"]);

        let vocabulary = config.vocabulary().unwrap();
        assert_eq!(vocabulary.kind("BotShowCard"), Some(EventKind::Output));
        assert_eq!(vocabulary.kind("UserClicked"), Some(EventKind::Input));
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[runtime\nmax_cascade_steps = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn conflicting_event_kind_rejected() {
        let config = AppConfig {
            events: vec![EventDecl {
                name: "BotSay".into(),
                kind: EventKind::Input,
                description: String::new(),
            }],
            ..AppConfig::default()
        };
        assert!(matches!(
            config.vocabulary(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("PARLEY_MAX_CASCADE_STEPS", "32"),
            ("PARLEY_FLOWS", "a.toml:b.json"),
            ("PARLEY_LOG", "debug"),
        ]
        .into();
        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.runtime.max_cascade_steps, 32);
        assert_eq!(
            config.flows.paths,
            vec![PathBuf::from("a.toml"), PathBuf::from("b.json")]
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn bad_env_override_rejected() {
        let mut config = AppConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "PARLEY_MAX_CASCADE_STEPS").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }
}
