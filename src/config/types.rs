// Configuration types for the HR workflow engine
//
// `EngineConfig` is the on-disk shape of `engine.toml`. Paths left unset are
// resolved against the configuration directory by the manager.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::integration::{IntegrationType, RetryPolicies};

/// Log level for the engine and CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

/// HTTP endpoints for integration providers
///
/// Types without an endpoint have no live provider; the CLI falls back to the
/// simulated one for them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docusign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_check: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_search: Option<String>,
}

impl ProviderEndpoints {
    pub fn for_type(&self, integration_type: IntegrationType) -> Option<&str> {
        match integration_type {
            IntegrationType::Docusign => self.docusign.as_deref(),
            IntegrationType::BackgroundCheck => self.background_check.as_deref(),
            IntegrationType::DocSearch => self.doc_search.as_deref(),
        }
    }

    /// Configured endpoints, paired with their type
    pub fn iter(&self) -> impl Iterator<Item = (IntegrationType, &str)> + '_ {
        IntegrationType::ALL
            .into_iter()
            .filter_map(move |t| self.for_type(t).map(|endpoint| (t, endpoint)))
    }
}

/// Engine configuration as stored in `engine.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory scanned for YAML template definitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_dir: Option<PathBuf>,
    /// Snapshot file used by the CLI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Directory for rolling log files; console only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Retry policy per integration type
    #[serde(default)]
    pub retry: RetryPolicies,
    /// Provider endpoints per integration type
    #[serde(default)]
    pub providers: ProviderEndpoints,
}

/// Configuration validation result
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// Whether the configuration is valid
    pub is_valid: bool,
    /// Validation errors
    pub errors: Vec<String>,
    /// Validation warnings
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn has_issues(&self) -> bool {
        !self.errors.is_empty() || !self.warnings.is_empty()
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Environment variable names
pub struct EnvVars;

impl EnvVars {
    pub const CONFIG_DIR: &'static str = "HRFLOW_CONFIG_DIR";
    pub const TEMPLATES_DIR: &'static str = "HRFLOW_TEMPLATES_DIR";
    pub const STATE_FILE: &'static str = "HRFLOW_STATE_FILE";
    pub const LOG_LEVEL: &'static str = "HRFLOW_LOG_LEVEL";
    pub const LOG_DIR: &'static str = "HRFLOW_LOG_DIR";
}

/// Configuration file paths and names
pub struct ConfigPaths;

impl ConfigPaths {
    /// Default configuration directory name under the home directory
    pub const CONFIG_DIR_NAME: &'static str = ".hrflow";

    pub const CONFIG_FILE: &'static str = "engine.toml";

    /// Default template directory name inside the configuration directory
    pub const TEMPLATES_DIR: &'static str = "templates";

    /// Default snapshot file name inside the configuration directory
    pub const STATE_FILE: &'static str = "state.json";

    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(Self::CONFIG_DIR_NAME))
            .context("Failed to determine home directory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_display_and_parse() {
        assert_eq!(LogLevel::Error.to_string(), "error");
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_engine_config_from_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
log_level = "debug"
templates_dir = "/srv/hr/templates"

[retry.default]
max_retries = 5

[retry.docusign]
max_retries = 2
base_delay_ms = 1000

[providers]
background_check = "https://checks.example.com/v1/run"
"#,
        )
        .unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.templates_dir, Some(PathBuf::from("/srv/hr/templates")));
        assert_eq!(config.retry.for_type(IntegrationType::DocSearch).max_retries, 5);
        assert_eq!(config.retry.for_type(IntegrationType::Docusign).max_retries, 2);
        assert_eq!(
            config.providers.iter().collect::<Vec<_>>(),
            vec![(IntegrationType::BackgroundCheck, "https://checks.example.com/v1/run")]
        );
        assert!(config.state_file.is_none());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_validation_result() {
        let mut result = ValidationResult::new();
        assert!(result.is_valid);
        assert!(!result.has_issues());

        result.add_warning("slow".to_string());
        assert!(result.is_valid);
        result.add_error("broken".to_string());
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
    }
}
