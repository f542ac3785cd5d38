// Configuration Manager implementation for the HR workflow engine
//
// Resolves the configuration directory, loads `engine.toml` and layers
// environment overrides on top. Environment always wins over the file.

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

use super::types::{ConfigPaths, EngineConfig, EnvVars, LogLevel, ValidationResult};

/// Main configuration manager
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Effective configuration
    config: EngineConfig,
    /// Path to configuration directory
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a manager from the process environment
    pub async fn new() -> Result<Self> {
        let config_dir = Self::determine_config_dir()?;
        Self::load_with(config_dir, |name| env::var(name).ok()).await
    }

    /// Create a manager for an explicit directory, ignoring the environment
    pub async fn with_config_dir<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        Self::load_with(config_dir.as_ref().to_path_buf(), |_| None).await
    }

    async fn load_with<F>(config_dir: PathBuf, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        tracing::debug!("Using configuration directory: {:?}", config_dir);

        if !config_dir.exists() {
            async_fs::create_dir_all(&config_dir)
                .await
                .context("Failed to create configuration directory")?;
            tracing::info!("Created configuration directory: {:?}", config_dir);
        }

        let mut manager = Self {
            config: EngineConfig::default(),
            config_dir,
        };
        manager.load_config_file().await?;
        manager.apply_overrides(lookup);

        tracing::debug!("Configuration loaded");
        Ok(manager)
    }

    fn determine_config_dir() -> Result<PathBuf> {
        if let Ok(config_dir) = env::var(EnvVars::CONFIG_DIR) {
            return Ok(PathBuf::from(config_dir));
        }
        ConfigPaths::default_config_dir()
    }

    async fn load_config_file(&mut self) -> Result<()> {
        let config_file = self.config_file();
        if !config_file.exists() {
            tracing::debug!("Configuration file not found, using defaults");
            return Ok(());
        }

        let content = async_fs::read_to_string(&config_file)
            .await
            .with_context(|| format!("Failed to read configuration file: {}", config_file.display()))?;
        self.config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {}", config_file.display()))?;

        tracing::debug!("Loaded configuration from {:?}", config_file);
        Ok(())
    }

    /// Apply overrides from an environment lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(EnvVars::TEMPLATES_DIR) {
            self.config.templates_dir = Some(PathBuf::from(dir));
        }

        if let Some(file) = lookup(EnvVars::STATE_FILE) {
            self.config.state_file = Some(PathBuf::from(file));
        }

        if let Some(level) = lookup(EnvVars::LOG_LEVEL) {
            match level.parse::<LogLevel>() {
                Ok(level) => self.config.log_level = level,
                Err(e) => tracing::warn!("Ignoring {}: {}", EnvVars::LOG_LEVEL, e),
            }
        }

        if let Some(dir) = lookup(EnvVars::LOG_DIR) {
            self.config.log_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(ConfigPaths::CONFIG_FILE)
    }

    /// Template directory, defaulting to `templates/` in the config directory
    pub fn templates_dir(&self) -> PathBuf {
        self.config
            .templates_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.join(ConfigPaths::TEMPLATES_DIR))
    }

    /// Snapshot file, defaulting to `state.json` in the config directory
    pub fn state_file(&self) -> PathBuf {
        self.config
            .state_file
            .clone()
            .unwrap_or_else(|| self.config_dir.join(ConfigPaths::STATE_FILE))
    }

    /// Validate the current configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        for (integration_type, policy) in self.config.retry.iter() {
            if policy.max_retries == 0 {
                result.add_error(format!("retry.{}: max_retries must be greater than 0", integration_type));
            }
            if policy.base_delay > policy.max_delay {
                result.add_error(format!(
                    "retry.{}: base_delay_ms ({}) exceeds max_delay_ms ({})",
                    integration_type,
                    policy.base_delay.as_millis(),
                    policy.max_delay.as_millis()
                ));
            }
            if policy.attempt_timeout.is_zero() {
                result.add_error(format!("retry.{}: attempt_timeout_ms must be greater than 0", integration_type));
            } else if policy.attempt_timeout > policy.max_delay {
                result.add_warning(format!(
                    "retry.{}: attempt_timeout_ms ({}) exceeds max_delay_ms ({})",
                    integration_type,
                    policy.attempt_timeout.as_millis(),
                    policy.max_delay.as_millis()
                ));
            }
        }

        for (integration_type, endpoint) in self.config.providers.iter() {
            if let Err(e) = reqwest::Url::parse(endpoint) {
                result.add_error(format!(
                    "providers.{}: invalid endpoint '{}': {}",
                    integration_type, endpoint, e
                ));
            }
        }

        let templates_dir = self.templates_dir();
        if !templates_dir.is_dir() {
            result.add_warning(format!("Template directory does not exist: {:?}", templates_dir));
        }

        result
    }

    /// Write the current configuration to `engine.toml`
    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(&self.config).context("Failed to serialize configuration")?;
        async_fs::write(self.config_file(), content)
            .await
            .context("Failed to write configuration file")?;

        tracing::info!("Configuration saved to {:?}", self.config_file());
        Ok(())
    }
}
