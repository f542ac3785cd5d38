// Configuration module for the HR workflow engine
//
// Loads `engine.toml` from the configuration directory and layers
// `HRFLOW_*` environment overrides on top.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::{ConfigPaths, EngineConfig, EnvVars, LogLevel, ProviderEndpoints, ValidationResult};
