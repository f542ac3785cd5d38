//! HR Workflow Engine Library
//!
//! Template-driven orchestration of employee lifecycle workflows: templates
//! are materialized into per-employee instances whose steps are gated by
//! their dependencies, integration steps are dispatched to external
//! providers with bounded retries, and unrecoverable problems surface as
//! exceptions for a person to resolve.

pub mod config;
pub mod error;
pub mod exception;
pub mod integration;
pub mod persistence;
pub mod progress;
pub mod service;
pub mod template;
pub mod utils;
pub mod workflow;

// Re-export main types for convenience
pub use config::ConfigManager;
pub use error::{ErrorKind, Result, WorkflowError};
pub use persistence::{EngineSnapshot, FileStateStore, StateStore};
pub use progress::ProgressReporter;
pub use service::WorkflowService;
pub use template::TemplateStore;
pub use workflow::InstanceEngine;
