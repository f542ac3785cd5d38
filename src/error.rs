// Error taxonomy for the HR workflow engine
//
// Every rejected operation returns a `WorkflowError`. Callers map the stable
// `ErrorKind` code onto their own transport-level status codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::integration::IntegrationType;

/// Errors returned by engine operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// Template name or id did not resolve
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Workflow instance does not exist
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(uuid::Uuid),

    /// Step does not exist
    #[error("Step not found: {0}")]
    StepNotFound(uuid::Uuid),

    /// Exception record does not exist
    #[error("Exception not found: {0}")]
    ExceptionNotFound(uuid::Uuid),

    /// At least one dependency is not completed or skipped
    #[error("Step '{step}' has unsatisfied dependencies: {}", .pending.join(", "))]
    DependencyNotSatisfied { step: String, pending: Vec<String> },

    /// Exception was resolved earlier
    #[error("Exception {0} is already resolved")]
    AlreadyResolved(uuid::Uuid),

    /// Operation is not legal from the current status
    #[error("Cannot {operation} {entity} '{id}' while it is {status}")]
    InvalidStatus {
        entity: &'static str,
        id: String,
        status: String,
        operation: &'static str,
    },

    /// Workflow was cancelled and accepts no further mutation
    #[error("Workflow {0} is cancelled")]
    WorkflowCancelled(uuid::Uuid),

    /// Step dependency graph contains a cycle
    #[error("Cyclic dependency between steps: {}", .steps.join(", "))]
    CyclicDependency { steps: Vec<String> },

    /// Template still backs live workflow instances
    #[error("Template {template} is referenced by {live_instances} live workflow(s)")]
    TemplateInUse {
        template: uuid::Uuid,
        live_instances: usize,
    },

    /// Input failed structural validation
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Input collides with existing state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No provider is registered for the integration type
    #[error("No provider registered for integration type {0}")]
    IntegrationUnavailable(IntegrationType),
}

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Stable error code exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TemplateNotFound,
    WorkflowNotFound,
    StepNotFound,
    ExceptionNotFound,
    DependencyNotSatisfied,
    AlreadyResolved,
    InvalidStatus,
    WorkflowCancelled,
    CyclicDependency,
    TemplateInUse,
    Validation,
    Conflict,
    IntegrationUnavailable,
}

/// Coarse grouping of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input, rejected before anything is persisted
    Validation,
    /// Precondition not met; retry after satisfying it
    StateConflict,
    /// Referenced entity does not exist
    NotFound,
    /// External collaborator problem
    Integration,
}

impl ErrorKind {
    /// Stable snake_case code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TemplateNotFound => "template_not_found",
            ErrorKind::WorkflowNotFound => "workflow_not_found",
            ErrorKind::StepNotFound => "step_not_found",
            ErrorKind::ExceptionNotFound => "exception_not_found",
            ErrorKind::DependencyNotSatisfied => "dependency_not_satisfied",
            ErrorKind::AlreadyResolved => "already_resolved",
            ErrorKind::InvalidStatus => "invalid_status",
            ErrorKind::WorkflowCancelled => "workflow_cancelled",
            ErrorKind::CyclicDependency => "cyclic_dependency",
            ErrorKind::TemplateInUse => "template_in_use",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::IntegrationUnavailable => "integration_unavailable",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::CyclicDependency | ErrorKind::Validation => ErrorCategory::Validation,
            ErrorKind::DependencyNotSatisfied
            | ErrorKind::AlreadyResolved
            | ErrorKind::InvalidStatus
            | ErrorKind::WorkflowCancelled
            | ErrorKind::TemplateInUse
            | ErrorKind::Conflict => ErrorCategory::StateConflict,
            ErrorKind::TemplateNotFound
            | ErrorKind::WorkflowNotFound
            | ErrorKind::StepNotFound
            | ErrorKind::ExceptionNotFound => ErrorCategory::NotFound,
            ErrorKind::IntegrationUnavailable => ErrorCategory::Integration,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkflowError {
    /// Stable kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::TemplateNotFound(_) => ErrorKind::TemplateNotFound,
            WorkflowError::WorkflowNotFound(_) => ErrorKind::WorkflowNotFound,
            WorkflowError::StepNotFound(_) => ErrorKind::StepNotFound,
            WorkflowError::ExceptionNotFound(_) => ErrorKind::ExceptionNotFound,
            WorkflowError::DependencyNotSatisfied { .. } => ErrorKind::DependencyNotSatisfied,
            WorkflowError::AlreadyResolved(_) => ErrorKind::AlreadyResolved,
            WorkflowError::InvalidStatus { .. } => ErrorKind::InvalidStatus,
            WorkflowError::WorkflowCancelled(_) => ErrorKind::WorkflowCancelled,
            WorkflowError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            WorkflowError::TemplateInUse { .. } => ErrorKind::TemplateInUse,
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::Conflict(_) => ErrorKind::Conflict,
            WorkflowError::IntegrationUnavailable(_) => ErrorKind::IntegrationUnavailable,
        }
    }

    /// Build an `InvalidStatus` error
    pub fn invalid_status(
        entity: &'static str,
        id: impl ToString,
        status: impl std::fmt::Display,
        operation: &'static str,
    ) -> Self {
        WorkflowError::InvalidStatus {
            entity,
            id: id.to_string(),
            status: status.to_string(),
            operation,
        }
    }
}
