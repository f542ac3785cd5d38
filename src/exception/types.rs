// Exception data model
//
// Exceptions are human-attention tickets attached to a workflow. They are
// never deleted; resolving one closes it and records who closed it and why.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ActorId, StepId, WorkflowId};

/// Unique identifier for an exception
pub type ExceptionId = Uuid;

/// What raised the exception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionType {
    /// Integration retries exhausted
    IntegrationFailure,
    /// A step cannot proceed because something it depends on failed
    DependencyFailure,
    /// Flagged by a person
    ManualFlag,
    /// Step or workflow ran past its due date
    DeadlineMissed,
}

impl std::fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionType::IntegrationFailure => write!(f, "integration_failure"),
            ExceptionType::DependencyFailure => write!(f, "dependency_failure"),
            ExceptionType::ManualFlag => write!(f, "manual_flag"),
            ExceptionType::DeadlineMissed => write!(f, "deadline_missed"),
        }
    }
}

impl std::str::FromStr for ExceptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "integration_failure" => Ok(ExceptionType::IntegrationFailure),
            "dependency_failure" => Ok(ExceptionType::DependencyFailure),
            "manual_flag" | "manual" => Ok(ExceptionType::ManualFlag),
            "deadline_missed" => Ok(ExceptionType::DeadlineMissed),
            _ => Err(format!("Invalid exception type: {}", s)),
        }
    }
}

/// How urgently the exception needs attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionStatus {
    Open,
    Resolved,
}

impl std::fmt::Display for ExceptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionStatus::Open => write!(f, "open"),
            ExceptionStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// Exception raised against a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowException {
    /// Unique identifier
    pub id: ExceptionId,
    /// Workflow the exception belongs to
    pub workflow_id: WorkflowId,
    /// Step involved, if any
    pub step_id: Option<StepId>,
    pub exception_type: ExceptionType,
    pub severity: Severity,
    pub status: ExceptionStatus,
    /// Short summary
    pub title: String,
    /// Details, including the affected steps
    pub description: String,
    /// Actor or subsystem that raised it
    pub raised_by: ActorId,
    pub assigned_to: Option<ActorId>,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<ActorId>,
    pub resolution_notes: Option<String>,
}

impl WorkflowException {
    pub fn is_open(&self) -> bool {
        self.status == ExceptionStatus::Open
    }
}

/// Input for raising an exception
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewException {
    pub workflow_id: WorkflowId,
    pub step_id: Option<StepId>,
    pub exception_type: ExceptionType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub raised_by: ActorId,
    pub assigned_to: Option<ActorId>,
}

impl NewException {
    /// Manually flagged exception with the required fields
    pub fn manual(
        workflow_id: WorkflowId,
        severity: Severity,
        title: impl Into<String>,
        raised_by: impl Into<ActorId>,
    ) -> Self {
        Self {
            workflow_id,
            step_id: None,
            exception_type: ExceptionType::ManualFlag,
            severity,
            title: title.into(),
            description: String::new(),
            raised_by: raised_by.into(),
            assigned_to: None,
        }
    }

    pub fn for_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn assigned_to(mut self, assignee: impl Into<ActorId>) -> Self {
        self.assigned_to = Some(assignee.into());
        self
    }
}

/// Filter for exception queries; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionFilter {
    pub workflow_id: Option<WorkflowId>,
    pub status: Option<ExceptionStatus>,
    /// Minimum severity
    pub min_severity: Option<Severity>,
    pub exception_type: Option<ExceptionType>,
}

impl ExceptionFilter {
    /// Open exceptions only
    pub fn open() -> Self {
        Self {
            status: Some(ExceptionStatus::Open),
            ..Self::default()
        }
    }

    pub fn for_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn matches(&self, exception: &WorkflowException) -> bool {
        self.workflow_id.map_or(true, |id| exception.workflow_id == id)
            && self.status.map_or(true, |s| exception.status == s)
            && self.min_severity.map_or(true, |s| exception.severity >= s)
            && self
                .exception_type
                .map_or(true, |t| exception.exception_type == t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
    }

    #[test]
    fn test_exception_type_names() {
        assert_eq!(
            serde_json::to_string(&ExceptionType::IntegrationFailure).unwrap(),
            "\"integration_failure\""
        );
        assert_eq!(
            "deadline-missed".parse::<ExceptionType>().unwrap(),
            ExceptionType::DeadlineMissed
        );
    }

    #[test]
    fn test_filter_min_severity() {
        let new = NewException::manual(Uuid::new_v4(), Severity::Medium, "Missing I-9", "hr-1");
        let exception = WorkflowException {
            id: Uuid::new_v4(),
            workflow_id: new.workflow_id,
            step_id: None,
            exception_type: new.exception_type,
            severity: new.severity,
            status: ExceptionStatus::Open,
            title: new.title,
            description: new.description,
            raised_by: new.raised_by,
            assigned_to: None,
            raised_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        };

        let mut filter = ExceptionFilter::open();
        assert!(filter.matches(&exception));
        filter.min_severity = Some(Severity::High);
        assert!(!filter.matches(&exception));
        assert!(!ExceptionFilter::default()
            .for_workflow(Uuid::new_v4())
            .matches(&exception));
    }
}
