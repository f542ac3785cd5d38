// Workflow instance data model
//
// An `EmployeeWorkflow` is one running instance of a template (or an ad hoc
// step list) for one employee. Its steps are copied at initiation and carry
// all runtime state; later template edits never reach them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::integration::WorkflowIntegration;
use crate::template::{AssigneeRole, IntegrationBinding, StepKey, StepType, TemplateId, WorkflowType};

/// Unique identifier for a workflow instance
pub type WorkflowId = Uuid;

/// Unique identifier for a step instance
pub type StepId = Uuid;

/// Opaque employee reference owned by the HRIS
pub type EmployeeId = String;

/// Opaque reference to the person or system acting on a workflow
pub type ActorId = String;

/// Lifecycle status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Active,
    Completed,
    Cancelled,
    OnHold,
}

impl WorkflowStatus {
    /// Whether the workflow still counts against its template
    pub fn is_live(&self) -> bool {
        matches!(self, WorkflowStatus::Active | WorkflowStatus::OnHold)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Active => write!(f, "active"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
            WorkflowStatus::OnHold => write!(f, "on-hold"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "active" => Ok(WorkflowStatus::Active),
            "completed" => Ok(WorkflowStatus::Completed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            "on-hold" => Ok(WorkflowStatus::OnHold),
            _ => Err(format!("Invalid workflow status: {}", s)),
        }
    }
}

/// Lifecycle status of a step instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    /// A dependency (directly or transitively) failed
    Blocked,
}

impl StepStatus {
    /// Completed or skipped: satisfies dependents and counts toward progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in-progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Workflow instance for one employee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeWorkflow {
    /// Unique identifier
    pub id: WorkflowId,
    /// Employee the workflow is for
    pub employee_id: EmployeeId,
    /// Source template; `None` for ad hoc instances
    pub template_id: Option<TemplateId>,
    /// Template version copied at initiation
    pub template_version: Option<u32>,
    /// Display name, taken from the template
    pub name: String,
    /// Lifecycle event
    pub workflow_type: WorkflowType,
    /// Current status
    pub status: WorkflowStatus,
    /// Stage label progress narration is at
    pub current_stage: String,
    /// Percent of steps completed or skipped
    pub progress: u8,
    /// Actor who initiated the workflow
    pub initiated_by: ActorId,
    pub started_at: DateTime<Utc>,
    /// Latest step due date
    pub expected_completion: DateTime<Utc>,
    /// Set when every step is completed or skipped
    pub actual_completion: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl EmployeeWorkflow {
    /// Whether the workflow is past its expected completion while still live
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_live() && now > self.expected_completion
    }
}

/// Step instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique identifier
    pub id: StepId,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Key of the definition the step was copied from
    pub key: StepKey,
    /// Position within the workflow
    pub order: u32,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub stage: String,
    pub required: bool,
    pub auto_trigger: bool,
    pub status: StepStatus,
    /// Steps that must be completed or skipped first
    pub dependencies: BTreeSet<StepId>,
    pub assigned_role: AssigneeRole,
    /// Specific person the step is assigned to
    pub assigned_to: Option<ActorId>,
    pub due_date: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<ActorId>,
    /// Integration executed when the step runs
    pub integration: Option<IntegrationBinding>,
    /// Free-form details such as skip reasons and failure messages
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowStep {
    /// Whether the step is past due and still open
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now > self.due_date
    }

    pub(crate) fn set_metadata(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// Workflow with its steps, as returned by GetWorkflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowView {
    pub workflow: EmployeeWorkflow,
    /// Steps sorted by order
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowView {
    /// Look up a step by its definition key
    pub fn step(&self, key: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// Steps whose dependencies are all satisfied and that can be started now
    pub fn eligible_steps(&self) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .filter(|step| {
                step.dependencies.iter().all(|dep| {
                    self.steps
                        .iter()
                        .any(|other| &other.id == dep && other.status.is_terminal())
                })
            })
            .collect()
    }
}

/// Full persisted state of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow: EmployeeWorkflow,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub integrations: Vec<WorkflowIntegration>,
}

/// Filter for ListWorkflows; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFilter {
    pub employee_id: Option<EmployeeId>,
    pub status: Option<WorkflowStatus>,
    pub workflow_type: Option<WorkflowType>,
    pub template_id: Option<TemplateId>,
}

impl WorkflowFilter {
    pub fn matches(&self, workflow: &EmployeeWorkflow) -> bool {
        self.employee_id
            .as_ref()
            .map_or(true, |id| &workflow.employee_id == id)
            && self.status.map_or(true, |s| workflow.status == s)
            && self.workflow_type.map_or(true, |t| workflow.workflow_type == t)
            && self
                .template_id
                .map_or(true, |t| workflow.template_id == Some(t))
    }
}

/// Result of CheckWorkflowProgress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub current_stage: String,
    /// Percent of steps completed or skipped
    pub progress: u8,
    pub total_steps: usize,
    pub completed: usize,
    pub skipped: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub failed: usize,
    pub blocked: usize,
}

/// Result of a step transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepUpdate {
    /// Step after the transition
    pub step: WorkflowStep,
    /// False when the call was an idempotent repeat
    pub changed: bool,
    /// Steps that became startable because of this transition
    pub newly_eligible: Vec<StepId>,
    /// Progress after the transition
    pub progress: u8,
    pub workflow_status: WorkflowStatus,
}

/// Result of AdvanceStage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAdvance {
    pub previous_stage: String,
    pub current_stage: String,
    pub advanced: bool,
}

/// Integration hand-off returned when a dispatch begins
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationTicket {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub integration_id: crate::integration::IntegrationId,
    pub integration_type: crate::integration::IntegrationType,
    pub payload: serde_json::Value,
    pub max_retries: u32,
}
