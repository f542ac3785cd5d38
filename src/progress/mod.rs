// Progress Reporter module for the HR workflow engine
//
// Read-only aggregation over workflow and exception state for dashboards.
// Nothing here mutates the engine; percentages are recomputed from step
// state rather than read back from the stored field.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::exception::{ExceptionFilter, Severity, WorkflowException};
use crate::template::WorkflowType;
use crate::workflow::engine::percent;
use crate::workflow::{
    EmployeeWorkflow, InstanceEngine, StepId, StepStatus, WorkflowFilter, WorkflowId,
    WorkflowStatus, WorkflowView,
};

/// Organisation-wide counts
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Dashboard {
    pub total_workflows: usize,
    pub active: usize,
    pub on_hold: usize,
    pub completed: usize,
    pub cancelled: usize,
    /// Live workflows with at least one overdue step
    pub overdue_workflows: usize,
    /// Non-terminal steps past their due date, across live workflows
    pub overdue_steps: usize,
    pub open_exceptions: usize,
    /// Live workflows per lifecycle event
    pub live_by_type: BTreeMap<WorkflowType, usize>,
}

/// Step counts for one stage of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageBreakdown {
    pub stage: String,
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub failed: usize,
    pub blocked: usize,
    /// Required steps not yet completed or skipped
    pub required_outstanding: usize,
}

impl StageBreakdown {
    fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            total: 0,
            completed: 0,
            skipped: 0,
            in_progress: 0,
            pending: 0,
            failed: 0,
            blocked: 0,
            required_outstanding: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.completed + self.skipped == self.total
    }
}

/// Per-workflow detail
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowBreakdown {
    pub workflow: EmployeeWorkflow,
    /// Percent of steps completed or skipped
    pub progress: u8,
    /// Stages in step order
    pub stages: Vec<StageBreakdown>,
    pub overdue_steps: Vec<StepId>,
    pub open_exceptions: usize,
}

/// Open exceptions grouped by severity
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ExceptionBacklog {
    pub total_open: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub oldest_open: Option<DateTime<Utc>>,
}

/// Read-only view over the instance engine
#[derive(Clone)]
pub struct ProgressReporter {
    engine: InstanceEngine,
}

impl ProgressReporter {
    pub fn new(engine: InstanceEngine) -> Self {
        Self { engine }
    }

    pub async fn dashboard(&self, now: DateTime<Utc>) -> Dashboard {
        let views = self.engine.list_views(&WorkflowFilter::default()).await;
        let open = self.engine.exceptions().list(&ExceptionFilter::open()).await;
        summarize(&views, &open, now)
    }

    pub async fn workflow_breakdown(
        &self,
        workflow_id: WorkflowId,
        now: DateTime<Utc>,
    ) -> Result<WorkflowBreakdown> {
        let view = self.engine.get_workflow(workflow_id).await?;
        let open = self
            .engine
            .exceptions()
            .list(&ExceptionFilter::open().for_workflow(workflow_id))
            .await;
        Ok(breakdown(view, open.len(), now))
    }

    pub async fn exception_backlog(&self) -> ExceptionBacklog {
        let open = self.engine.exceptions().list(&ExceptionFilter::open()).await;
        backlog(&open)
    }
}

/// Dashboard counts over a set of workflows and their open exceptions
pub fn summarize(views: &[WorkflowView], open_exceptions: &[WorkflowException], now: DateTime<Utc>) -> Dashboard {
    let mut dashboard = Dashboard {
        total_workflows: views.len(),
        open_exceptions: open_exceptions.iter().filter(|e| e.is_open()).count(),
        ..Dashboard::default()
    };

    for view in views {
        let workflow = &view.workflow;
        match workflow.status {
            WorkflowStatus::Active => dashboard.active += 1,
            WorkflowStatus::OnHold => dashboard.on_hold += 1,
            WorkflowStatus::Completed => dashboard.completed += 1,
            WorkflowStatus::Cancelled => dashboard.cancelled += 1,
        }
        if !workflow.status.is_live() {
            continue;
        }

        *dashboard.live_by_type.entry(workflow.workflow_type).or_default() += 1;
        let overdue = view.steps.iter().filter(|s| s.is_overdue(now)).count();
        if overdue > 0 {
            dashboard.overdue_workflows += 1;
            dashboard.overdue_steps += overdue;
        }
    }

    dashboard
}

/// Stage-by-stage breakdown of one workflow
pub fn breakdown(view: WorkflowView, open_exceptions: usize, now: DateTime<Utc>) -> WorkflowBreakdown {
    let mut stages: Vec<StageBreakdown> = Vec::new();
    for step in &view.steps {
        let index = match stages.iter().position(|s| s.stage == step.stage) {
            Some(index) => index,
            None => {
                stages.push(StageBreakdown::new(&step.stage));
                stages.len() - 1
            }
        };
        let stage = &mut stages[index];
        stage.total += 1;
        match step.status {
            StepStatus::Completed => stage.completed += 1,
            StepStatus::Skipped => stage.skipped += 1,
            StepStatus::InProgress => stage.in_progress += 1,
            StepStatus::Pending => stage.pending += 1,
            StepStatus::Failed => stage.failed += 1,
            StepStatus::Blocked => stage.blocked += 1,
        }
        if step.required && !step.status.is_terminal() {
            stage.required_outstanding += 1;
        }
    }

    let done = view.steps.iter().filter(|s| s.status.is_terminal()).count();
    let overdue_steps = if view.workflow.status.is_live() {
        view.steps
            .iter()
            .filter(|s| s.is_overdue(now))
            .map(|s| s.id)
            .collect()
    } else {
        Vec::new()
    };

    WorkflowBreakdown {
        progress: percent(done, view.steps.len()),
        workflow: view.workflow,
        stages,
        overdue_steps,
        open_exceptions,
    }
}

/// Open exceptions by severity
pub fn backlog(exceptions: &[WorkflowException]) -> ExceptionBacklog {
    let mut backlog = ExceptionBacklog::default();
    for exception in exceptions.iter().filter(|e| e.is_open()) {
        backlog.total_open += 1;
        *backlog.by_severity.entry(exception.severity).or_default() += 1;
        backlog.oldest_open = Some(match backlog.oldest_open {
            Some(oldest) => oldest.min(exception.raised_at),
            None => exception.raised_at,
        });
    }
    backlog
}
