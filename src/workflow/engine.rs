// Instance engine: the step state machine
//
// Each workflow instance lives behind its own `tokio::sync::Mutex`; every
// step transition and the dependency re-evaluation that follows it happen
// under that one lock. There is no engine-wide write lock on the hot path:
// the instance map is only write-locked to insert new instances.
//
// Lock order is instance → exception store → template store. Provider calls
// never happen under an instance lock; the dispatcher calls
// `begin_integration` and `apply_attempt` around them.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventSink, WorkflowEvent};
use super::types::*;
use crate::error::{Result, WorkflowError};
use crate::exception::{
    ExceptionId, ExceptionManager, ExceptionType, NewException, Severity, WorkflowException,
};
use crate::integration::{
    AttemptDisposition, AttemptOutcome, IntegrationStatus, IntegrationType, WorkflowIntegration,
};
use crate::template::{
    validate_steps, StepDefinition, StepType, TemplateId, TemplateRef, TemplateStore,
    WorkflowTemplate, WorkflowType,
};

type Slot = Arc<Mutex<WorkflowState>>;

/// Actor recorded when a dispatcher completes or fails a step
pub const DISPATCHER_ACTOR: &str = "integration-dispatcher";

/// Owner of all workflow instances and their step state
#[derive(Clone)]
pub struct InstanceEngine {
    /// Source of templates for initiation
    templates: Arc<TemplateStore>,
    /// Exception store shared with the service
    exceptions: ExceptionManager,
    /// Instances indexed by workflow id
    workflows: Arc<RwLock<HashMap<WorkflowId, Slot>>>,
    /// Owning workflow of every step
    step_index: Arc<RwLock<HashMap<StepId, WorkflowId>>>,
    /// Optional event stream
    events: EventSink,
}

impl InstanceEngine {
    /// Create an engine without event reporting
    pub fn new(templates: Arc<TemplateStore>, exceptions: ExceptionManager) -> Self {
        Self {
            templates,
            exceptions,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            step_index: Arc::new(RwLock::new(HashMap::new())),
            events: EventSink::disabled(),
        }
    }

    /// Enable the event stream and return its receiver
    pub fn with_event_reporting(mut self) -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (sink, receiver) = EventSink::channel();
        self.events = sink;
        (self, receiver)
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn exceptions(&self) -> &ExceptionManager {
        &self.exceptions
    }

    /// Materialize a workflow from an active template
    pub async fn initiate_workflow(
        &self,
        employee_id: &str,
        template: &TemplateRef,
        initiated_by: &str,
    ) -> Result<WorkflowView> {
        require_reference("employee id", employee_id)?;
        require_reference("initiator", initiated_by)?;

        let workflow_id = Uuid::new_v4();
        let template: WorkflowTemplate = self.templates.instantiate(template, workflow_id).await?;

        let state = materialize(
            workflow_id,
            employee_id,
            Some((template.id, template.version)),
            &template.name,
            template.workflow_type,
            &template.steps,
            initiated_by,
        );
        info!(
            "Initiated workflow {} from template '{}' v{} for employee {}",
            workflow_id, template.name, template.version, employee_id
        );
        Ok(self.insert(state).await)
    }

    /// Materialize a workflow from an inline step list
    pub async fn initiate_ad_hoc(
        &self,
        employee_id: &str,
        workflow_type: WorkflowType,
        name: &str,
        steps: &[StepDefinition],
        initiated_by: &str,
    ) -> Result<WorkflowView> {
        require_reference("employee id", employee_id)?;
        require_reference("initiator", initiated_by)?;
        validate_steps(steps)?;

        let workflow_id = Uuid::new_v4();
        let name = if name.trim().is_empty() {
            format!("ad hoc {}", workflow_type)
        } else {
            name.to_string()
        };
        let state = materialize(
            workflow_id,
            employee_id,
            None,
            &name,
            workflow_type,
            steps,
            initiated_by,
        );
        info!(
            "Initiated ad hoc {} workflow {} for employee {}",
            workflow_type, workflow_id, employee_id
        );
        Ok(self.insert(state).await)
    }

    async fn insert(&self, state: WorkflowState) -> WorkflowView {
        let view = state.view();
        let workflow_id = state.workflow.id;

        {
            let mut index = self.step_index.write().await;
            for step in &state.steps {
                index.insert(step.id, workflow_id);
            }
        }
        self.workflows
            .write()
            .await
            .insert(workflow_id, Arc::new(Mutex::new(state)));

        self.events.emit(WorkflowEvent::WorkflowInitiated {
            workflow_id,
            employee_id: view.workflow.employee_id.clone(),
            steps: view.steps.len(),
        });
        view
    }

    async fn slot(&self, workflow_id: WorkflowId) -> Result<Slot> {
        self.workflows
            .read()
            .await
            .get(&workflow_id)
            .cloned()
            .ok_or(WorkflowError::WorkflowNotFound(workflow_id))
    }

    async fn slot_for_step(&self, step_id: StepId) -> Result<Slot> {
        let workflow_id = self
            .step_index
            .read()
            .await
            .get(&step_id)
            .copied()
            .ok_or(WorkflowError::StepNotFound(step_id))?;
        self.slot(workflow_id).await
    }

    async fn all_slots(&self) -> Vec<Slot> {
        self.workflows.read().await.values().cloned().collect()
    }

    /// Workflow with its steps
    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowView> {
        let slot = self.slot(workflow_id).await?;
        let state = slot.lock().await;
        Ok(state.view())
    }

    pub async fn get_step(&self, step_id: StepId) -> Result<WorkflowStep> {
        let slot = self.slot_for_step(step_id).await?;
        let state = slot.lock().await;
        let idx = state.position(step_id)?;
        Ok(state.steps[idx].clone())
    }

    /// Workflows matching the filter, oldest first
    pub async fn list_workflows(&self, filter: &WorkflowFilter) -> Vec<EmployeeWorkflow> {
        self.list_views(filter)
            .await
            .into_iter()
            .map(|view| view.workflow)
            .collect()
    }

    /// Views of matching workflows, oldest first
    pub async fn list_views(&self, filter: &WorkflowFilter) -> Vec<WorkflowView> {
        let mut views = Vec::new();
        for slot in self.all_slots().await {
            let state = slot.lock().await;
            if filter.matches(&state.workflow) {
                views.push(state.view());
            }
        }
        views.sort_by(|a, b| {
            a.workflow
                .started_at
                .cmp(&b.workflow.started_at)
                .then(a.workflow.id.cmp(&b.workflow.id))
        });
        views
    }

    /// Dispatch records of a workflow, oldest first
    pub async fn list_integrations(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowIntegration>> {
        let slot = self.slot(workflow_id).await?;
        let state = slot.lock().await;
        Ok(state.integrations.clone())
    }

    /// Move a step to in-progress once its dependencies are satisfied
    pub async fn start_step(&self, step_id: StepId) -> Result<StepUpdate> {
        let slot = self.slot_for_step(step_id).await?;
        let mut state = slot.lock().await;
        state.ensure_not_cancelled()?;

        let idx = state.position(step_id)?;
        let current = state.steps[idx].status;
        if current == StepStatus::InProgress {
            debug!("Step {} already in progress", step_id);
            return Ok(state.update_for(idx, false, Vec::new()));
        }

        state.ensure_accepts_step_changes("start steps in")?;
        if current.is_terminal() {
            return Err(WorkflowError::invalid_status("step", step_id, current, "start"));
        }
        state.ensure_dependencies_satisfied(idx)?;

        let before = state.eligible_ids();
        let step = &mut state.steps[idx];
        step.status = StepStatus::InProgress;
        step.started_at = Some(Utc::now());
        info!("Started step '{}' ({}) of workflow {}", step.key, step_id, step.workflow_id);
        self.emit_transition(&state, idx, current);

        self.reevaluate(&mut state);
        let newly_eligible = state.newly_eligible(&before);
        self.settle(&mut state).await;
        Ok(state.update_for(idx, true, newly_eligible))
    }

    /// Complete an in-progress step, or a pending manual step
    pub async fn complete_step(&self, step_id: StepId, completed_by: &str) -> Result<StepUpdate> {
        require_reference("actor", completed_by)?;

        let slot = self.slot_for_step(step_id).await?;
        let mut state = slot.lock().await;
        state.ensure_not_cancelled()?;

        let idx = state.position(step_id)?;
        let current = state.steps[idx].status;
        if current == StepStatus::Completed {
            debug!("Step {} already completed", step_id);
            return Ok(state.update_for(idx, false, Vec::new()));
        }

        state.ensure_accepts_step_changes("complete steps in")?;
        match current {
            StepStatus::InProgress => {}
            StepStatus::Pending | StepStatus::Blocked
                if state.steps[idx].step_type == StepType::Manual =>
            {
                state.ensure_dependencies_satisfied(idx)?;
            }
            _ => {
                return Err(WorkflowError::invalid_status(
                    "step", step_id, current, "complete",
                ))
            }
        }

        let newly_eligible = self.finish_step(&mut state, idx, StepStatus::Completed, completed_by);
        self.settle(&mut state).await;
        Ok(state.update_for(idx, true, newly_eligible))
    }

    /// Skip a step; counts toward progress and dependency satisfaction
    pub async fn skip_step(&self, step_id: StepId, skipped_by: &str, reason: &str) -> Result<StepUpdate> {
        require_reference("actor", skipped_by)?;
        if reason.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "A reason is required to skip a step".to_string(),
            ));
        }

        let slot = self.slot_for_step(step_id).await?;
        let mut state = slot.lock().await;
        state.ensure_not_cancelled()?;

        let idx = state.position(step_id)?;
        let current = state.steps[idx].status;
        if current == StepStatus::Skipped {
            debug!("Step {} already skipped", step_id);
            return Ok(state.update_for(idx, false, Vec::new()));
        }

        state.ensure_accepts_step_changes("skip steps in")?;
        if current == StepStatus::Completed {
            return Err(WorkflowError::invalid_status("step", step_id, current, "skip"));
        }

        state.steps[idx].set_metadata("skip_reason", reason);
        let newly_eligible = self.finish_step(&mut state, idx, StepStatus::Skipped, skipped_by);
        self.settle(&mut state).await;
        Ok(state.update_for(idx, true, newly_eligible))
    }

    /// Assign a non-terminal step to a specific person
    pub async fn assign_step(&self, step_id: StepId, assignee: &str) -> Result<WorkflowStep> {
        require_reference("assignee", assignee)?;

        let slot = self.slot_for_step(step_id).await?;
        let mut state = slot.lock().await;
        state.ensure_not_cancelled()?;

        let idx = state.position(step_id)?;
        let step = &mut state.steps[idx];
        if step.status.is_terminal() {
            return Err(WorkflowError::invalid_status("step", step_id, step.status, "assign"));
        }

        step.assigned_to = Some(assignee.to_string());
        debug!("Assigned step '{}' to {}", step.key, assignee);
        Ok(step.clone())
    }

    /// Recompute progress and complete the workflow when every step is terminal
    pub async fn check_workflow_progress(&self, workflow_id: WorkflowId) -> Result<WorkflowProgress> {
        let slot = self.slot(workflow_id).await?;
        let mut state = slot.lock().await;
        self.settle(&mut state).await;
        Ok(state.progress_summary())
    }

    /// Move to the next stage once every step of the current stage is terminal
    pub async fn advance_stage(&self, workflow_id: WorkflowId) -> Result<StageAdvance> {
        let slot = self.slot(workflow_id).await?;
        let mut state = slot.lock().await;
        state.ensure_not_cancelled()?;

        let previous = state.workflow.current_stage.clone();
        let stages = state.stages();
        let position = stages.iter().position(|s| s == &previous).unwrap_or(0);
        let stage_done = state
            .steps
            .iter()
            .filter(|s| s.stage == previous)
            .all(|s| s.status.is_terminal());

        let next = stages.get(position + 1).filter(|_| stage_done).cloned();
        match next {
            Some(next) => {
                info!("Workflow {} advanced from stage '{}' to '{}'", workflow_id, previous, next);
                state.workflow.current_stage = next.clone();
                self.events.emit(WorkflowEvent::StageAdvanced {
                    workflow_id,
                    from: previous.clone(),
                    to: next.clone(),
                });
                Ok(StageAdvance {
                    previous_stage: previous,
                    current_stage: next,
                    advanced: true,
                })
            }
            None => Ok(StageAdvance {
                previous_stage: previous.clone(),
                current_stage: previous,
                advanced: false,
            }),
        }
    }

    /// Cancel a live workflow; step states are left as they are
    pub async fn cancel_workflow(&self, workflow_id: WorkflowId, cancelled_by: &str) -> Result<EmployeeWorkflow> {
        require_reference("actor", cancelled_by)?;

        let slot = self.slot(workflow_id).await?;
        let mut state = slot.lock().await;
        state.ensure_not_cancelled()?;
        if !state.workflow.status.is_live() {
            return Err(WorkflowError::invalid_status(
                "workflow",
                workflow_id,
                state.workflow.status,
                "cancel",
            ));
        }

        let from = state.workflow.status;
        state.workflow.status = WorkflowStatus::Cancelled;
        state.workflow.cancelled_at = Some(Utc::now());
        if let Some(template_id) = state.workflow.template_id {
            self.templates.release(template_id, workflow_id).await;
        }

        info!("Workflow {} cancelled by {}", workflow_id, cancelled_by);
        self.emit_status(workflow_id, from, WorkflowStatus::Cancelled);
        Ok(state.workflow.clone())
    }

    /// Pause an active workflow; step mutations are rejected until resumed
    pub async fn hold_workflow(&self, workflow_id: WorkflowId) -> Result<EmployeeWorkflow> {
        self.change_hold(workflow_id, WorkflowStatus::Active, WorkflowStatus::OnHold, "hold")
            .await
    }

    /// Resume an on-hold workflow
    pub async fn resume_workflow(&self, workflow_id: WorkflowId) -> Result<EmployeeWorkflow> {
        self.change_hold(workflow_id, WorkflowStatus::OnHold, WorkflowStatus::Active, "resume")
            .await
    }

    async fn change_hold(
        &self,
        workflow_id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
        operation: &'static str,
    ) -> Result<EmployeeWorkflow> {
        let slot = self.slot(workflow_id).await?;
        let mut state = slot.lock().await;
        state.ensure_not_cancelled()?;

        let current = state.workflow.status;
        if current == to {
            return Ok(state.workflow.clone());
        }
        if current != from {
            return Err(WorkflowError::invalid_status("workflow", workflow_id, current, operation));
        }

        state.workflow.status = to;
        info!("Workflow {} is now {}", workflow_id, to);
        self.emit_status(workflow_id, from, to);
        Ok(state.workflow.clone())
    }

    /// Open an exception against a workflow and optionally one of its steps
    pub async fn raise_exception(&self, new: NewException) -> Result<WorkflowException> {
        let slot = self.slot(new.workflow_id).await?;
        let state = slot.lock().await;
        state.ensure_not_cancelled()?;
        if let Some(step_id) = new.step_id {
            state.position(step_id)?;
        }

        let exception = self.exceptions.raise(new).await?;
        self.events.emit(WorkflowEvent::ExceptionRaised {
            workflow_id: exception.workflow_id,
            exception_id: exception.id,
            severity: exception.severity,
        });
        Ok(exception)
    }

    /// Resolve an exception; the affected step is left for a person to restart or skip
    pub async fn resolve_exception(
        &self,
        exception_id: ExceptionId,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<WorkflowException> {
        require_reference("resolver", resolved_by)?;
        let exception = self
            .exceptions
            .resolve(exception_id, resolved_by.to_string(), notes)
            .await?;
        self.events.emit(WorkflowEvent::ExceptionResolved {
            workflow_id: exception.workflow_id,
            exception_id,
        });
        Ok(exception)
    }

    /// Open an integration record for an in-progress integration step
    pub(crate) async fn begin_integration(
        &self,
        step_id: StepId,
        integration_type: IntegrationType,
        payload: Option<serde_json::Value>,
        max_retries: u32,
    ) -> Result<IntegrationTicket> {
        let slot = self.slot_for_step(step_id).await?;
        let mut state = slot.lock().await;
        state.ensure_not_cancelled()?;
        state.ensure_accepts_step_changes("dispatch integrations in")?;

        let idx = state.position(step_id)?;
        let step = &state.steps[idx];
        if step.step_type != StepType::Integration {
            return Err(WorkflowError::Validation(format!(
                "Step '{}' is a {} step and cannot be dispatched",
                step.key, step.step_type
            )));
        }
        if let Some(binding) = &step.integration {
            if binding.integration_type != integration_type {
                return Err(WorkflowError::Validation(format!(
                    "Step '{}' is bound to {}, not {}",
                    step.key, binding.integration_type, integration_type
                )));
            }
        }
        if step.status != StepStatus::InProgress {
            return Err(WorkflowError::invalid_status("step", step_id, step.status, "dispatch"));
        }
        if state
            .integrations
            .iter()
            .any(|i| i.step_id == step_id && i.status == IntegrationStatus::Pending)
        {
            return Err(WorkflowError::Conflict(format!(
                "Step '{}' already has a dispatch in flight",
                step.key
            )));
        }

        let payload = payload
            .or_else(|| step.integration.as_ref().map(|b| b.payload.clone()))
            .unwrap_or(serde_json::Value::Null);
        let record = WorkflowIntegration::new(
            state.workflow.id,
            step_id,
            integration_type,
            payload.clone(),
            max_retries,
        );
        let ticket = IntegrationTicket {
            workflow_id: record.workflow_id,
            step_id,
            integration_id: record.id,
            integration_type,
            payload,
            max_retries,
        };

        info!(
            "Dispatching {} for step '{}' of workflow {} (integration {})",
            integration_type, step.key, record.workflow_id, record.id
        );
        self.emit_integration(&record);
        state.integrations.push(record);
        Ok(ticket)
    }

    /// Whether the dispatch behind `ticket` may make another attempt
    ///
    /// False once the workflow is cancelled or gone, the record is closed, or
    /// the step left in-progress. In the last case the record is closed as
    /// failed so no further attempt can pick it up.
    pub(crate) async fn should_retry(&self, ticket: &IntegrationTicket) -> bool {
        let Ok(slot) = self.slot(ticket.workflow_id).await else {
            return false;
        };
        let mut state = slot.lock().await;
        if state.workflow.status == WorkflowStatus::Cancelled {
            return false;
        }

        let step_in_progress = state
            .steps
            .iter()
            .any(|s| s.id == ticket.step_id && s.status == StepStatus::InProgress);
        let Some(record) = state
            .integrations
            .iter_mut()
            .find(|i| i.id == ticket.integration_id && i.status == IntegrationStatus::Pending)
        else {
            return false;
        };
        if step_in_progress {
            return true;
        }

        record.status = IntegrationStatus::Failed;
        record.revision += 1;
        record.error_message = Some("Step left in-progress before the next attempt".to_string());
        let record = record.clone();
        info!(
            "Step {} left in-progress; abandoning {} dispatch {}",
            ticket.step_id, ticket.integration_type, ticket.integration_id
        );
        self.emit_integration(&record);
        false
    }

    /// Record the result of one provider attempt and apply its step transition
    pub(crate) async fn apply_attempt(
        &self,
        ticket: &IntegrationTicket,
        outcome: AttemptOutcome,
    ) -> Result<AttemptDisposition> {
        let slot = self.slot(ticket.workflow_id).await?;
        let mut state = slot.lock().await;

        if state.workflow.status == WorkflowStatus::Cancelled {
            debug!(
                "Dropping {} result for cancelled workflow {}",
                ticket.integration_type, ticket.workflow_id
            );
            return Ok(AttemptDisposition::Dropped);
        }

        let Some(record_idx) = state
            .integrations
            .iter()
            .position(|i| i.id == ticket.integration_id && i.status == IntegrationStatus::Pending)
        else {
            warn!("Integration {} is no longer pending", ticket.integration_id);
            return Ok(AttemptDisposition::Dropped);
        };

        let step_idx = state.position(ticket.step_id)?;
        let step_in_progress = state.steps[step_idx].status == StepStatus::InProgress;
        let error_message = outcome.error_message();

        let record = &mut state.integrations[record_idx];
        record.revision += 1;
        record.last_attempt_at = Some(Utc::now());

        match outcome {
            AttemptOutcome::Succeeded(response) => {
                record.status = IntegrationStatus::Succeeded;
                record.external_id = response.external_id;
                record.response_payload = Some(response.payload);
                record.error_message = None;
                let record = record.clone();
                self.emit_integration(&record);

                if !step_in_progress {
                    warn!(
                        "Step {} left in-progress before {} succeeded; result recorded only",
                        ticket.step_id, ticket.integration_type
                    );
                    return Ok(AttemptDisposition::Dropped);
                }

                info!(
                    "{} succeeded for step {} (external id {:?})",
                    ticket.integration_type, ticket.step_id, record.external_id
                );
                let newly_eligible =
                    self.finish_step(&mut state, step_idx, StepStatus::Completed, DISPATCHER_ACTOR);
                self.settle(&mut state).await;
                Ok(AttemptDisposition::Succeeded { newly_eligible })
            }
            AttemptOutcome::Failed(_) | AttemptOutcome::TimedOut(_) => {
                let message = error_message.unwrap_or_default();
                record.retry_count += 1;
                record.error_message = Some(message.clone());
                let exhausted = record.retry_count >= record.max_retries;
                if exhausted || !step_in_progress {
                    record.status = IntegrationStatus::Failed;
                }
                let record = record.clone();
                self.emit_integration(&record);

                if !step_in_progress {
                    warn!(
                        "Step {} left in-progress during {} retries; stopping",
                        ticket.step_id, ticket.integration_type
                    );
                    return Ok(AttemptDisposition::Dropped);
                }

                if !exhausted {
                    warn!(
                        "{} attempt {}/{} failed for step {}: {}",
                        ticket.integration_type,
                        record.retry_count,
                        record.max_retries,
                        ticket.step_id,
                        message
                    );
                    return Ok(AttemptDisposition::Retry {
                        failures: record.retry_count,
                    });
                }

                let blocked = self.fail_step(&mut state, step_idx, &message);
                let step = &state.steps[step_idx];
                let blocked_list = if blocked.is_empty() {
                    "none".to_string()
                } else {
                    blocked.join(", ")
                };
                let new = NewException {
                    workflow_id: ticket.workflow_id,
                    step_id: Some(ticket.step_id),
                    exception_type: ExceptionType::IntegrationFailure,
                    severity: Severity::High,
                    title: format!("{} failed for step '{}'", ticket.integration_type, step.name),
                    description: format!(
                        "{} attempts failed; last error: {}. Blocked steps: {}",
                        record.retry_count, message, blocked_list
                    ),
                    raised_by: DISPATCHER_ACTOR.to_string(),
                    assigned_to: step.assigned_to.clone(),
                };

                let exception = self.exceptions.raise(new).await?;
                self.events.emit(WorkflowEvent::ExceptionRaised {
                    workflow_id: ticket.workflow_id,
                    exception_id: exception.id,
                    severity: exception.severity,
                });
                Ok(AttemptDisposition::Exhausted {
                    exception_id: exception.id,
                })
            }
        }
    }

    /// Full state of every workflow, oldest first
    pub(crate) async fn export_states(&self) -> Vec<WorkflowState> {
        let mut states = Vec::new();
        for slot in self.all_slots().await {
            states.push(slot.lock().await.clone());
        }
        states.sort_by(|a, b| a.workflow.started_at.cmp(&b.workflow.started_at));
        states
    }

    /// Replace all engine state with a snapshot
    ///
    /// Dispatches that were in flight when the snapshot was taken cannot be
    /// resumed; their records are closed as failed and the step stays
    /// in-progress for a new dispatch.
    pub(crate) async fn restore(
        &self,
        templates: Vec<WorkflowTemplate>,
        states: Vec<WorkflowState>,
        exceptions: Vec<WorkflowException>,
    ) {
        let mut live: Vec<(TemplateId, WorkflowId)> = Vec::new();
        let mut workflows = HashMap::new();
        let mut index = HashMap::new();

        for mut state in states {
            for record in &mut state.integrations {
                if record.status == IntegrationStatus::Pending {
                    record.status = IntegrationStatus::Failed;
                    record.error_message = Some("Interrupted before completion".to_string());
                    record.revision += 1;
                }
            }
            if let (Some(template_id), true) =
                (state.workflow.template_id, state.workflow.status.is_live())
            {
                live.push((template_id, state.workflow.id));
            }
            for step in &state.steps {
                index.insert(step.id, state.workflow.id);
            }
            workflows.insert(state.workflow.id, Arc::new(Mutex::new(state)));
        }

        info!("Restored {} workflows", workflows.len());
        self.templates.restore(templates, live).await;
        self.exceptions.restore(exceptions).await;
        *self.step_index.write().await = index;
        *self.workflows.write().await = workflows;
    }

    /// Mark a step terminal and re-evaluate its dependents
    fn finish_step(
        &self,
        state: &mut WorkflowState,
        idx: usize,
        status: StepStatus,
        actor: &str,
    ) -> Vec<StepId> {
        let before = state.eligible_ids();
        let step = &mut state.steps[idx];
        let from = step.status;
        step.status = status;
        step.completed_at = Some(Utc::now());
        step.completed_by = Some(actor.to_string());
        info!(
            "Step '{}' ({}) of workflow {} is {} by {}",
            step.key, step.id, step.workflow_id, status, actor
        );
        self.emit_transition(state, idx, from);

        self.reevaluate(state);
        state.newly_eligible(&before)
    }

    /// Fail a step and return the keys of steps that became blocked
    fn fail_step(&self, state: &mut WorkflowState, idx: usize, reason: &str) -> Vec<String> {
        let step = &mut state.steps[idx];
        let from = step.status;
        step.status = StepStatus::Failed;
        step.set_metadata("failure_reason", reason);
        warn!("Step '{}' ({}) failed: {}", step.key, step.id, reason);
        self.emit_transition(state, idx, from);

        self.reevaluate(state)
            .into_iter()
            .filter(|(_, _, to)| *to == StepStatus::Blocked)
            .map(|(idx, _, _)| state.steps[idx].key.clone())
            .collect()
    }

    /// Recompute blocked flags and publish the resulting transitions
    fn reevaluate(&self, state: &mut WorkflowState) -> Vec<(usize, StepStatus, StepStatus)> {
        let changes = state.recompute_blocking();
        for (idx, from, _) in &changes {
            self.emit_transition(state, *idx, *from);
        }
        changes
    }

    /// Refresh progress and flip a live workflow to completed once every step is terminal
    async fn settle(&self, state: &mut WorkflowState) {
        state.refresh_progress();
        if !state.workflow.status.is_live() || !state.all_terminal() {
            return;
        }

        let from = state.workflow.status;
        state.workflow.status = WorkflowStatus::Completed;
        state.workflow.actual_completion = Some(Utc::now());
        if let Some(template_id) = state.workflow.template_id {
            self.templates.release(template_id, state.workflow.id).await;
        }
        info!("Workflow {} completed", state.workflow.id);
        self.emit_status(state.workflow.id, from, WorkflowStatus::Completed);
    }

    fn emit_transition(&self, state: &WorkflowState, idx: usize, from: StepStatus) {
        let step = &state.steps[idx];
        self.events.emit(WorkflowEvent::StepTransitioned {
            workflow_id: step.workflow_id,
            step_id: step.id,
            from,
            to: step.status,
        });
    }

    fn emit_status(&self, workflow_id: WorkflowId, from: WorkflowStatus, to: WorkflowStatus) {
        self.events
            .emit(WorkflowEvent::WorkflowStatusChanged { workflow_id, from, to });
    }

    fn emit_integration(&self, record: &WorkflowIntegration) {
        self.events.emit(WorkflowEvent::IntegrationUpdated {
            workflow_id: record.workflow_id,
            integration_id: record.id,
            integration_type: record.integration_type,
            status: record.status,
            retry_count: record.retry_count,
        });
    }
}

fn require_reference(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(WorkflowError::Validation(format!("{} cannot be empty", what)));
    }
    Ok(())
}

/// Copy step definitions into a fresh instance, remapping keys to step ids
fn materialize(
    workflow_id: WorkflowId,
    employee_id: &str,
    template: Option<(TemplateId, u32)>,
    name: &str,
    workflow_type: WorkflowType,
    definitions: &[StepDefinition],
    initiated_by: &str,
) -> WorkflowState {
    let now = Utc::now();
    let ids: HashMap<&str, StepId> = definitions
        .iter()
        .map(|d| (d.key.as_str(), Uuid::new_v4()))
        .collect();

    let mut ordered: Vec<&StepDefinition> = definitions.iter().collect();
    ordered.sort_by_key(|d| d.order);

    let steps: Vec<WorkflowStep> = ordered
        .iter()
        .map(|definition| WorkflowStep {
            id: ids[definition.key.as_str()],
            workflow_id,
            key: definition.key.clone(),
            order: definition.order,
            name: definition.name.clone(),
            description: definition.description.clone(),
            step_type: definition.step_type,
            stage: definition.stage.clone(),
            required: definition.required,
            auto_trigger: definition.auto_trigger,
            status: StepStatus::Pending,
            dependencies: definition
                .dependencies
                .iter()
                .filter_map(|key| ids.get(key.as_str()).copied())
                .collect(),
            assigned_role: definition.assigned_role,
            assigned_to: None,
            due_date: now + ChronoDuration::days(i64::from(definition.due_days)),
            started_at: None,
            completed_at: None,
            completed_by: None,
            integration: definition.integration.clone(),
            metadata: serde_json::Map::new(),
        })
        .collect();

    let expected_completion = steps.iter().map(|s| s.due_date).max().unwrap_or(now);
    let current_stage = steps
        .first()
        .map(|s| s.stage.clone())
        .unwrap_or_default();

    WorkflowState {
        workflow: EmployeeWorkflow {
            id: workflow_id,
            employee_id: employee_id.to_string(),
            template_id: template.map(|(id, _)| id),
            template_version: template.map(|(_, version)| version),
            name: name.to_string(),
            workflow_type,
            status: WorkflowStatus::Active,
            current_stage,
            progress: 0,
            initiated_by: initiated_by.to_string(),
            started_at: now,
            expected_completion,
            actual_completion: None,
            cancelled_at: None,
        },
        steps,
        integrations: Vec::new(),
    }
}

impl WorkflowState {
    fn view(&self) -> WorkflowView {
        WorkflowView {
            workflow: self.workflow.clone(),
            steps: self.steps.clone(),
        }
    }

    fn position(&self, step_id: StepId) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or(WorkflowError::StepNotFound(step_id))
    }

    fn status_of(&self, step_id: &StepId) -> Option<StepStatus> {
        self.steps.iter().find(|s| &s.id == step_id).map(|s| s.status)
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.workflow.status == WorkflowStatus::Cancelled {
            return Err(WorkflowError::WorkflowCancelled(self.workflow.id));
        }
        Ok(())
    }

    fn ensure_accepts_step_changes(&self, operation: &'static str) -> Result<()> {
        match self.workflow.status {
            WorkflowStatus::Active => Ok(()),
            WorkflowStatus::Cancelled => Err(WorkflowError::WorkflowCancelled(self.workflow.id)),
            status => Err(WorkflowError::invalid_status(
                "workflow",
                self.workflow.id,
                status,
                operation,
            )),
        }
    }

    /// Keys of dependencies that are not completed or skipped
    fn unsatisfied_dependencies(&self, idx: usize) -> Vec<String> {
        self.steps[idx]
            .dependencies
            .iter()
            .filter(|dep| !self.status_of(dep).is_some_and(|s| s.is_terminal()))
            .map(|dep| {
                self.steps
                    .iter()
                    .find(|s| &s.id == dep)
                    .map_or_else(|| dep.to_string(), |s| s.key.clone())
            })
            .collect()
    }

    fn ensure_dependencies_satisfied(&self, idx: usize) -> Result<()> {
        let pending = self.unsatisfied_dependencies(idx);
        if pending.is_empty() {
            return Ok(());
        }
        Err(WorkflowError::DependencyNotSatisfied {
            step: self.steps[idx].key.clone(),
            pending,
        })
    }

    fn eligible_ids(&self) -> BTreeSet<StepId> {
        (0..self.steps.len())
            .filter(|&idx| {
                self.steps[idx].status == StepStatus::Pending
                    && self.unsatisfied_dependencies(idx).is_empty()
            })
            .map(|idx| self.steps[idx].id)
            .collect()
    }

    /// Eligible steps that were not eligible before, in step order
    fn newly_eligible(&self, before: &BTreeSet<StepId>) -> Vec<StepId> {
        let after = self.eligible_ids();
        self.steps
            .iter()
            .filter(|s| after.contains(&s.id) && !before.contains(&s.id))
            .map(|s| s.id)
            .collect()
    }

    /// Mark open steps blocked iff a dependency failed or is itself blocked
    ///
    /// Runs to a fixpoint so blocking propagates transitively, and clears the
    /// flag once the failing dependency is restarted, completed or skipped.
    fn recompute_blocking(&mut self) -> Vec<(usize, StepStatus, StepStatus)> {
        let mut changes = Vec::new();
        loop {
            let mut changed = false;
            for idx in 0..self.steps.len() {
                let current = self.steps[idx].status;
                if !matches!(current, StepStatus::Pending | StepStatus::Blocked) {
                    continue;
                }
                let blocked = self.steps[idx].dependencies.iter().any(|dep| {
                    matches!(
                        self.status_of(dep),
                        Some(StepStatus::Failed) | Some(StepStatus::Blocked)
                    )
                });
                let next = if blocked {
                    StepStatus::Blocked
                } else {
                    StepStatus::Pending
                };
                if next != current {
                    self.steps[idx].status = next;
                    changes.push((idx, current, next));
                    changed = true;
                }
            }
            if !changed {
                return changes;
            }
        }
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    fn all_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    fn refresh_progress(&mut self) {
        let total = self.steps.len();
        let done = self.steps.iter().filter(|s| s.status.is_terminal()).count();
        self.workflow.progress = percent(done, total);
    }

    /// Distinct stage labels in step order
    fn stages(&self) -> Vec<String> {
        let mut stages: Vec<String> = Vec::new();
        for step in &self.steps {
            if !stages.contains(&step.stage) {
                stages.push(step.stage.clone());
            }
        }
        stages
    }

    fn progress_summary(&self) -> WorkflowProgress {
        WorkflowProgress {
            workflow_id: self.workflow.id,
            status: self.workflow.status,
            current_stage: self.workflow.current_stage.clone(),
            progress: self.workflow.progress,
            total_steps: self.steps.len(),
            completed: self.count(StepStatus::Completed),
            skipped: self.count(StepStatus::Skipped),
            in_progress: self.count(StepStatus::InProgress),
            pending: self.count(StepStatus::Pending),
            failed: self.count(StepStatus::Failed),
            blocked: self.count(StepStatus::Blocked),
        }
    }

    fn update_for(&self, idx: usize, changed: bool, newly_eligible: Vec<StepId>) -> StepUpdate {
        StepUpdate {
            step: self.steps[idx].clone(),
            changed,
            newly_eligible,
            progress: self.workflow.progress,
            workflow_status: self.workflow.status,
        }
    }
}

/// `round(100 * done / total)` in integer arithmetic, half rounding up
pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((200 * done + total) / (2 * total)).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::exception::ExceptionFilter;
    use crate::integration::ProviderResponse;
    use crate::template::{AssigneeRole, TemplateDraft};

    fn onboarding_steps() -> Vec<StepDefinition> {
        vec![
            StepDefinition::new("send-offer", 1, "Send offer", StepType::Manual, AssigneeRole::Hr)
                .in_stage("pre-boarding"),
            StepDefinition::new("sign-offer", 2, "Sign offer", StepType::Integration, AssigneeRole::Employee)
                .in_stage("pre-boarding")
                .depends_on("send-offer")
                .with_integration(IntegrationType::Docusign, serde_json::json!({"envelope": "offer"})),
            StepDefinition::new("background-check", 3, "Background check", StepType::Integration, AssigneeRole::Hr)
                .in_stage("day-1")
                .due_in_days(5)
                .depends_on("sign-offer"),
        ]
    }

    async fn engine_with_template() -> InstanceEngine {
        let templates = Arc::new(TemplateStore::new());
        templates
            .create(TemplateDraft::new(
                "standard-onboarding",
                WorkflowType::Onboarding,
                onboarding_steps(),
            ))
            .await
            .unwrap();
        InstanceEngine::new(templates, ExceptionManager::new())
    }

    async fn initiate(engine: &InstanceEngine) -> WorkflowView {
        engine
            .initiate_workflow("emp-42", &TemplateRef::from("standard-onboarding"), "hr-1")
            .await
            .unwrap()
    }

    #[test]
    fn test_percent_rounding() {
        assert_eq!(percent(0, 3), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(1, 8), 13);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(0, 0), 0);
    }

    #[tokio::test]
    async fn test_initiate_remaps_dependencies() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;

        assert_eq!(view.steps.len(), 3);
        assert_eq!(view.workflow.status, WorkflowStatus::Active);
        assert_eq!(view.workflow.current_stage, "pre-boarding");
        assert_eq!(view.workflow.progress, 0);
        assert_eq!(view.workflow.template_version, Some(1));

        let send = view.step("send-offer").unwrap();
        let sign = view.step("sign-offer").unwrap();
        assert!(sign.dependencies.contains(&send.id));
        assert!(view.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(view.eligible_steps().len(), 1);
        assert_eq!(
            view.workflow.expected_completion,
            view.step("background-check").unwrap().due_date
        );
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let engine = engine_with_template().await;
        let err = engine
            .initiate_workflow("emp-1", &TemplateRef::from("missing"), "hr-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateNotFound);
    }

    #[tokio::test]
    async fn test_start_requires_dependencies() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let sign = view.step("sign-offer").unwrap().id;

        let err = engine.start_step(sign).await.unwrap_err();
        assert_eq!(
            err,
            WorkflowError::DependencyNotSatisfied {
                step: "sign-offer".to_string(),
                pending: vec!["send-offer".to_string()],
            }
        );
        assert_eq!(engine.get_step(sign).await.unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;

        let first = engine.start_step(send).await.unwrap();
        let second = engine.start_step(send).await.unwrap();
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(second.step.status, StepStatus::InProgress);
        assert_eq!(first.step.started_at, second.step.started_at);
    }

    #[tokio::test]
    async fn test_complete_unlocks_dependents() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;
        let sign = view.step("sign-offer").unwrap().id;

        engine.start_step(send).await.unwrap();
        let update = engine.complete_step(send, "hr-1").await.unwrap();
        assert_eq!(update.newly_eligible, vec![sign]);
        assert_eq!(update.progress, 33);
        assert_eq!(update.step.completed_by.as_deref(), Some("hr-1"));

        let again = engine.complete_step(send, "hr-2").await.unwrap();
        assert!(!again.changed);
        assert_eq!(again.progress, 33);
        assert_eq!(again.step.completed_by.as_deref(), Some("hr-1"));
    }

    #[tokio::test]
    async fn test_complete_pending_manual_step() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;
        let sign = view.step("sign-offer").unwrap().id;

        engine.complete_step(send, "hr-1").await.unwrap();
        let err = engine.complete_step(sign, "hr-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatus);
    }

    #[tokio::test]
    async fn test_skip_requires_reason_and_satisfies_dependents() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;
        let sign = view.step("sign-offer").unwrap().id;

        let err = engine.skip_step(send, "hr-1", "  ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let update = engine.skip_step(send, "hr-1", "Offer sent on paper").await.unwrap();
        assert_eq!(update.step.status, StepStatus::Skipped);
        assert_eq!(update.step.metadata["skip_reason"], "Offer sent on paper");
        assert_eq!(update.newly_eligible, vec![sign]);
        engine.start_step(sign).await.unwrap();
    }

    #[tokio::test]
    async fn test_all_terminal_completes_workflow() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let template_id = view.workflow.template_id.unwrap();
        assert_eq!(engine.templates().live_instance_count(template_id).await, 1);

        for step in &view.steps {
            engine.skip_step(step.id, "hr-1", "Rehire").await.unwrap();
        }

        let progress = engine.check_workflow_progress(view.workflow.id).await.unwrap();
        assert_eq!(progress.progress, 100);
        assert_eq!(progress.status, WorkflowStatus::Completed);
        let workflow = engine.get_workflow(view.workflow.id).await.unwrap().workflow;
        assert!(workflow.actual_completion.is_some());
        assert_eq!(engine.templates().live_instance_count(template_id).await, 0);
    }

    #[tokio::test]
    async fn test_advance_stage() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let workflow_id = view.workflow.id;

        let unchanged = engine.advance_stage(workflow_id).await.unwrap();
        assert!(!unchanged.advanced);
        assert_eq!(unchanged.current_stage, "pre-boarding");

        engine.skip_step(view.step("send-offer").unwrap().id, "hr-1", "n/a").await.unwrap();
        engine.skip_step(view.step("sign-offer").unwrap().id, "hr-1", "n/a").await.unwrap();

        let advanced = engine.advance_stage(workflow_id).await.unwrap();
        assert!(advanced.advanced);
        assert_eq!(advanced.current_stage, "day-1");

        let last = engine.advance_stage(workflow_id).await.unwrap();
        assert!(!last.advanced);
        assert_eq!(last.current_stage, "day-1");
    }

    #[tokio::test]
    async fn test_cancel_blocks_further_mutation() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;

        let cancelled = engine.cancel_workflow(view.workflow.id, "hr-1").await.unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);

        assert_eq!(
            engine.start_step(send).await.unwrap_err(),
            WorkflowError::WorkflowCancelled(view.workflow.id)
        );
        assert_eq!(
            engine.cancel_workflow(view.workflow.id, "hr-1").await.unwrap_err().kind(),
            ErrorKind::WorkflowCancelled
        );
        assert_eq!(engine.get_step(send).await.unwrap().status, StepStatus::Pending);

        let err = engine
            .raise_exception(NewException::manual(view.workflow.id, Severity::Low, "Late paperwork", "hr-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkflowCancelled);
        assert!(engine
            .exceptions()
            .list(&ExceptionFilter::default().for_workflow(view.workflow.id))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_hold_rejects_step_changes() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;

        engine.hold_workflow(view.workflow.id).await.unwrap();
        let err = engine.start_step(send).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatus);

        engine.resume_workflow(view.workflow.id).await.unwrap();
        engine.start_step(send).await.unwrap();
    }

    #[tokio::test]
    async fn test_assign_step() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;

        let step = engine.assign_step(send, "recruiter-7").await.unwrap();
        assert_eq!(step.assigned_to.as_deref(), Some("recruiter-7"));

        engine.complete_step(send, "recruiter-7").await.unwrap();
        let err = engine.assign_step(send, "hr-2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStatus);
    }

    #[tokio::test]
    async fn test_exhausted_integration_blocks_dependents() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;
        let sign = view.step("sign-offer").unwrap().id;
        let check = view.step("background-check").unwrap().id;

        engine.complete_step(send, "hr-1").await.unwrap();
        engine.start_step(sign).await.unwrap();
        let ticket = engine
            .begin_integration(sign, IntegrationType::Docusign, None, 2)
            .await
            .unwrap();
        assert_eq!(ticket.payload["envelope"], "offer");

        let first = engine
            .apply_attempt(&ticket, AttemptOutcome::Failed("timeout".to_string()))
            .await
            .unwrap();
        assert_eq!(first, AttemptDisposition::Retry { failures: 1 });

        let second = engine
            .apply_attempt(&ticket, AttemptOutcome::Failed("timeout".to_string()))
            .await
            .unwrap();
        let AttemptDisposition::Exhausted { exception_id } = second else {
            panic!("expected exhaustion, got {:?}", second);
        };

        assert_eq!(engine.get_step(sign).await.unwrap().status, StepStatus::Failed);
        assert_eq!(engine.get_step(check).await.unwrap().status, StepStatus::Blocked);
        let exception = engine.exceptions().get(exception_id).await.unwrap();
        assert_eq!(exception.severity, Severity::High);
        assert!(exception.description.contains("background-check"));

        // Restarting the failed step clears the block on its dependents
        engine.start_step(sign).await.unwrap();
        assert_eq!(engine.get_step(check).await.unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_exhausted_optional_step_raises_high_severity() {
        let engine = InstanceEngine::new(Arc::new(TemplateStore::new()), ExceptionManager::new());
        let steps = vec![
            StepDefinition::new("find-records", 1, "Find prior records", StepType::Integration, AssigneeRole::Hr)
                .optional()
                .with_integration(IntegrationType::DocSearch, serde_json::json!({})),
        ];
        let view = engine
            .initiate_ad_hoc("emp-4", WorkflowType::Onboarding, "Records", &steps, "hr-1")
            .await
            .unwrap();
        let find = view.step("find-records").unwrap().id;
        engine.start_step(find).await.unwrap();
        let ticket = engine
            .begin_integration(find, IntegrationType::DocSearch, None, 1)
            .await
            .unwrap();

        let disposition = engine
            .apply_attempt(&ticket, AttemptOutcome::Failed("index offline".to_string()))
            .await
            .unwrap();
        let AttemptDisposition::Exhausted { exception_id } = disposition else {
            panic!("expected exhaustion, got {:?}", disposition);
        };

        let exception = engine.exceptions().get(exception_id).await.unwrap();
        assert_eq!(exception.severity, Severity::High);
        assert_eq!(exception.exception_type, ExceptionType::IntegrationFailure);
    }

    #[tokio::test]
    async fn test_retry_stops_once_step_is_closed() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;
        let sign = view.step("sign-offer").unwrap().id;

        engine.complete_step(send, "hr-1").await.unwrap();
        engine.start_step(sign).await.unwrap();
        let ticket = engine
            .begin_integration(sign, IntegrationType::Docusign, None, 3)
            .await
            .unwrap();
        engine
            .apply_attempt(&ticket, AttemptOutcome::Failed("busy".to_string()))
            .await
            .unwrap();
        assert!(engine.should_retry(&ticket).await);

        engine.skip_step(sign, "hr-1", "Signed on paper").await.unwrap();
        assert!(!engine.should_retry(&ticket).await);

        let records = engine.list_integrations(view.workflow.id).await.unwrap();
        assert_eq!(records[0].status, IntegrationStatus::Failed);
        assert_eq!(records[0].revision, 3);
        assert!(records[0].revision <= records[0].max_retries + 1);
        assert_eq!(engine.get_step(sign).await.unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_successful_attempt_completes_step() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;
        let sign = view.step("sign-offer").unwrap().id;
        let check = view.step("background-check").unwrap().id;

        engine.complete_step(send, "hr-1").await.unwrap();
        engine.start_step(sign).await.unwrap();
        let ticket = engine
            .begin_integration(sign, IntegrationType::Docusign, None, 3)
            .await
            .unwrap();

        let err = engine
            .begin_integration(sign, IntegrationType::Docusign, None, 3)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let disposition = engine
            .apply_attempt(
                &ticket,
                AttemptOutcome::Succeeded(ProviderResponse {
                    external_id: Some("env-1".to_string()),
                    payload: serde_json::json!({"status": "sent"}),
                }),
            )
            .await
            .unwrap();
        assert_eq!(
            disposition,
            AttemptDisposition::Succeeded {
                newly_eligible: vec![check]
            }
        );

        let step = engine.get_step(sign).await.unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.completed_by.as_deref(), Some(DISPATCHER_ACTOR));
        let records = engine.list_integrations(view.workflow.id).await.unwrap();
        assert_eq!(records[0].status, IntegrationStatus::Succeeded);
        assert_eq!(records[0].external_id.as_deref(), Some("env-1"));
        assert_eq!(records[0].revision, 2);
    }

    #[tokio::test]
    async fn test_results_after_cancel_are_dropped() {
        let engine = engine_with_template().await;
        let view = initiate(&engine).await;
        let send = view.step("send-offer").unwrap().id;
        let sign = view.step("sign-offer").unwrap().id;

        engine.complete_step(send, "hr-1").await.unwrap();
        engine.start_step(sign).await.unwrap();
        let ticket = engine
            .begin_integration(sign, IntegrationType::Docusign, None, 3)
            .await
            .unwrap();
        engine.cancel_workflow(view.workflow.id, "hr-1").await.unwrap();

        let disposition = engine
            .apply_attempt(&ticket, AttemptOutcome::Succeeded(ProviderResponse::default()))
            .await
            .unwrap();
        assert_eq!(disposition, AttemptDisposition::Dropped);
        assert_eq!(engine.get_step(sign).await.unwrap().status, StepStatus::InProgress);
        assert!(!engine.should_retry(&ticket).await);
    }

    #[tokio::test]
    async fn test_ad_hoc_workflow() {
        let engine = InstanceEngine::new(Arc::new(TemplateStore::new()), ExceptionManager::new());
        let steps = vec![
            StepDefinition::new("return-laptop", 1, "Return laptop", StepType::Manual, AssigneeRole::It),
            StepDefinition::new("exit-interview", 2, "Exit interview", StepType::Approval, AssigneeRole::Manager)
                .depends_on("return-laptop"),
        ];
        let view = engine
            .initiate_ad_hoc("emp-9", WorkflowType::Offboarding, "", &steps, "hr-1")
            .await
            .unwrap();
        assert!(view.workflow.template_id.is_none());
        assert_eq!(view.workflow.name, "ad hoc offboarding");

        let filter = WorkflowFilter {
            employee_id: Some("emp-9".to_string()),
            ..WorkflowFilter::default()
        };
        assert_eq!(engine.list_workflows(&filter).await.len(), 1);
    }

    #[tokio::test]
    async fn test_event_stream_reports_transitions() {
        let templates = Arc::new(TemplateStore::new());
        templates
            .create(TemplateDraft::new(
                "standard-onboarding",
                WorkflowType::Onboarding,
                onboarding_steps(),
            ))
            .await
            .unwrap();
        let (engine, mut events) =
            InstanceEngine::new(templates, ExceptionManager::new()).with_event_reporting();
        let view = initiate(&engine).await;
        engine
            .start_step(view.step("send-offer").unwrap().id)
            .await
            .unwrap();

        assert!(matches!(
            events.recv().await,
            Some(WorkflowEvent::WorkflowInitiated { steps: 3, .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(WorkflowEvent::StepTransitioned {
                from: StepStatus::Pending,
                to: StepStatus::InProgress,
                ..
            })
        ));
    }
}
