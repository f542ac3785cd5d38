// Workflow service
//
// Operation surface of the engine. Wires the template store, the instance
// engine, the integration dispatcher and the progress reporter together and
// adds the behaviour that spans components: auto-triggered steps are started
// as soon as they become eligible, and integration-bound steps are dispatched
// in background tasks once they are in progress.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::exception::{ExceptionFilter, ExceptionId, ExceptionManager, NewException, WorkflowException};
use crate::integration::{
    DispatchReport, DispatchStatus, IntegrationDispatcher, IntegrationType, ProviderRegistry,
    RetryPolicies, WorkflowIntegration,
};
use crate::persistence::{EngineSnapshot, StateStore};
use crate::progress::{Dashboard, ExceptionBacklog, ProgressReporter, WorkflowBreakdown};
use crate::template::{
    DiscoveryReport, StepDefinition, StepType, TemplateDiscovery, TemplateDraft, TemplateId,
    TemplateRef, TemplateStatus, TemplateStore, WorkflowTemplate, WorkflowType,
};
use crate::workflow::{
    EmployeeWorkflow, InstanceEngine, StageAdvance, StepId, StepStatus, StepUpdate,
    WorkflowEvent, WorkflowFilter, WorkflowId, WorkflowProgress, WorkflowStep, WorkflowView,
};

type Background = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Entry point for every engine operation
#[derive(Clone)]
pub struct WorkflowService {
    templates: Arc<TemplateStore>,
    engine: InstanceEngine,
    dispatcher: IntegrationDispatcher,
    reporter: ProgressReporter,
    /// Dispatch tasks that may still be running
    background: Background,
}

impl WorkflowService {
    /// Create a service with the given providers and retry policies
    pub fn new(providers: ProviderRegistry, policies: RetryPolicies) -> Self {
        let templates = Arc::new(TemplateStore::new());
        let engine = InstanceEngine::new(templates.clone(), ExceptionManager::new());
        Self::assemble(templates, engine, providers, policies)
    }

    /// Create a service that publishes every state change
    pub fn with_event_reporting(
        providers: ProviderRegistry,
        policies: RetryPolicies,
    ) -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let templates = Arc::new(TemplateStore::new());
        let (engine, receiver) =
            InstanceEngine::new(templates.clone(), ExceptionManager::new()).with_event_reporting();
        (Self::assemble(templates, engine, providers, policies), receiver)
    }

    fn assemble(
        templates: Arc<TemplateStore>,
        engine: InstanceEngine,
        providers: ProviderRegistry,
        policies: RetryPolicies,
    ) -> Self {
        Self {
            dispatcher: IntegrationDispatcher::new(engine.clone(), providers, policies),
            reporter: ProgressReporter::new(engine.clone()),
            templates,
            engine,
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn engine(&self) -> &InstanceEngine {
        &self.engine
    }

    pub fn dispatcher(&self) -> &IntegrationDispatcher {
        &self.dispatcher
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    // Templates

    pub async fn create_template(&self, draft: TemplateDraft) -> Result<WorkflowTemplate> {
        self.templates.create(draft).await
    }

    pub async fn get_template(&self, reference: &TemplateRef) -> Result<WorkflowTemplate> {
        self.templates.get(reference).await
    }

    pub async fn list_templates(&self) -> Vec<WorkflowTemplate> {
        self.templates.list().await
    }

    pub async fn update_template(&self, id: TemplateId, steps: Vec<StepDefinition>) -> Result<WorkflowTemplate> {
        self.templates.update(id, steps).await
    }

    pub async fn set_template_status(&self, id: TemplateId, status: TemplateStatus) -> Result<WorkflowTemplate> {
        self.templates.set_status(id, status).await
    }

    pub async fn delete_template(&self, id: TemplateId) -> Result<()> {
        self.templates.delete(id).await
    }

    /// Load every template definition found under a directory
    pub async fn load_templates<P: AsRef<Path>>(&self, templates_dir: P) -> anyhow::Result<DiscoveryReport> {
        TemplateDiscovery::new(templates_dir)?
            .load_into(&self.templates)
            .await
    }

    // Instances

    /// Create a workflow from a template and start its auto-triggered steps
    pub async fn initiate_workflow(
        &self,
        employee_id: &str,
        template: &TemplateRef,
        initiated_by: &str,
    ) -> Result<WorkflowView> {
        let view = self
            .engine
            .initiate_workflow(employee_id, template, initiated_by)
            .await?;
        self.start_initial(view).await
    }

    /// Create a workflow from an inline step list
    pub async fn initiate_ad_hoc(
        &self,
        employee_id: &str,
        workflow_type: WorkflowType,
        name: &str,
        steps: &[StepDefinition],
        initiated_by: &str,
    ) -> Result<WorkflowView> {
        let view = self
            .engine
            .initiate_ad_hoc(employee_id, workflow_type, name, steps, initiated_by)
            .await?;
        self.start_initial(view).await
    }

    async fn start_initial(&self, view: WorkflowView) -> Result<WorkflowView> {
        let eligible: Vec<StepId> = view.eligible_steps().iter().map(|s| s.id).collect();
        if !self.auto_trigger(&eligible).await {
            return Ok(view);
        }
        self.engine.get_workflow(view.workflow.id).await
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowView> {
        self.engine.get_workflow(workflow_id).await
    }

    pub async fn get_step(&self, step_id: StepId) -> Result<WorkflowStep> {
        self.engine.get_step(step_id).await
    }

    pub async fn list_workflows(&self, filter: &WorkflowFilter) -> Vec<EmployeeWorkflow> {
        self.engine.list_workflows(filter).await
    }

    pub async fn cancel_workflow(&self, workflow_id: WorkflowId, cancelled_by: &str) -> Result<EmployeeWorkflow> {
        self.engine.cancel_workflow(workflow_id, cancelled_by).await
    }

    pub async fn hold_workflow(&self, workflow_id: WorkflowId) -> Result<EmployeeWorkflow> {
        self.engine.hold_workflow(workflow_id).await
    }

    pub async fn resume_workflow(&self, workflow_id: WorkflowId) -> Result<EmployeeWorkflow> {
        self.engine.resume_workflow(workflow_id).await
    }

    // Steps

    /// Start a step; integration-bound steps are dispatched in the background
    pub async fn start_step(&self, step_id: StepId) -> Result<StepUpdate> {
        let update = self.engine.start_step(step_id).await?;
        if update.changed {
            self.dispatch_if_bound(&update.step).await;
        }
        Ok(update)
    }

    pub async fn complete_step(&self, step_id: StepId, completed_by: &str) -> Result<StepUpdate> {
        let update = self.engine.complete_step(step_id, completed_by).await?;
        self.auto_trigger(&update.newly_eligible).await;
        Ok(update)
    }

    pub async fn skip_step(&self, step_id: StepId, skipped_by: &str, reason: &str) -> Result<StepUpdate> {
        let update = self.engine.skip_step(step_id, skipped_by, reason).await?;
        self.auto_trigger(&update.newly_eligible).await;
        Ok(update)
    }

    pub async fn assign_step(&self, step_id: StepId, assignee: &str) -> Result<WorkflowStep> {
        self.engine.assign_step(step_id, assignee).await
    }

    pub async fn check_workflow_progress(&self, workflow_id: WorkflowId) -> Result<WorkflowProgress> {
        self.engine.check_workflow_progress(workflow_id).await
    }

    pub async fn advance_stage(&self, workflow_id: WorkflowId) -> Result<StageAdvance> {
        self.engine.advance_stage(workflow_id).await
    }

    // Integrations

    /// Dispatch an in-progress integration step and wait for the outcome
    ///
    /// `payload` overrides the payload bound on the step definition.
    pub async fn dispatch(
        &self,
        step_id: StepId,
        integration_type: IntegrationType,
        payload: Option<serde_json::Value>,
    ) -> Result<DispatchReport> {
        let report = self
            .dispatcher
            .dispatch(step_id, integration_type, payload)
            .await?;
        if report.status == DispatchStatus::Succeeded {
            self.auto_trigger(&report.newly_eligible).await;
        }
        Ok(report)
    }

    pub async fn list_integrations(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowIntegration>> {
        self.engine.list_integrations(workflow_id).await
    }

    /// Wait for every background dispatch, including ones spawned while waiting
    pub async fn drain_background(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock().await);
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("Background dispatch task failed: {}", e);
                }
            }
        }
    }

    // Exceptions

    pub async fn raise_exception(&self, new: NewException) -> Result<WorkflowException> {
        self.engine.raise_exception(new).await
    }

    pub async fn resolve_exception(
        &self,
        exception_id: ExceptionId,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<WorkflowException> {
        self.engine
            .resolve_exception(exception_id, resolved_by, notes)
            .await
    }

    pub async fn get_exception(&self, exception_id: ExceptionId) -> Result<WorkflowException> {
        self.engine.exceptions().get(exception_id).await
    }

    pub async fn list_exceptions(&self, filter: &ExceptionFilter) -> Vec<WorkflowException> {
        self.engine.exceptions().list(filter).await
    }

    // Reporting

    pub async fn dashboard(&self, now: DateTime<Utc>) -> Dashboard {
        self.reporter.dashboard(now).await
    }

    pub async fn workflow_breakdown(&self, workflow_id: WorkflowId, now: DateTime<Utc>) -> Result<WorkflowBreakdown> {
        self.reporter.workflow_breakdown(workflow_id, now).await
    }

    pub async fn exception_backlog(&self) -> ExceptionBacklog {
        self.reporter.exception_backlog().await
    }

    // Snapshots

    /// Capture the full engine state
    ///
    /// Call `drain_background` first when in-flight dispatches should be
    /// captured with their outcome.
    pub async fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::new(
            self.templates.list().await,
            self.engine.export_states().await,
            self.engine.exceptions().export().await,
        )
    }

    /// Replace the engine state with a snapshot
    pub async fn restore(&self, snapshot: EngineSnapshot) {
        self.engine
            .restore(snapshot.templates, snapshot.workflows, snapshot.exceptions)
            .await;
    }

    /// Persist the engine state to a store
    pub async fn save_to(&self, store: &dyn StateStore) -> anyhow::Result<()> {
        store.save(&self.snapshot().await)
    }

    /// Restore from a store; returns false when the store was empty
    pub async fn load_from(&self, store: &dyn StateStore) -> anyhow::Result<bool> {
        match store.load()? {
            Some(snapshot) => {
                self.restore(snapshot).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start every auto-triggered step among `candidates`; true if any started
    async fn auto_trigger(&self, candidates: &[StepId]) -> bool {
        let mut started = false;
        for &step_id in candidates {
            let step = match self.engine.get_step(step_id).await {
                Ok(step) => step,
                Err(e) => {
                    warn!("Auto-trigger skipped step {}: {}", step_id, e);
                    continue;
                }
            };
            if !step.auto_trigger || step.status != StepStatus::Pending {
                continue;
            }

            match self.engine.start_step(step_id).await {
                Ok(update) => {
                    info!("Auto-started step '{}' of workflow {}", step.key, step.workflow_id);
                    started = true;
                    if update.changed {
                        self.dispatch_if_bound(&update.step).await;
                    }
                }
                Err(e) => warn!("Auto-start of step '{}' failed: {}", step.key, e),
            }
        }
        started
    }

    async fn dispatch_if_bound(&self, step: &WorkflowStep) {
        if step.step_type != StepType::Integration {
            return;
        }
        let Some(binding) = &step.integration else {
            debug!("Integration step '{}' has no binding; waiting for an explicit dispatch", step.key);
            return;
        };

        let handle = tokio::spawn(self.run_dispatch(step.id, binding.integration_type));
        let mut background = self.background.lock().await;
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Background dispatch followed by auto-trigger of its dependents
    ///
    /// Boxed so the spawned future does not contain its own type through
    /// `auto_trigger`.
    fn run_dispatch(
        &self,
        step_id: StepId,
        integration_type: IntegrationType,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let service = self.clone();
        Box::pin(async move {
            match service.dispatch(step_id, integration_type, None).await {
                Ok(report) => debug!(
                    "Dispatch of {} for step {} finished: {:?} after {} attempts",
                    integration_type, step_id, report.status, report.attempts
                ),
                Err(e) => warn!("Dispatch of {} for step {} failed: {}", integration_type, step_id, e),
            }
        })
    }
}
