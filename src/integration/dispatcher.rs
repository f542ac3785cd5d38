// Integration dispatcher with bounded retry
//
// Runs the provider call for an integration step outside the instance lock,
// then hands each result to the engine, which records it and applies the
// step transition. Failed attempts are retried after a timer-based backoff
// until the type's `max_retries` is reached.

use tracing::{debug, info};

use super::policy::RetryPolicies;
use super::provider::ProviderRegistry;
use super::types::{
    AttemptDisposition, AttemptOutcome, DispatchReport, DispatchStatus, IntegrationRequest,
    IntegrationType,
};
use crate::error::{Result, WorkflowError};
use crate::workflow::{InstanceEngine, IntegrationTicket, StepId};

/// Executes integration steps against registered providers
#[derive(Clone)]
pub struct IntegrationDispatcher {
    engine: InstanceEngine,
    providers: ProviderRegistry,
    policies: RetryPolicies,
}

impl IntegrationDispatcher {
    pub fn new(engine: InstanceEngine, providers: ProviderRegistry, policies: RetryPolicies) -> Self {
        Self {
            engine,
            providers,
            policies,
        }
    }

    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Run an in-progress integration step to success, exhaustion or cancellation
    ///
    /// A dispatch whose step is completed or skipped by hand during backoff
    /// stops without calling the provider again.
    ///
    /// `payload` overrides the payload bound on the step definition.
    pub async fn dispatch(
        &self,
        step_id: StepId,
        integration_type: IntegrationType,
        payload: Option<serde_json::Value>,
    ) -> Result<DispatchReport> {
        let provider = self
            .providers
            .get(integration_type)
            .ok_or(WorkflowError::IntegrationUnavailable(integration_type))?;
        let policy = self.policies.for_type(integration_type).clone();

        let ticket = self
            .engine
            .begin_integration(step_id, integration_type, payload, policy.max_retries)
            .await?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let request = IntegrationRequest {
                integration_id: ticket.integration_id,
                workflow_id: ticket.workflow_id,
                step_id,
                integration_type,
                payload: ticket.payload.clone(),
                attempt: attempts,
            };

            debug!(
                "Invoking {} for step {} (attempt {})",
                integration_type, step_id, attempts
            );
            let outcome = match tokio::time::timeout(policy.attempt_timeout, provider.invoke(&request)).await {
                Ok(Ok(response)) => AttemptOutcome::Succeeded(response),
                Ok(Err(e)) => AttemptOutcome::Failed(e.to_string()),
                Err(_) => AttemptOutcome::TimedOut(policy.attempt_timeout),
            };

            match self.engine.apply_attempt(&ticket, outcome).await? {
                AttemptDisposition::Succeeded { newly_eligible } => {
                    return Ok(report(&ticket, DispatchStatus::Succeeded, attempts, None, newly_eligible));
                }
                AttemptDisposition::Exhausted { exception_id } => {
                    return Ok(report(
                        &ticket,
                        DispatchStatus::Failed,
                        attempts,
                        Some(exception_id),
                        Vec::new(),
                    ));
                }
                AttemptDisposition::Dropped => {
                    return Ok(report(&ticket, DispatchStatus::Dropped, attempts, None, Vec::new()));
                }
                AttemptDisposition::Retry { failures } => {
                    let delay = policy.delay_for(failures);
                    debug!("Retrying {} for step {} in {:?}", integration_type, step_id, delay);
                    tokio::time::sleep(delay).await;

                    if !self.engine.should_retry(&ticket).await {
                        info!(
                            "Abandoning {} dispatch for step {} of workflow {}",
                            integration_type, step_id, ticket.workflow_id
                        );
                        return Ok(report(&ticket, DispatchStatus::Dropped, attempts, None, Vec::new()));
                    }
                }
            }
        }
    }
}

fn report(
    ticket: &IntegrationTicket,
    status: DispatchStatus,
    attempts: u32,
    exception_id: Option<crate::exception::ExceptionId>,
    newly_eligible: Vec<StepId>,
) -> DispatchReport {
    DispatchReport {
        integration_id: ticket.integration_id,
        workflow_id: ticket.workflow_id,
        step_id: ticket.step_id,
        status,
        attempts,
        exception_id,
        newly_eligible,
    }
}
