// Integration dispatch records and provider exchange types
//
// A `WorkflowIntegration` is the audit record of one dispatch attempt group:
// it is created when a dispatch begins and updated after every attempt. It is
// never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exception::ExceptionId;
use crate::workflow::{StepId, WorkflowId};

/// Unique identifier for an integration record
pub type IntegrationId = Uuid;

/// External system invoked by an integration step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationType {
    /// E-signature provider
    Docusign,
    /// Background-check provider
    BackgroundCheck,
    /// Document-search provider
    DocSearch,
}

impl IntegrationType {
    /// All integration types
    pub const ALL: [IntegrationType; 3] = [
        IntegrationType::Docusign,
        IntegrationType::BackgroundCheck,
        IntegrationType::DocSearch,
    ];
}

impl std::fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrationType::Docusign => write!(f, "docusign"),
            IntegrationType::BackgroundCheck => write!(f, "background_check"),
            IntegrationType::DocSearch => write!(f, "doc_search"),
        }
    }
}

impl std::str::FromStr for IntegrationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "docusign" | "esign" => Ok(IntegrationType::Docusign),
            "background_check" => Ok(IntegrationType::BackgroundCheck),
            "doc_search" => Ok(IntegrationType::DocSearch),
            _ => Err(format!("Invalid integration type: {}", s)),
        }
    }
}

/// Status of an integration record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    /// Attempts still running or scheduled
    Pending,
    /// Provider reported success
    Succeeded,
    /// Retries exhausted
    Failed,
}

impl std::fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrationStatus::Pending => write!(f, "pending"),
            IntegrationStatus::Succeeded => write!(f, "succeeded"),
            IntegrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Audit record of a dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowIntegration {
    /// Unique identifier
    pub id: IntegrationId,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Step the dispatch executes
    pub step_id: StepId,
    /// Provider invoked
    pub integration_type: IntegrationType,
    /// Correlation id returned by the provider
    pub external_id: Option<String>,
    /// Current status
    pub status: IntegrationStatus,
    /// Payload sent to the provider
    pub request_payload: serde_json::Value,
    /// Payload returned on success
    pub response_payload: Option<serde_json::Value>,
    /// Last failure message
    pub error_message: Option<String>,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Failed attempts allowed before the dispatch is exhausted
    pub max_retries: u32,
    /// Number of writes to this record, creation included
    pub revision: u32,
    /// When the dispatch began
    pub created_at: DateTime<Utc>,
    /// When the last attempt finished
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl WorkflowIntegration {
    /// Create a pending record for a new dispatch
    pub fn new(
        workflow_id: WorkflowId,
        step_id: StepId,
        integration_type: IntegrationType,
        request_payload: serde_json::Value,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            step_id,
            integration_type,
            external_id: None,
            status: IntegrationStatus::Pending,
            request_payload,
            response_payload: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            revision: 1,
            created_at: Utc::now(),
            last_attempt_at: None,
        }
    }

    /// Whether another failure would exhaust the dispatch
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }
}

/// Request handed to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRequest {
    /// Integration record the attempt belongs to
    pub integration_id: IntegrationId,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Step being executed
    pub step_id: StepId,
    /// Provider type
    pub integration_type: IntegrationType,
    /// Opaque request payload
    pub payload: serde_json::Value,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Successful provider reply
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Correlation id assigned by the provider
    pub external_id: Option<String>,
    /// Opaque response payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Result of one attempt as seen by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Provider reported success
    Succeeded(ProviderResponse),
    /// Provider reported or raised a failure
    Failed(String),
    /// Attempt exceeded its timeout
    TimedOut(std::time::Duration),
}

impl AttemptOutcome {
    /// Failure message, if the attempt failed
    pub fn error_message(&self) -> Option<String> {
        match self {
            AttemptOutcome::Succeeded(_) => None,
            AttemptOutcome::Failed(message) => Some(message.clone()),
            AttemptOutcome::TimedOut(limit) => {
                Some(format!("Attempt timed out after {}ms", limit.as_millis()))
            }
        }
    }
}

/// What the engine did with an attempt result
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptDisposition {
    /// Step completed; lists steps that became eligible
    Succeeded { newly_eligible: Vec<StepId> },
    /// Failure recorded; another attempt is due
    Retry { failures: u32 },
    /// Retries exhausted; step failed and an exception was raised
    Exhausted { exception_id: ExceptionId },
    /// Result discarded because the workflow was cancelled or the step moved on
    Dropped,
}

/// Final state of a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Succeeded,
    Failed,
    Dropped,
}

/// Summary returned once a dispatch finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Integration record
    pub integration_id: IntegrationId,
    /// Owning workflow
    pub workflow_id: WorkflowId,
    /// Step executed
    pub step_id: StepId,
    /// Final state
    pub status: DispatchStatus,
    /// Provider calls made
    pub attempts: u32,
    /// Exception raised on exhaustion
    pub exception_id: Option<ExceptionId>,
    /// Steps that became eligible after success
    pub newly_eligible: Vec<StepId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integration_type_round_trip_names() {
        for integration_type in IntegrationType::ALL {
            let parsed: IntegrationType = integration_type.to_string().parse().unwrap();
            assert_eq!(parsed, integration_type);
        }
        assert_eq!(
            "background-check".parse::<IntegrationType>().unwrap(),
            IntegrationType::BackgroundCheck
        );
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = WorkflowIntegration::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            IntegrationType::Docusign,
            serde_json::json!({"envelope": "offer"}),
            3,
        );
        assert_eq!(record.status, IntegrationStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.revision, 1);
        assert!(!record.is_last_attempt());
    }

    #[test]
    fn test_timeout_error_message() {
        let outcome = AttemptOutcome::TimedOut(std::time::Duration::from_millis(250));
        assert_eq!(
            outcome.error_message().unwrap(),
            "Attempt timed out after 250ms"
        );
        assert!(AttemptOutcome::Succeeded(ProviderResponse::default())
            .error_message()
            .is_none());
    }
}
