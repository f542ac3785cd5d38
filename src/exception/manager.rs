// Exception manager
//
// Stores exceptions behind one lock. Callers that also hold a workflow
// instance lock must take that lock first; the manager never reaches back
// into the instance engine.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::{
    ExceptionFilter, ExceptionId, ExceptionStatus, NewException, WorkflowException,
};
use crate::error::{Result, WorkflowError};
use crate::workflow::ActorId;

/// Concurrent store of workflow exceptions
#[derive(Debug, Clone, Default)]
pub struct ExceptionManager {
    exceptions: Arc<RwLock<HashMap<ExceptionId, WorkflowException>>>,
}

impl ExceptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new exception
    ///
    /// The caller is responsible for checking that the workflow exists.
    pub async fn raise(&self, new: NewException) -> Result<WorkflowException> {
        if new.title.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "Exception title cannot be empty".to_string(),
            ));
        }
        if new.raised_by.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "Exception must name who raised it".to_string(),
            ));
        }

        let exception = WorkflowException {
            id: Uuid::new_v4(),
            workflow_id: new.workflow_id,
            step_id: new.step_id,
            exception_type: new.exception_type,
            severity: new.severity,
            status: ExceptionStatus::Open,
            title: new.title,
            description: new.description,
            raised_by: new.raised_by,
            assigned_to: new.assigned_to,
            raised_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        };

        warn!(
            "Raised {} {} exception {} on workflow {}: {}",
            exception.severity,
            exception.exception_type,
            exception.id,
            exception.workflow_id,
            exception.title
        );
        self.exceptions
            .write()
            .await
            .insert(exception.id, exception.clone());
        Ok(exception)
    }

    /// Close an open exception
    pub async fn resolve(
        &self,
        id: ExceptionId,
        resolved_by: ActorId,
        notes: Option<String>,
    ) -> Result<WorkflowException> {
        let mut exceptions = self.exceptions.write().await;
        let exception = exceptions
            .get_mut(&id)
            .ok_or(WorkflowError::ExceptionNotFound(id))?;

        if exception.status == ExceptionStatus::Resolved {
            return Err(WorkflowError::AlreadyResolved(id));
        }

        exception.status = ExceptionStatus::Resolved;
        exception.resolved_at = Some(Utc::now());
        exception.resolved_by = Some(resolved_by);
        exception.resolution_notes = notes;

        info!("Resolved exception {} on workflow {}", id, exception.workflow_id);
        Ok(exception.clone())
    }

    pub async fn get(&self, id: ExceptionId) -> Result<WorkflowException> {
        self.exceptions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(WorkflowError::ExceptionNotFound(id))
    }

    /// Matching exceptions, oldest first
    pub async fn list(&self, filter: &ExceptionFilter) -> Vec<WorkflowException> {
        let exceptions = self.exceptions.read().await;
        let mut matching: Vec<WorkflowException> = exceptions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.raised_at.cmp(&b.raised_at).then(a.id.cmp(&b.id)));
        matching
    }

    /// Every exception, for snapshots
    pub(crate) async fn export(&self) -> Vec<WorkflowException> {
        self.list(&ExceptionFilter::default()).await
    }

    pub(crate) async fn restore(&self, exceptions: Vec<WorkflowException>) {
        let mut store = self.exceptions.write().await;
        *store = exceptions.into_iter().map(|e| (e.id, e)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::exception::types::{ExceptionType, Severity};

    #[tokio::test]
    async fn test_raise_and_resolve() {
        let manager = ExceptionManager::new();
        let workflow_id = Uuid::new_v4();
        let raised = manager
            .raise(
                NewException::manual(workflow_id, Severity::High, "Badge not printed", "it-1")
                    .with_description("Printer offline")
                    .assigned_to("it-2"),
            )
            .await
            .unwrap();
        assert!(raised.is_open());

        let resolved = manager
            .resolve(raised.id, "it-2".to_string(), Some("Reprinted".to_string()))
            .await
            .unwrap();
        assert_eq!(resolved.status, ExceptionStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("it-2"));
        assert!(resolved.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_resolving_twice_fails() {
        let manager = ExceptionManager::new();
        let raised = manager
            .raise(NewException::manual(Uuid::new_v4(), Severity::Low, "Typo", "hr-1"))
            .await
            .unwrap();
        manager.resolve(raised.id, "hr-1".to_string(), None).await.unwrap();

        let err = manager
            .resolve(raised.id, "hr-1".to_string(), None)
            .await
            .unwrap_err();
        assert_eq!(err, WorkflowError::AlreadyResolved(raised.id));
    }

    #[tokio::test]
    async fn test_unknown_exception() {
        let manager = ExceptionManager::new();
        let err = manager.get(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExceptionNotFound);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let manager = ExceptionManager::new();
        let workflow_id = Uuid::new_v4();
        manager
            .raise(NewException::manual(workflow_id, Severity::Low, "Minor", "hr-1"))
            .await
            .unwrap();
        let mut integration =
            NewException::manual(workflow_id, Severity::High, "Check failed", "dispatcher");
        integration.exception_type = ExceptionType::IntegrationFailure;
        let failure = manager.raise(integration).await.unwrap();
        manager
            .raise(NewException::manual(Uuid::new_v4(), Severity::Critical, "Other", "hr-2"))
            .await
            .unwrap();

        let for_workflow = manager
            .list(&ExceptionFilter::default().for_workflow(workflow_id))
            .await;
        assert_eq!(for_workflow.len(), 2);

        let urgent = manager
            .list(&ExceptionFilter {
                workflow_id: Some(workflow_id),
                min_severity: Some(Severity::High),
                ..ExceptionFilter::default()
            })
            .await;
        assert_eq!(urgent.len(), 1);
        assert_eq!(urgent[0].id, failure.id);
    }

    #[tokio::test]
    async fn test_blank_title_rejected() {
        let manager = ExceptionManager::new();
        let err = manager
            .raise(NewException::manual(Uuid::new_v4(), Severity::Low, " ", "hr-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
