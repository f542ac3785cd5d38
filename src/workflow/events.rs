// Workflow event stream
//
// The engine publishes one event per state change on an unbounded channel
// when progress reporting is enabled. Subscribers are notification sinks;
// the engine never waits on them and ignores a closed receiver.

use serde::Serialize;
use tokio::sync::mpsc;

use super::types::{StepId, StepStatus, WorkflowId, WorkflowStatus};
use crate::exception::{ExceptionId, Severity};
use crate::integration::{IntegrationId, IntegrationStatus, IntegrationType};

/// State change published by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Workflow instance created
    WorkflowInitiated {
        workflow_id: WorkflowId,
        employee_id: String,
        steps: usize,
    },
    /// Workflow status changed
    WorkflowStatusChanged {
        workflow_id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    /// Step status changed
    StepTransitioned {
        workflow_id: WorkflowId,
        step_id: StepId,
        from: StepStatus,
        to: StepStatus,
    },
    /// Current stage moved forward
    StageAdvanced {
        workflow_id: WorkflowId,
        from: String,
        to: String,
    },
    /// Integration record written
    IntegrationUpdated {
        workflow_id: WorkflowId,
        integration_id: IntegrationId,
        integration_type: IntegrationType,
        status: IntegrationStatus,
        retry_count: u32,
    },
    /// Exception opened
    ExceptionRaised {
        workflow_id: WorkflowId,
        exception_id: ExceptionId,
        severity: Severity,
    },
    /// Exception closed
    ExceptionResolved {
        workflow_id: WorkflowId,
        exception_id: ExceptionId,
    },
}

impl WorkflowEvent {
    /// Workflow the event belongs to
    pub fn workflow_id(&self) -> WorkflowId {
        match self {
            WorkflowEvent::WorkflowInitiated { workflow_id, .. }
            | WorkflowEvent::WorkflowStatusChanged { workflow_id, .. }
            | WorkflowEvent::StepTransitioned { workflow_id, .. }
            | WorkflowEvent::StageAdvanced { workflow_id, .. }
            | WorkflowEvent::IntegrationUpdated { workflow_id, .. }
            | WorkflowEvent::ExceptionRaised { workflow_id, .. }
            | WorkflowEvent::ExceptionResolved { workflow_id, .. } => *workflow_id,
        }
    }
}

/// Sending half of the event stream
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

impl EventSink {
    /// Sink that discards every event
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create a connected sink and its receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                tracing::trace!("Event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_channel_delivers_events() {
        let (sink, mut receiver) = EventSink::channel();
        let workflow_id = Uuid::new_v4();
        sink.emit(WorkflowEvent::StageAdvanced {
            workflow_id,
            from: "pre-boarding".to_string(),
            to: "day-1".to_string(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.workflow_id(), workflow_id);
    }

    #[test]
    fn test_disabled_sink_and_closed_receiver_are_silent() {
        EventSink::disabled().emit(WorkflowEvent::ExceptionResolved {
            workflow_id: Uuid::new_v4(),
            exception_id: Uuid::new_v4(),
        });

        let (sink, receiver) = EventSink::channel();
        drop(receiver);
        sink.emit(WorkflowEvent::ExceptionResolved {
            workflow_id: Uuid::new_v4(),
            exception_id: Uuid::new_v4(),
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = WorkflowEvent::StepTransitioned {
            workflow_id: Uuid::nil(),
            step_id: Uuid::nil(),
            from: StepStatus::Pending,
            to: StepStatus::InProgress,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "step_transitioned");
        assert_eq!(json["to"], "in-progress");
    }
}
