// Instance Engine module for the HR workflow engine
//
// Workflow instances, the step state machine and the event stream that
// reports every transition.

pub mod engine;
pub mod events;
pub mod types;

// Re-export commonly used types
pub use engine::{InstanceEngine, DISPATCHER_ACTOR};
pub use events::{EventSink, WorkflowEvent};
pub use types::*;
