// Integration Dispatcher module for the HR workflow engine
//
// Side-effecting calls to e-signature, background-check and document-search
// providers, with a per-type retry policy and an audit record per dispatch.

pub mod dispatcher;
pub mod policy;
pub mod provider;
pub mod types;

// Re-export commonly used types
pub use dispatcher::IntegrationDispatcher;
pub use policy::{BackoffStrategy, RetryPolicies, RetryPolicy};
pub use provider::{
    HttpProvider, IntegrationProvider, ProviderError, ProviderRegistry, SimulatedProvider,
    SimulatedReply,
};
pub use types::*;
