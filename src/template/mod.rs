// Template Store module for the HR workflow engine
//
// Reusable workflow definitions: data model, structural validation, the
// concurrent store and YAML discovery.

pub mod discovery;
pub mod store;
pub mod types;
pub mod validate;

// Re-export commonly used types
pub use discovery::{load_template_file, DiscoveryReport, TemplateDiscovery};
pub use store::TemplateStore;
pub use types::*;
pub use validate::{validate_draft, validate_steps};
