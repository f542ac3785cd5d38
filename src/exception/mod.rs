// Exception Manager module for the HR workflow engine
//
// Human-attention tickets raised by the dispatcher on exhausted integrations
// or flagged manually.

pub mod manager;
pub mod types;

pub use manager::ExceptionManager;
pub use types::*;
