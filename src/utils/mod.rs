// Shared utilities

pub mod serde_helpers;

pub use serde_helpers::duration_ms_serde;
