//! Utility modules for the backup agent.

pub mod errors;

pub use errors::{BackupError, Result};
