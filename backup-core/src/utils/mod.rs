//! Utility modules for the backup manager.

pub mod deadline;
pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{BackupError, Result};
