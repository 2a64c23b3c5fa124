//! Backup Core Library
//!
//! Database backup lifecycle: create, verify, retain, schedule and restore
//! compressed, checksummed SQL dumps.

pub mod artifact;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod events;
pub mod executor;
pub mod health;
pub mod history;
pub mod manager;
pub mod metadata;
pub mod retention;
pub mod retry;
pub mod scheduler;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use config::Config;
pub use manager::BackupManager;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
