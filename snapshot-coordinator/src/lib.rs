//! Snapshot Coordinator Library
//!
//! Consistent backup and restore of a replicated coordination ensemble
//! against an S3-compatible object store.

pub mod api;
pub mod arbiter;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod ensemble;
pub mod gate;
pub mod index;
pub mod leadership;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{RestoreOptions, RestoreOutcome, SnapshotCoordinator};
pub use index::BackupRecord;
pub use utils::errors::{CoordinatorError, Result};
