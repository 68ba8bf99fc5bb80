//! Utility modules for the snapshot coordinator.

pub mod errors;
pub mod logger;

pub use errors::{ArbiterError, CoordinatorError, EnsembleError, Result, StoreError};
