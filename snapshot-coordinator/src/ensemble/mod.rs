//! Ensemble control surface.
//!
//! The coordinator drives the ensemble only through [`Ensemble`]; how the
//! daemon is supervised, drained and restarted lives behind it.

pub mod http;
pub mod memory;

use crate::utils::errors::EnsembleError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Health and position as reported by the ensemble.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleStatus {
    pub quorate: bool,
    /// Current log position (zxid).
    pub sequence_marker: u64,
    /// Membership change in progress.
    #[serde(default)]
    pub reconfiguring: bool,
    /// Version of the membership configuration; changes on every reconfiguration.
    #[serde(default)]
    pub config_version: u64,
    /// Proposals accepted but not yet committed.
    #[serde(default)]
    pub pending_writes: u64,
    /// Whether members are serving clients.
    #[serde(default)]
    pub serving: bool,
    /// A state replacement is underway.
    #[serde(default)]
    pub restoring: bool,
}

/// Snapshot bytes together with the position they were cut at.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub sequence_marker: u64,
    pub data: Bytes,
}

#[async_trait]
pub trait Ensemble: Send + Sync {
    async fn status(&self) -> Result<EnsembleStatus, EnsembleError>;

    /// Produce a snapshot at the current position.
    async fn snapshot(&self) -> Result<Artifact, EnsembleError>;

    /// Stop serving and participating. Returns once the request is accepted;
    /// completion is observed through `status`.
    async fn drain(&self) -> Result<(), EnsembleError>;

    /// Swap on-disk state for `data`. Only valid while drained.
    async fn replace_state(&self, data: Bytes) -> Result<(), EnsembleError>;

    /// Rebuild consensus state from the replaced data, which embeds
    /// `sequence_marker`.
    async fn reinitialize(&self, sequence_marker: u64) -> Result<(), EnsembleError>;

    /// Return to serving clients.
    async fn resume(&self) -> Result<(), EnsembleError>;
}
