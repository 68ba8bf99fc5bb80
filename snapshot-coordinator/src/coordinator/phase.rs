//! Coordinator phases and the ephemeral restore job.

use crate::index::layout::BackupId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Every state a coordinator operation can be in.
///
/// Backup: `Idle → Preparing → Extracting → Uploading → Indexing → Idle`.
/// Restore: `Idle → Validating → Draining → Replacing → Reinitializing → Verifying → Idle`.
/// A restore job ends in `Done` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Preparing,
    Extracting,
    Uploading,
    Indexing,
    Validating,
    Draining,
    Replacing,
    Reinitializing,
    Verifying,
    Done,
    Aborted,
}

impl Phase {
    /// Restore phases that mutate live ensemble state. Timeouts here are
    /// fatal and never retried.
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            Phase::Draining | Phase::Replacing | Phase::Reinitializing | Phase::Verifying
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Extracting => "extracting",
            Phase::Uploading => "uploading",
            Phase::Indexing => "indexing",
            Phase::Validating => "validating",
            Phase::Draining => "draining",
            Phase::Replacing => "replacing",
            Phase::Reinitializing => "reinitializing",
            Phase::Verifying => "verifying",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A restore in progress. Never persisted; owned by the coordinator call
/// that created it and dropped once it reaches a terminal phase.
#[derive(Debug)]
pub struct RestoreJob {
    target_id: BackupId,
    phase: Phase,
}

impl RestoreJob {
    pub fn new(target_id: BackupId) -> Self {
        info!(target_id = %target_id, phase = %Phase::Validating, "Restore job created");
        Self {
            target_id,
            phase: Phase::Validating,
        }
    }

    pub fn target_id(&self) -> &BackupId {
        &self.target_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn advance(&mut self, next: Phase) {
        info!(target_id = %self.target_id, from = %self.phase, to = %next, "Restore phase transition");
        self.phase = next;
    }

    /// Whether a cancellation request may still be honored.
    pub fn is_cancellable(&self) -> bool {
        self.phase == Phase::Validating
    }

    pub fn finish(mut self) {
        self.advance(Phase::Done);
    }

    pub fn abort(mut self) {
        self.advance(Phase::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destructive_phases() {
        assert!(!Phase::Validating.is_destructive());
        assert!(Phase::Draining.is_destructive());
        assert!(Phase::Verifying.is_destructive());
        assert!(!Phase::Uploading.is_destructive());
    }

    #[test]
    fn test_restore_job_cancellable_only_before_draining() {
        let id = BackupId::parse("2024-09-12T14:32:46Z").unwrap();
        let mut job = RestoreJob::new(id);
        assert!(job.is_cancellable());
        job.advance(Phase::Draining);
        assert!(!job.is_cancellable());
        assert_eq!(job.phase(), Phase::Draining);
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&Phase::Reinitializing).unwrap();
        assert_eq!(json, "\"reinitializing\"");
    }
}
