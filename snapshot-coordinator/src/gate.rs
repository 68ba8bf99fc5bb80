//! Consistency gate.
//!
//! Decides whether the ensemble may be snapshotted or restored right now.

use crate::coordinator::phase::Phase;
use crate::ensemble::{Ensemble, EnsembleStatus};
use crate::utils::errors::CoordinatorError;
use std::sync::Arc;
use tracing::debug;

pub struct ConsistencyGate {
    ensemble: Arc<dyn Ensemble>,
}

impl ConsistencyGate {
    pub fn new(ensemble: Arc<dyn Ensemble>) -> Self {
        Self { ensemble }
    }

    /// Confirm the ensemble is quorate and structurally quiet, then return
    /// the position to cut the snapshot at.
    ///
    /// The position is read in a second status call, after the first has
    /// shown no membership change underway. If the membership configuration
    /// moved between the two reads the cut point is not coherent.
    pub async fn assert_safe_to_snapshot(&self) -> Result<u64, CoordinatorError> {
        let before = self.status(Phase::Preparing).await?;
        Self::check_snapshot_preconditions(&before)?;

        let after = self.status(Phase::Preparing).await?;
        Self::check_snapshot_preconditions(&after)?;
        if after.config_version != before.config_version {
            return Err(CoordinatorError::WriteInFlight(format!(
                "membership configuration changed from version {} to {} while choosing the cut point",
                before.config_version, after.config_version
            )));
        }

        debug!(sequence_marker = after.sequence_marker, "Ensemble safe to snapshot");
        Ok(after.sequence_marker)
    }

    /// Confirm the ensemble can be taken out of rotation. Quorum is not
    /// required: restores are how a broken ensemble gets repaired.
    pub async fn assert_safe_to_restore(&self) -> Result<EnsembleStatus, CoordinatorError> {
        let status = self.status(Phase::Validating).await?;
        if status.restoring {
            return Err(CoordinatorError::Busy(
                "ensemble reports another restore mid-flight".into(),
            ));
        }
        Ok(status)
    }

    fn check_snapshot_preconditions(status: &EnsembleStatus) -> Result<(), CoordinatorError> {
        if !status.quorate {
            return Err(CoordinatorError::NotQuorate(
                "ensemble has no quorum".into(),
            ));
        }
        if status.reconfiguring {
            return Err(CoordinatorError::WriteInFlight(
                "membership change in progress".into(),
            ));
        }
        if status.pending_writes > 0 {
            return Err(CoordinatorError::WriteInFlight(format!(
                "{} uncommitted proposals at the cut point",
                status.pending_writes
            )));
        }
        if status.restoring {
            return Err(CoordinatorError::WriteInFlight(
                "a state replacement is underway".into(),
            ));
        }
        Ok(())
    }

    async fn status(&self, phase: Phase) -> Result<EnsembleStatus, CoordinatorError> {
        self.ensemble
            .status()
            .await
            .map_err(|e| CoordinatorError::ensemble(phase, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::memory::{Fault, MemoryEnsemble};

    fn gate(ensemble: &Arc<MemoryEnsemble>) -> ConsistencyGate {
        ConsistencyGate::new(ensemble.clone())
    }

    #[tokio::test]
    async fn test_healthy_ensemble_returns_position() {
        let ensemble = Arc::new(MemoryEnsemble::new(8_589_934_621));
        assert_eq!(
            gate(&ensemble).assert_safe_to_snapshot().await.unwrap(),
            8_589_934_621
        );
    }

    #[tokio::test]
    async fn test_no_quorum() {
        let ensemble = Arc::new(MemoryEnsemble::new(1));
        ensemble.set_quorate(false);
        assert!(matches!(
            gate(&ensemble).assert_safe_to_snapshot().await,
            Err(CoordinatorError::NotQuorate(_))
        ));
    }

    #[tokio::test]
    async fn test_reconfiguration_blocks_snapshot() {
        let ensemble = Arc::new(MemoryEnsemble::new(1));
        ensemble.set_reconfiguring(true);
        assert!(matches!(
            gate(&ensemble).assert_safe_to_snapshot().await,
            Err(CoordinatorError::WriteInFlight(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_writes_block_snapshot() {
        let ensemble = Arc::new(MemoryEnsemble::new(1));
        ensemble.set_pending_writes(3);
        assert!(matches!(
            gate(&ensemble).assert_safe_to_snapshot().await,
            Err(CoordinatorError::WriteInFlight(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_does_not_need_quorum() {
        let ensemble = Arc::new(MemoryEnsemble::new(1));
        ensemble.set_quorate(false);
        assert!(gate(&ensemble).assert_safe_to_restore().await.is_ok());
    }

    #[tokio::test]
    async fn test_restore_refused_while_another_is_mid_flight() {
        let ensemble = Arc::new(MemoryEnsemble::new(1));
        ensemble.set_restoring(true);
        assert!(matches!(
            gate(&ensemble).assert_safe_to_restore().await,
            Err(CoordinatorError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_ensemble() {
        let ensemble = Arc::new(MemoryEnsemble::new(1));
        ensemble.inject(Fault::Unreachable);
        assert!(matches!(
            gate(&ensemble).assert_safe_to_restore().await,
            Err(CoordinatorError::NotQuorate(_))
        ));
    }
}
