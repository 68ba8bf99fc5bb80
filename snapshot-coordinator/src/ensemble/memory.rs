//! In-process ensemble.
//!
//! Holds a key/value image and a log position, and follows the same
//! drain → replace → reinitialize → resume contract as a real ensemble.
//! Faults can be injected to exercise the coordinator's failure paths.

use super::{Artifact, Ensemble, EnsembleStatus};
use crate::utils::errors::EnsembleError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Image {
    sequence_marker: u64,
    data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Every control call fails as unreachable.
    Unreachable,
    /// The position moves forward by this much while a snapshot is cut.
    AdvanceDuringSnapshot(u64),
    /// Snapshot takes this long.
    SnapshotDelay(Duration),
    /// `drain` is accepted but members keep serving.
    DrainNeverConfirms,
    /// `drain` takes this long to answer, and members keep serving for
    /// as long again afterwards.
    SlowDrain(Duration),
    /// `replace_state` is rejected.
    ReplaceFails,
    /// After reinitializing, the ensemble reports this position.
    PositionAfterReinitialize(u64),
}

#[derive(Debug)]
struct Inner {
    live: Image,
    staged: Option<Image>,
    quorate: bool,
    serving: bool,
    stops_serving_at: Option<Instant>,
    reconfiguring: bool,
    config_version: u64,
    pending_writes: u64,
    restoring: bool,
    faults: Vec<Fault>,
    calls: Vec<&'static str>,
}

pub struct MemoryEnsemble {
    inner: Mutex<Inner>,
}

impl MemoryEnsemble {
    /// Healthy, serving ensemble at `sequence_marker` with no data.
    pub fn new(sequence_marker: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                live: Image {
                    sequence_marker,
                    data: BTreeMap::new(),
                },
                staged: None,
                quorate: true,
                serving: true,
                stops_serving_at: None,
                reconfiguring: false,
                config_version: 1,
                pending_writes: 0,
                restoring: false,
                faults: Vec::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commit a write; advances the position by one.
    pub fn write(&self, key: &str, value: &str) {
        let mut inner = self.lock();
        inner.live.data.insert(key.to_string(), value.to_string());
        inner.live.sequence_marker += 1;
    }

    pub fn data(&self) -> BTreeMap<String, String> {
        self.lock().live.data.clone()
    }

    pub fn position(&self) -> u64 {
        self.lock().live.sequence_marker
    }

    pub fn is_serving(&self) -> bool {
        self.lock().serving
    }

    pub fn set_quorate(&self, quorate: bool) {
        self.lock().quorate = quorate;
    }

    pub fn set_reconfiguring(&self, reconfiguring: bool) {
        let mut inner = self.lock();
        inner.reconfiguring = reconfiguring;
        inner.config_version += 1;
    }

    pub fn set_pending_writes(&self, pending: u64) {
        self.lock().pending_writes = pending;
    }

    pub fn set_restoring(&self, restoring: bool) {
        self.lock().restoring = restoring;
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// Names of the mutating control calls received, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    fn has(&self, fault: &Fault) -> bool {
        self.lock().faults.contains(fault)
    }

    fn check_reachable(&self) -> Result<(), EnsembleError> {
        if self.has(&Fault::Unreachable) {
            return Err(EnsembleError::Unreachable("in-memory ensemble is down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ensemble for MemoryEnsemble {
    async fn status(&self) -> Result<EnsembleStatus, EnsembleError> {
        self.check_reachable()?;
        let mut inner = self.lock();
        if inner.stops_serving_at.is_some_and(|at| Instant::now() >= at) {
            inner.stops_serving_at = None;
            inner.serving = false;
        }
        Ok(EnsembleStatus {
            quorate: inner.quorate,
            sequence_marker: inner.live.sequence_marker,
            reconfiguring: inner.reconfiguring,
            config_version: inner.config_version,
            pending_writes: inner.pending_writes,
            serving: inner.serving,
            restoring: inner.restoring,
        })
    }

    async fn snapshot(&self) -> Result<Artifact, EnsembleError> {
        self.check_reachable()?;
        let delay = self.lock().faults.iter().find_map(|f| match f {
            Fault::SnapshotDelay(d) => Some(*d),
            _ => None,
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        inner.calls.push("snapshot");
        let advance = inner.faults.iter().find_map(|f| match f {
            Fault::AdvanceDuringSnapshot(n) => Some(*n),
            _ => None,
        });
        if let Some(n) = advance {
            inner.live.sequence_marker += n;
        }
        let data = serde_json::to_vec(&inner.live)
            .map_err(|e| EnsembleError::Protocol(e.to_string()))?;
        Ok(Artifact {
            sequence_marker: inner.live.sequence_marker,
            data: Bytes::from(data),
        })
    }

    async fn drain(&self) -> Result<(), EnsembleError> {
        self.check_reachable()?;
        let never_confirms = self.has(&Fault::DrainNeverConfirms);
        let slow = self.lock().faults.iter().find_map(|f| match f {
            Fault::SlowDrain(d) => Some(*d),
            _ => None,
        });
        if let Some(delay) = slow {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        inner.calls.push("drain");
        if never_confirms {
            return Ok(());
        }
        match slow {
            Some(delay) => inner.stops_serving_at = Some(Instant::now() + delay),
            None => inner.serving = false,
        }
        Ok(())
    }

    async fn replace_state(&self, data: Bytes) -> Result<(), EnsembleError> {
        self.check_reachable()?;
        let fails = self.has(&Fault::ReplaceFails);
        let mut inner = self.lock();
        inner.calls.push("replace_state");
        if fails {
            return Err(EnsembleError::Rejected("disk write refused".into()));
        }
        if inner.serving {
            return Err(EnsembleError::Rejected("cannot replace state while serving".into()));
        }
        let image: Image = serde_json::from_slice(&data)
            .map_err(|e| EnsembleError::Rejected(format!("unrecognized snapshot: {e}")))?;
        inner.staged = Some(image);
        inner.restoring = true;
        Ok(())
    }

    async fn reinitialize(&self, sequence_marker: u64) -> Result<(), EnsembleError> {
        self.check_reachable()?;
        let forced = self.lock().faults.iter().find_map(|f| match f {
            Fault::PositionAfterReinitialize(p) => Some(*p),
            _ => None,
        });
        let mut inner = self.lock();
        inner.calls.push("reinitialize");
        let staged = inner
            .staged
            .take()
            .ok_or_else(|| EnsembleError::Rejected("no replaced state to reinitialize from".into()))?;
        if staged.sequence_marker != sequence_marker {
            return Err(EnsembleError::Rejected(format!(
                "snapshot embeds position {}, asked for {sequence_marker}",
                staged.sequence_marker
            )));
        }
        inner.live = staged;
        if let Some(position) = forced {
            inner.live.sequence_marker = position;
        }
        inner.restoring = false;
        inner.quorate = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), EnsembleError> {
        self.check_reachable()?;
        let mut inner = self.lock();
        inner.calls.push("resume");
        inner.serving = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_and_restore_cycle() {
        let source = MemoryEnsemble::new(10);
        source.write("/app/config", "v1");
        source.write("/app/leader", "zk-1");
        let artifact = source.snapshot().await.unwrap();
        assert_eq!(artifact.sequence_marker, 12);

        let target = MemoryEnsemble::new(0);
        target.drain().await.unwrap();
        target.replace_state(artifact.data).await.unwrap();
        assert!(target.status().await.unwrap().restoring);
        target.reinitialize(12).await.unwrap();
        target.resume().await.unwrap();

        assert_eq!(target.position(), 12);
        assert_eq!(target.data(), source.data());
        assert_eq!(
            target.calls(),
            vec!["drain", "replace_state", "reinitialize", "resume"]
        );
    }

    #[tokio::test]
    async fn test_replace_requires_drain() {
        let ensemble = MemoryEnsemble::new(5);
        let artifact = ensemble.snapshot().await.unwrap();
        assert!(matches!(
            ensemble.replace_state(artifact.data).await,
            Err(EnsembleError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_drain_confirms_late() {
        let ensemble = MemoryEnsemble::new(5);
        ensemble.inject(Fault::SlowDrain(Duration::from_millis(20)));
        ensemble.drain().await.unwrap();
        assert!(ensemble.status().await.unwrap().serving);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!ensemble.status().await.unwrap().serving);
    }

    #[tokio::test]
    async fn test_unreachable_fault() {
        let ensemble = MemoryEnsemble::new(5);
        ensemble.inject(Fault::Unreachable);
        assert!(matches!(
            ensemble.status().await,
            Err(EnsembleError::Unreachable(_))
        ));
    }
}
