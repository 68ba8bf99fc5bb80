//! Snapshot coordinator.
//!
//! Sequences backups and restores against the ensemble, the object store
//! and the lease. Every operation is one sequential workflow running under a
//! lease; nothing is retried across a phase boundary.

pub mod phase;


use crate::arbiter::probe::{HolderProbe, PeerProbe};
use crate::arbiter::{Arbiter, Lease, LeaseRecord, OperationKind};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::ensemble::http::HttpEnsemble;
use crate::ensemble::{Ensemble, EnsembleStatus};
use crate::gate::ConsistencyGate;
use crate::index::layout::{BackupId, BackupPaths, CompletionMarker, Encoding};
use crate::index::{BackupIndex, BackupRecord};
use crate::store::{s3, ObjectGateway, ObjectStoreGateway};
use crate::utils::errors::{CoordinatorError, EnsembleError, Result, StoreError};
use bytes::Bytes;
use phase::{Phase, RestoreJob};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ZSTD_LEVEL: i32 = 3;

/// Timeout for the holder's `/health` call made before reclaiming an expired lease.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub node_id: String,
    pub lease_ttl: chrono::Duration,
    /// How often a running operation renews its lease.
    pub renew_interval: Duration,
    /// Bound on waiting for members to stop serving.
    pub drain_timeout: Duration,
    /// Bound on each of the replace and reinitialize calls.
    pub replace_timeout: Duration,
    /// Bound on the ensemble reporting the restored position with quorum.
    pub verify_timeout: Duration,
    pub poll_interval: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let lease_ttl = chrono::Duration::from_std(Duration::from_secs(config.lease.ttl_secs))
            .map_err(|e| CoordinatorError::Config(format!("lease.ttl_secs out of range: {e}")))?;
        Ok(Self {
            node_id: config.node.id.clone(),
            lease_ttl,
            renew_interval: Duration::from_secs((config.lease.ttl_secs / 3).max(1)),
            drain_timeout: Duration::from_secs(config.ensemble.drain_timeout_secs),
            replace_timeout: Duration::from_secs(config.ensemble.replace_timeout_secs),
            verify_timeout: Duration::from_secs(config.ensemble.verify_timeout_secs),
            poll_interval: Duration::from_millis(config.ensemble.poll_interval_ms),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Accept a target older than the ensemble's current position.
    #[serde(default)]
    pub allow_regression: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub record: BackupRecord,
    /// Position the ensemble reported once it re-achieved quorum.
    pub position: u64,
    pub phase: Phase,
}

pub struct SnapshotCoordinator {
    gateway: Arc<dyn ObjectGateway>,
    index: BackupIndex,
    arbiter: Arbiter,
    gate: ConsistencyGate,
    ensemble: Arc<dyn Ensemble>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
}

impl SnapshotCoordinator {
    pub fn new(
        gateway: Arc<dyn ObjectGateway>,
        paths: BackupPaths,
        ensemble: Arc<dyn Ensemble>,
        probe: Arc<dyn HolderProbe>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
    ) -> Self {
        let arbiter = Arbiter::new(
            gateway.clone(),
            paths.lease(),
            settings.node_id.clone(),
            settings.lease_ttl,
            clock.clone(),
            probe,
        );
        Self {
            index: BackupIndex::new(gateway.clone(), paths),
            gateway,
            arbiter,
            gate: ConsistencyGate::new(ensemble.clone()),
            ensemble,
            clock,
            settings,
        }
    }

    /// Wire up the S3 store, the sidecar client and the peer probe.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = s3::build_store(&config.store)?;
        let gateway = Arc::new(ObjectStoreGateway::new(store, config.retry_policy()));
        let settings = CoordinatorSettings::from_config(config)?;
        let ensemble = HttpEnsemble::new(&config.ensemble.admin_url, settings.replace_timeout)
            .map_err(|e| CoordinatorError::Config(e.to_string()))?;
        if config.peers.is_empty() {
            warn!("No [peers] configured; expired leases held by other nodes will never be reclaimed");
        }
        let probe = PeerProbe::new(config.peers.clone(), PROBE_TIMEOUT);

        Ok(Self::new(
            gateway,
            BackupPaths::new(&config.store.prefix),
            Arc::new(ensemble),
            Arc::new(probe),
            Arc::new(SystemClock),
            settings,
        ))
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    /// Tokens of the leases held by operations running in this process.
    pub async fn held_leases(&self) -> Vec<Uuid> {
        self.arbiter.held().tokens().await
    }

    /// Take a consistent snapshot and record it.
    ///
    /// `cancel` is honored until the artifact has been extracted. Once the
    /// upload starts the backup runs to completion or failure.
    pub async fn create_backup(&self, cancel: &CancellationToken) -> Result<BackupRecord> {
        let lease = Mutex::new(
            self.arbiter
                .acquire(OperationKind::Backup)
                .await
                .map_err(|e| CoordinatorError::arbiter(Phase::Idle, e))?,
        );

        let result = self
            .with_heartbeat(&lease, self.run_backup(&lease, cancel))
            .await;
        match &result {
            Ok(record) => {
                info!(id = %record.id, sequence_marker = record.sequence_marker, "Backup complete")
            }
            Err(CoordinatorError::Cancelled(phase)) => info!(phase = %phase, "Backup cancelled"),
            Err(e) => error!(kind = e.kind(), error = %e, "Backup failed"),
        }
        self.release(lease.into_inner()).await;
        result
    }

    async fn run_backup(
        &self,
        lease: &Mutex<Lease>,
        cancel: &CancellationToken,
    ) -> Result<BackupRecord> {
        enter_backup_phase(Phase::Preparing);
        let sequence_marker = self.gate.assert_safe_to_snapshot().await?;
        let id = BackupId::from_instant(self.clock.now());
        let latest = self
            .index
            .latest()
            .await
            .map_err(|e| CoordinatorError::store(Phase::Preparing, e))?;
        if let Some(latest) = &latest {
            if id <= latest.id {
                return Err(CoordinatorError::failed(
                    Phase::Preparing,
                    format!("backup id {id} does not sort after the newest record {}", latest.id),
                ));
            }
            if sequence_marker < latest.sequence_marker {
                return Err(CoordinatorError::failed(
                    Phase::Preparing,
                    format!(
                        "ensemble position {sequence_marker} is behind the newest record {} at {}",
                        latest.id, latest.sequence_marker
                    ),
                ));
            }
        }
        let pending = BackupRecord::pending(self.index.paths(), id, sequence_marker);
        debug!(id = %pending.id, storage_path = %pending.storage_path, "Backup pending");
        self.renew(lease, Phase::Preparing).await?;

        enter_backup_phase(Phase::Extracting);
        if cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled(Phase::Extracting));
        }
        let artifact = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled(Phase::Extracting)),
            artifact = self.ensemble.snapshot() => {
                artifact.map_err(|e| CoordinatorError::ensemble(Phase::Extracting, e))?
            }
        };
        if artifact.sequence_marker != sequence_marker {
            warn!(
                expected = sequence_marker,
                actual = artifact.sequence_marker,
                "Ensemble position moved during extraction"
            );
            self.gate.assert_safe_to_snapshot().await?;
            return Err(CoordinatorError::WriteInFlight(format!(
                "position advanced from {sequence_marker} to {} during extraction",
                artifact.sequence_marker
            )));
        }
        if cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled(Phase::Extracting));
        }

        enter_backup_phase(Phase::Uploading);
        self.renew(lease, Phase::Uploading).await?;
        let raw_len = artifact.data.len();
        let (encoded, sha256) = compress(artifact.data).await?;
        let size_bytes = encoded.len() as u64;
        self.gateway
            .put(&self.index.paths().artifact(&id), encoded)
            .await
            .map_err(|e| CoordinatorError::store(Phase::Uploading, e))?;
        info!(id = %id, raw_bytes = raw_len, stored_bytes = size_bytes, "Artifact uploaded");

        enter_backup_phase(Phase::Indexing);
        self.renew(lease, Phase::Indexing).await?;
        let marker = CompletionMarker {
            id,
            sequence_marker,
            created_at: self.clock.now(),
            size_bytes,
            sha256,
            encoding: Encoding::Zstd,
            node_id: self.settings.node_id.clone(),
        };
        self.index
            .commit(&marker)
            .await
            .map_err(|e| CoordinatorError::store(Phase::Indexing, e))
    }

    /// Complete records, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        self.index
            .list_records()
            .await
            .map_err(|e| CoordinatorError::store(Phase::Idle, e))
    }

    pub async fn describe_backup(&self, id: &str) -> Result<BackupRecord> {
        let id = parse_id(id)?;
        self.resolve(&id, Phase::Idle).await
    }

    /// The outstanding lease, whoever holds it.
    pub async fn current_lease(&self) -> Result<Option<LeaseRecord>> {
        self.arbiter
            .current()
            .await
            .map_err(|e| CoordinatorError::arbiter(Phase::Idle, e))
    }

    /// Replace the ensemble's state with backup `id`.
    ///
    /// `cancel` is honored only until draining starts. A failure from then
    /// on leaves the ensemble where it stopped and says so.
    pub async fn restore(
        &self,
        id: &str,
        options: RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome> {
        let target = parse_id(id)?;
        let lease = Mutex::new(
            self.arbiter
                .acquire(OperationKind::Restore)
                .await
                .map_err(|e| CoordinatorError::arbiter(Phase::Idle, e))?,
        );

        let mut job = RestoreJob::new(target);
        let result = self
            .with_heartbeat(&lease, self.run_restore(&mut job, &lease, options, cancel))
            .await;
        match &result {
            Ok(outcome) => {
                info!(id = %outcome.record.id, position = outcome.position, "Restore complete");
                job.finish();
            }
            Err(e) => {
                error!(id = %job.target_id(), phase = %job.phase(), kind = e.kind(), error = %e, "Restore failed");
                job.abort();
            }
        }
        self.release(lease.into_inner()).await;
        result
    }

    async fn run_restore(
        &self,
        job: &mut RestoreJob,
        lease: &Mutex<Lease>,
        options: RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome> {
        let record = self.resolve(job.target_id(), Phase::Validating).await?;
        let status = self.gate.assert_safe_to_restore().await?;
        if status.sequence_marker > 0 && record.sequence_marker < status.sequence_marker {
            if !options.allow_regression {
                return Err(CoordinatorError::failed(
                    Phase::Validating,
                    format!(
                        "backup {} is at position {} but the ensemble is at {}; restoring would move it backwards and needs allow_regression",
                        record.id, record.sequence_marker, status.sequence_marker
                    ),
                ));
            }
            warn!(
                id = %record.id,
                target = record.sequence_marker,
                current = status.sequence_marker,
                "Restoring to an older position on operator confirmation"
            );
        }
        let state = self.fetch_artifact(&record).await?;
        // Last point where a lost lease stops the restore.
        self.renew(lease, Phase::Validating).await?;
        if job.is_cancellable() && cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled(Phase::Validating));
        }

        job.advance(Phase::Draining);
        let deadline = Instant::now() + self.settings.drain_timeout;
        self.bounded_until(Phase::Draining, deadline, self.ensemble.drain())
            .await?;
        self.wait_for(Phase::Draining, deadline, |s| Ok(!s.serving))
            .await?;

        job.advance(Phase::Replacing);
        self.bounded(
            Phase::Replacing,
            self.settings.replace_timeout,
            self.ensemble.replace_state(state),
        )
        .await?;

        job.advance(Phase::Reinitializing);
        self.bounded(
            Phase::Reinitializing,
            self.settings.replace_timeout,
            self.ensemble.reinitialize(record.sequence_marker),
        )
        .await?;

        job.advance(Phase::Verifying);
        let expected = record.sequence_marker;
        let deadline = Instant::now() + self.settings.verify_timeout;
        let verified = self
            .wait_for(Phase::Verifying, deadline, |s| {
                if !s.quorate {
                    return Ok(false);
                }
                if s.sequence_marker != expected {
                    return Err(CoordinatorError::failed(
                        Phase::Verifying,
                        format!(
                            "ensemble reports position {} after restore, expected {expected}; members were left drained",
                            s.sequence_marker
                        ),
                    ));
                }
                Ok(true)
            })
            .await?;
        self.bounded(Phase::Verifying, self.settings.verify_timeout, self.ensemble.resume())
            .await?;

        Ok(RestoreOutcome {
            record,
            position: verified.sequence_marker,
            phase: Phase::Done,
        })
    }

    async fn resolve(&self, id: &BackupId, phase: Phase) -> Result<BackupRecord> {
        self.index.resolve(id).await.map_err(|e| match e {
            StoreError::NotFound { .. } => {
                CoordinatorError::NotFound(format!("no complete backup with id {id}"))
            }
            other => CoordinatorError::store(phase, other),
        })
    }

    /// Download, check and decode the artifact before anything destructive
    /// happens.
    async fn fetch_artifact(&self, record: &BackupRecord) -> Result<Bytes> {
        let stored = self
            .gateway
            .get(&self.index.paths().artifact(&record.id))
            .await
            .map_err(|e| CoordinatorError::store(Phase::Validating, e))?;

        if record.size_bytes > 0 && stored.len() as u64 != record.size_bytes {
            return Err(CoordinatorError::failed(
                Phase::Validating,
                format!(
                    "artifact for {} is {} bytes, marker records {}",
                    record.id,
                    stored.len(),
                    record.size_bytes
                ),
            ));
        }
        let encoding = record.encoding.unwrap_or(Encoding::Identity);
        let expected = record.sha256.clone();
        let id = record.id;

        tokio::task::spawn_blocking(move || {
            if let Some(expected) = expected {
                let actual = format!("{:x}", Sha256::digest(&stored));
                if actual != expected {
                    return Err(CoordinatorError::failed(
                        Phase::Validating,
                        format!("artifact for {id} has digest {actual}, marker records {expected}"),
                    ));
                }
            }
            match encoding {
                Encoding::Identity => Ok(stored),
                Encoding::Zstd => zstd::decode_all(stored.as_ref()).map(Bytes::from).map_err(|e| {
                    CoordinatorError::failed(
                        Phase::Validating,
                        format!("artifact for {id} does not decompress: {e}"),
                    )
                }),
            }
        })
        .await
        .map_err(|e| CoordinatorError::failed(Phase::Validating, e.to_string()))?
    }

    async fn bounded<T>(
        &self,
        phase: Phase,
        bound: Duration,
        call: impl Future<Output = std::result::Result<T, EnsembleError>>,
    ) -> Result<T> {
        self.bounded_until(phase, Instant::now() + bound, call).await
    }

    async fn bounded_until<T>(
        &self,
        phase: Phase,
        deadline: Instant,
        call: impl Future<Output = std::result::Result<T, EnsembleError>>,
    ) -> Result<T> {
        match tokio::time::timeout_at(deadline, call).await {
            Ok(result) => result.map_err(|e| CoordinatorError::ensemble(phase, e)),
            Err(_) => Err(CoordinatorError::failed(
                phase,
                "ensemble did not answer within the phase bound",
            )),
        }
    }

    /// Poll status until `accept` says yes, errors, or `deadline` passes.
    /// Status errors while polling are expected during restarts and only
    /// remembered for the timeout message.
    async fn wait_for<F>(&self, phase: Phase, deadline: Instant, mut accept: F) -> Result<EnsembleStatus>
    where
        F: FnMut(&EnsembleStatus) -> Result<bool>,
    {
        let mut last = String::from("no status received");
        loop {
            match tokio::time::timeout_at(deadline, self.ensemble.status()).await {
                Ok(Ok(status)) => {
                    if accept(&status)? {
                        return Ok(status);
                    }
                    last = format!(
                        "quorate={} position={} serving={}",
                        status.quorate, status.sequence_marker, status.serving
                    );
                }
                Ok(Err(e)) => {
                    debug!(phase = %phase, error = %e, "Status poll failed");
                    last = e.to_string();
                }
                Err(_) => break,
            }
            if Instant::now() + self.settings.poll_interval >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        Err(CoordinatorError::failed(
            phase,
            format!("not confirmed within the phase bound; last observed: {last}"),
        ))
    }

    async fn renew(&self, lease: &Mutex<Lease>, phase: Phase) -> Result<()> {
        let mut lease = lease.lock().await;
        self.arbiter
            .renew(&mut lease)
            .await
            .map_err(|e| CoordinatorError::arbiter(phase, e))
    }

    /// Drive `work` to completion, renewing `lease` every `renew_interval`.
    /// A failed heartbeat is only logged: before draining the next phase
    /// boundary renewal fails the operation, after it stopping would strand
    /// the ensemble.
    async fn with_heartbeat<T>(
        &self,
        lease: &Mutex<Lease>,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::pin!(work);
        let mut ticks = tokio::time::interval_at(
            Instant::now() + self.settings.renew_interval,
            self.settings.renew_interval,
        );
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = ticks.tick() => {
                    let mut lease = lease.lock().await;
                    if let Err(e) = self.arbiter.renew(&mut lease).await {
                        warn!(token = %lease.token(), error = %e, "Lease heartbeat failed");
                    }
                }
            }
        }
    }

    async fn release(&self, lease: Lease) {
        let token = lease.token();
        if let Err(e) = self.arbiter.release(lease).await {
            warn!(token = %token, error = %e, "Failed to release lease; it will expire");
        }
    }
}

fn enter_backup_phase(phase: Phase) {
    info!(phase = %phase, "Backup phase transition");
}

fn parse_id(id: &str) -> Result<BackupId> {
    BackupId::parse(id).map_err(|e| CoordinatorError::NotFound(format!("{id}: {e}")))
}

async fn compress(data: Bytes) -> Result<(Bytes, String)> {
    tokio::task::spawn_blocking(move || {
        let encoded = zstd::encode_all(data.as_ref(), ZSTD_LEVEL)?;
        let sha256 = format!("{:x}", Sha256::digest(&encoded));
        Ok::<_, std::io::Error>((Bytes::from(encoded), sha256))
    })
    .await
    .map_err(|e| CoordinatorError::failed(Phase::Uploading, e.to_string()))?
    .map_err(|e| CoordinatorError::failed(Phase::Uploading, format!("compression failed: {e}")))
}
