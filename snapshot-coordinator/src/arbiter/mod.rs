//! Single-writer arbiter.
//!
//! At most one backup or restore runs cluster-wide. Exclusivity is a lease
//! record in the object store rather than an in-process lock, so every node
//! observes the same holder and a restarted node sees leases it held before
//! it died.
//!
//! - `acquire` is a create-if-absent write: the first writer wins, everyone
//!   else gets `Busy` immediately. Nothing is queued.
//! - `renew` and reclamation are compare-and-swap on the stored version.
//! - An expired lease is reclaimed only when its holder is confirmed gone:
//!   it no longer answers, or it answers without the lease's token.

pub mod probe;

use crate::clock::Clock;
use crate::store::{ObjectGateway, ObjectVersion};
use crate::utils::errors::{ArbiterError, StoreError};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use probe::{HolderProbe, HolderState};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Backup => f.write_str("backup"),
            OperationKind::Restore => f.write_str("restore"),
        }
    }
}

/// The stored lease document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub token: Uuid,
    pub holder: String,
    pub operation: OperationKind,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A held lease. Only the arbiter can create one.
#[derive(Debug)]
pub struct Lease {
    record: LeaseRecord,
    version: ObjectVersion,
}

impl Lease {
    pub fn token(&self) -> Uuid {
        self.record.token
    }

    pub fn operation(&self) -> OperationKind {
        self.record.operation
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.record.expires_at
    }
}

/// Tokens of the leases held by operations running in this process.
#[derive(Debug, Clone, Default)]
pub struct HeldLeases {
    tokens: Arc<RwLock<HashSet<Uuid>>>,
}

impl HeldLeases {
    pub async fn tokens(&self) -> Vec<Uuid> {
        self.tokens.read().await.iter().copied().collect()
    }

    pub async fn contains(&self, token: &Uuid) -> bool {
        self.tokens.read().await.contains(token)
    }

    async fn insert(&self, token: Uuid) {
        self.tokens.write().await.insert(token);
    }

    async fn remove(&self, token: &Uuid) {
        self.tokens.write().await.remove(token);
    }
}

pub struct Arbiter {
    gateway: Arc<dyn ObjectGateway>,
    key: String,
    node_id: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn HolderProbe>,
    held: HeldLeases,
}

impl Arbiter {
    pub fn new(
        gateway: Arc<dyn ObjectGateway>,
        key: String,
        node_id: String,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn HolderProbe>,
    ) -> Self {
        Self {
            gateway,
            key,
            node_id,
            ttl,
            clock,
            probe,
            held: HeldLeases::default(),
        }
    }

    pub fn held(&self) -> &HeldLeases {
        &self.held
    }

    /// Try to take the lease for `operation`. Fails fast with `Busy`.
    pub async fn acquire(&self, operation: OperationKind) -> Result<Lease, ArbiterError> {
        let now = self.clock.now();
        let record = LeaseRecord {
            token: Uuid::new_v4(),
            holder: self.node_id.clone(),
            operation,
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        let body = Bytes::from(serde_json::to_vec(&record)?);

        match self.gateway.create(&self.key, body.clone()).await {
            Ok(version) => {
                info!(operation = %operation, token = %record.token, expires_at = %record.expires_at, "Lease acquired");
                return Ok(self.granted(record, version).await);
            }
            Err(StoreError::Conflict { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let (bytes, version) = match self.gateway.get_versioned(&self.key).await {
            Ok(found) => found,
            Err(StoreError::NotFound { .. }) => {
                return Err(ArbiterError::Busy(
                    "lease changed hands during acquisition".into(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let existing = match serde_json::from_slice::<LeaseRecord>(&bytes) {
            Ok(existing) => Some(existing),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Lease record is unreadable; treating it as abandoned");
                None
            }
        };

        if let Some(existing) = &existing {
            // Our own create landed but its response was lost and retried.
            if existing.token == record.token {
                return Ok(self.granted(record, version).await);
            }
            if now < existing.expires_at {
                return Err(ArbiterError::Busy(format!(
                    "{} lease held by {} until {}",
                    existing.operation, existing.holder, existing.expires_at
                )));
            }
            match self.holder_state(existing).await {
                HolderState::Gone => {}
                HolderState::Running => {
                    return Err(ArbiterError::Busy(format!(
                        "{} lease held by {} expired at {} but the holder is still running it",
                        existing.operation, existing.holder, existing.expires_at
                    )))
                }
                HolderState::Unknown => {
                    return Err(ArbiterError::Busy(format!(
                        "{} lease held by {} expired at {} and the holder cannot be confirmed gone",
                        existing.operation, existing.holder, existing.expires_at
                    )))
                }
            }
        }

        match self.gateway.replace(&self.key, body, &version).await {
            Ok(version) => {
                warn!(
                    previous_holder = existing.as_ref().map(|e| e.holder.as_str()).unwrap_or("unknown"),
                    operation = %operation,
                    "Reclaimed abandoned lease"
                );
                Ok(self.granted(record, version).await)
            }
            Err(StoreError::Conflict { .. }) => Err(ArbiterError::Busy(
                "another node reclaimed the abandoned lease first".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn granted(&self, record: LeaseRecord, version: ObjectVersion) -> Lease {
        self.held.insert(record.token).await;
        Lease { record, version }
    }

    async fn holder_state(&self, existing: &LeaseRecord) -> HolderState {
        if self.held.contains(&existing.token).await {
            return HolderState::Running;
        }
        match self.probe.check(existing).await {
            // This process would hold the token; the lease is from an earlier run.
            HolderState::Unknown if existing.holder == self.node_id => HolderState::Gone,
            state => state,
        }
    }

    /// Push the expiry of a held lease forward by one TTL.
    pub async fn renew(&self, lease: &mut Lease) -> Result<(), ArbiterError> {
        let mut record = lease.record.clone();
        record.expires_at = self.clock.now() + self.ttl;
        let body = Bytes::from(serde_json::to_vec(&record)?);

        match self.gateway.replace(&self.key, body, &lease.version).await {
            Ok(version) => {
                debug!(token = %record.token, expires_at = %record.expires_at, "Lease renewed");
                lease.record = record;
                lease.version = version;
                Ok(())
            }
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                Err(ArbiterError::LeaseLost(format!(
                    "lease {} is no longer held by {}",
                    record.token, self.node_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give the lease back. A lease that was already taken over is left alone.
    pub async fn release(&self, lease: Lease) -> Result<(), ArbiterError> {
        self.held.remove(&lease.token()).await;
        match self.current().await? {
            Some(current) if current.token == lease.token() => {
                self.gateway.delete(&self.key).await?;
                info!(operation = %lease.operation(), token = %lease.token(), "Lease released");
            }
            Some(current) => {
                warn!(token = %lease.token(), holder = %current.holder, "Lease was taken over before release");
            }
            None => {
                warn!(token = %lease.token(), "Lease vanished before release");
            }
        }
        Ok(())
    }

    /// The outstanding lease, if any.
    pub async fn current(&self) -> Result<Option<LeaseRecord>, ArbiterError> {
        match self.gateway.get(&self.key).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{ObjectStoreGateway, RetryPolicy};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use object_store::memory::InMemory;
    use probe::PeerProbe;
    use std::collections::HashMap;

    /// Holders listed as running keep their lease; everyone else is gone.
    struct StaticProbe(HashSet<String>);

    #[async_trait]
    impl HolderProbe for StaticProbe {
        async fn check(&self, lease: &LeaseRecord) -> HolderState {
            if self.0.contains(&lease.holder) {
                HolderState::Running
            } else {
                HolderState::Gone
            }
        }
    }

    fn gateway() -> Arc<dyn ObjectGateway> {
        Arc::new(ObjectStoreGateway::new(
            Arc::new(InMemory::new()),
            RetryPolicy::default(),
        ))
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 9, 12, 14, 32, 46).unwrap(),
        ))
    }

    fn arbiter_with(
        gateway: &Arc<dyn ObjectGateway>,
        node: &str,
        clock: &Arc<ManualClock>,
        probe: Arc<dyn HolderProbe>,
    ) -> Arbiter {
        Arbiter::new(
            Arc::clone(gateway),
            "snapshots/.lease".into(),
            node.into(),
            Duration::seconds(60),
            clock.clone(),
            probe,
        )
    }

    fn arbiter(
        gateway: &Arc<dyn ObjectGateway>,
        node: &str,
        clock: &Arc<ManualClock>,
        running: &[&str],
    ) -> Arbiter {
        let probe = StaticProbe(running.iter().map(|s| s.to_string()).collect());
        arbiter_with(gateway, node, clock, Arc::new(probe))
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy_until_release() {
        let gw = gateway();
        let clock = clock();
        let a = arbiter(&gw, "zk-0", &clock, &[]);
        let b = arbiter(&gw, "zk-1", &clock, &[]);

        let lease = a.acquire(OperationKind::Backup).await.unwrap();
        assert!(matches!(
            b.acquire(OperationKind::Restore).await,
            Err(ArbiterError::Busy(_))
        ));
        // same node, different operation: still one lease
        assert!(matches!(
            a.acquire(OperationKind::Restore).await,
            Err(ArbiterError::Busy(_))
        ));

        a.release(lease).await.unwrap();
        let lease = b.acquire(OperationKind::Restore).await.unwrap();
        assert_eq!(lease.operation(), OperationKind::Restore);
        assert_eq!(b.current().await.unwrap().unwrap().holder, "zk-1");
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let gw = gateway();
        let clock = clock();
        let mut handles = Vec::new();
        for i in 0..8 {
            let arbiter = arbiter(&gw, &format!("zk-{i}"), &clock, &[]);
            handles.push(tokio::spawn(async move {
                arbiter.acquire(OperationKind::Backup).await.is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_held_tokens_follow_acquire_and_release() {
        let gw = gateway();
        let clock = clock();
        let a = arbiter(&gw, "zk-0", &clock, &[]);

        let lease = a.acquire(OperationKind::Backup).await.unwrap();
        assert_eq!(a.held().tokens().await, vec![lease.token()]);
        a.release(lease).await.unwrap();
        assert!(a.held().tokens().await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_of_gone_holder_is_reclaimed() {
        let gw = gateway();
        let clock = clock();
        let dead = arbiter(&gw, "zk-0", &clock, &[]);
        let _abandoned = dead.acquire(OperationKind::Backup).await.unwrap();

        let other = arbiter(&gw, "zk-1", &clock, &[]);
        assert!(matches!(
            other.acquire(OperationKind::Backup).await,
            Err(ArbiterError::Busy(_))
        ));

        clock.advance(Duration::seconds(61));
        let lease = other.acquire(OperationKind::Backup).await.unwrap();
        assert_eq!(other.current().await.unwrap().unwrap().token, lease.token());
    }

    #[tokio::test]
    async fn test_expired_lease_of_running_holder_is_kept() {
        let gw = gateway();
        let clock = clock();
        let slow = arbiter(&gw, "zk-0", &clock, &[]);
        let _held = slow.acquire(OperationKind::Restore).await.unwrap();

        clock.advance(Duration::seconds(120));
        let other = arbiter(&gw, "zk-1", &clock, &["zk-0"]);
        assert!(matches!(
            other.acquire(OperationKind::Backup).await,
            Err(ArbiterError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_of_unlisted_peer_is_kept() {
        let gw = gateway();
        let clock = clock();
        let no_peers = || -> Arc<dyn HolderProbe> {
            Arc::new(PeerProbe::new(HashMap::new(), std::time::Duration::from_millis(100)))
        };
        let holder = arbiter_with(&gw, "zk-0", &clock, no_peers());
        let mut lease = holder.acquire(OperationKind::Restore).await.unwrap();

        clock.advance(Duration::seconds(61));
        let other = arbiter_with(&gw, "zk-1", &clock, no_peers());
        assert!(matches!(
            other.acquire(OperationKind::Backup).await,
            Err(ArbiterError::Busy(_))
        ));
        holder.renew(&mut lease).await.unwrap();
        assert_eq!(holder.current().await.unwrap().unwrap().token, lease.token());
    }

    #[tokio::test]
    async fn test_expired_lease_of_own_live_operation_is_kept() {
        let gw = gateway();
        let clock = clock();
        let a = arbiter(&gw, "zk-0", &clock, &[]);
        let lease = a.acquire(OperationKind::Restore).await.unwrap();

        clock.advance(Duration::seconds(61));
        assert!(matches!(
            a.acquire(OperationKind::Backup).await,
            Err(ArbiterError::Busy(_))
        ));
        assert_eq!(a.current().await.unwrap().unwrap().token, lease.token());
    }

    #[tokio::test]
    async fn test_lease_left_by_earlier_run_of_this_node_is_reclaimed() {
        let gw = gateway();
        let clock = clock();
        let no_peers = || -> Arc<dyn HolderProbe> {
            Arc::new(PeerProbe::new(HashMap::new(), std::time::Duration::from_millis(100)))
        };
        let crashed = arbiter_with(&gw, "zk-0", &clock, no_peers());
        let _abandoned = crashed.acquire(OperationKind::Backup).await.unwrap();
        drop(crashed);

        clock.advance(Duration::seconds(61));
        let restarted = arbiter_with(&gw, "zk-0", &clock, no_peers());
        let lease = restarted.acquire(OperationKind::Backup).await.unwrap();
        assert_eq!(restarted.current().await.unwrap().unwrap().token, lease.token());
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let gw = gateway();
        let clock = clock();
        let a = arbiter(&gw, "zk-0", &clock, &[]);
        let mut lease = a.acquire(OperationKind::Backup).await.unwrap();
        let first_expiry = lease.expires_at();

        clock.advance(Duration::seconds(50));
        a.renew(&mut lease).await.unwrap();
        assert_eq!(lease.expires_at(), first_expiry + Duration::seconds(50));

        // past the original expiry, but renewed
        clock.advance(Duration::seconds(30));
        let b = arbiter(&gw, "zk-1", &clock, &[]);
        assert!(matches!(
            b.acquire(OperationKind::Backup).await,
            Err(ArbiterError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_renew_after_takeover_reports_lost_lease() {
        let gw = gateway();
        let clock = clock();
        let a = arbiter(&gw, "zk-0", &clock, &[]);
        let mut stale = a.acquire(OperationKind::Backup).await.unwrap();

        clock.advance(Duration::seconds(61));
        let b = arbiter(&gw, "zk-1", &clock, &[]);
        let taken = b.acquire(OperationKind::Backup).await.unwrap();

        assert!(matches!(
            a.renew(&mut stale).await,
            Err(ArbiterError::LeaseLost(_))
        ));
        // releasing the stale lease must not drop the new holder's lease
        a.release(stale).await.unwrap();
        assert_eq!(b.current().await.unwrap().unwrap().token, taken.token());
    }

    #[tokio::test]
    async fn test_unreadable_lease_record_is_reclaimed() {
        let gw = gateway();
        let clock = clock();
        gw.put("snapshots/.lease", Bytes::from_static(b"garbage"))
            .await
            .unwrap();
        let a = arbiter(&gw, "zk-0", &clock, &[]);
        assert!(a.acquire(OperationKind::Backup).await.is_ok());
    }
}
