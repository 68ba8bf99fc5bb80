//! Checks on the holder of an expired lease.
//!
//! An expired lease is only reclaimed once its holder is confirmed gone. A
//! holder that still reports the lease's token keeps it, and so does one
//! whose state cannot be determined.

use super::LeaseRecord;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderState {
    /// The holder answered and still runs the operation behind the lease.
    Running,
    /// The holder is down, or answered without that lease.
    Gone,
    /// Not a known peer, or its answer could not be read.
    Unknown,
}

#[async_trait]
pub trait HolderProbe: Send + Sync {
    async fn check(&self, lease: &LeaseRecord) -> HolderState;
}

#[derive(Debug, Deserialize)]
struct HealthReport {
    leases: Option<Vec<Uuid>>,
}

/// Asks the holder's operator API `/health` which leases it holds.
pub struct PeerProbe {
    peers: HashMap<String, String>,
    client: reqwest::Client,
}

impl PeerProbe {
    pub fn new(peers: HashMap<String, String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { peers, client }
    }

    // env-sourced peer keys arrive lowercased
    fn base_url(&self, holder: &str) -> Option<&String> {
        self.peers
            .get(holder)
            .or_else(|| self.peers.get(&holder.to_lowercase()))
    }
}

#[async_trait]
impl HolderProbe for PeerProbe {
    async fn check(&self, lease: &LeaseRecord) -> HolderState {
        let holder = lease.holder.as_str();
        let Some(base) = self.base_url(holder) else {
            debug!(holder, "Lease holder is not a known peer");
            return HolderState::Unknown;
        };
        let url = format!("{}/health", base.trim_end_matches('/'));
        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_connect() || e.is_timeout() => {
                debug!(holder, error = %e, "Lease holder does not answer");
                return HolderState::Gone;
            }
            Err(e) => {
                debug!(holder, error = %e, "Lease holder health check failed");
                return HolderState::Unknown;
            }
        };
        if !resp.status().is_success() {
            debug!(holder, status = %resp.status(), "Lease holder is unhealthy");
            return HolderState::Unknown;
        }
        match resp.json::<HealthReport>().await {
            Ok(HealthReport {
                leases: Some(leases),
            }) => {
                if leases.contains(&lease.token) {
                    HolderState::Running
                } else {
                    HolderState::Gone
                }
            }
            Ok(HealthReport { leases: None }) => HolderState::Unknown,
            Err(e) => {
                debug!(holder, error = %e, "Unreadable health report");
                HolderState::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::OperationKind;
    use axum::{routing::get, Json, Router};
    use chrono::Utc;
    use serde_json::{json, Value};

    fn lease(holder: &str, token: Uuid) -> LeaseRecord {
        LeaseRecord {
            token,
            holder: holder.into(),
            operation: OperationKind::Restore,
            acquired_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    /// Serve a fixed `/health` body on an ephemeral port.
    async fn peer(body: Value) -> String {
        let app = Router::new().route("/health", get(move || async move { Json(body) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn probe(holder: &str, url: String) -> PeerProbe {
        let mut peers = HashMap::new();
        peers.insert(holder.to_string(), url);
        PeerProbe::new(peers, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_unknown_holder_cannot_be_confirmed_gone() {
        let probe = PeerProbe::new(HashMap::new(), Duration::from_millis(100));
        assert_eq!(
            probe.check(&lease("zk-9", Uuid::new_v4())).await,
            HolderState::Unknown
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_gone() {
        let probe = probe("zk-1", "http://127.0.0.1:1".into());
        assert_eq!(
            probe.check(&lease("zk-1", Uuid::new_v4())).await,
            HolderState::Gone
        );
    }

    #[tokio::test]
    async fn test_holder_still_running_the_lease() {
        let token = Uuid::new_v4();
        let url = peer(json!({ "status": "ok", "leases": [token] })).await;
        let probe = probe("zk-1", url);
        assert_eq!(probe.check(&lease("zk-1", token)).await, HolderState::Running);
    }

    #[tokio::test]
    async fn test_restarted_holder_without_the_lease_is_gone() {
        let url = peer(json!({ "status": "ok", "leases": [] })).await;
        let probe = probe("zk-1", url);
        assert_eq!(
            probe.check(&lease("zk-1", Uuid::new_v4())).await,
            HolderState::Gone
        );
    }

    #[tokio::test]
    async fn test_health_without_leases_is_unknown() {
        let url = peer(json!({ "status": "ok" })).await;
        let probe = probe("zk-1", url);
        assert_eq!(
            probe.check(&lease("zk-1", Uuid::new_v4())).await,
            HolderState::Unknown
        );
    }

    #[tokio::test]
    async fn test_mixed_case_holder_matches_lowercased_peer() {
        let token = Uuid::new_v4();
        let url = peer(json!({ "leases": [token] })).await;
        let probe = probe("zk-a", url);
        assert_eq!(probe.check(&lease("ZK-A", token)).await, HolderState::Running);
    }
}
