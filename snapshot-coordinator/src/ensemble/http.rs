//! Control surface client for the ensemble's supervisor sidecar.

use super::{Artifact, Ensemble, EnsembleStatus};
use crate::utils::errors::EnsembleError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// Header carrying the position a snapshot was cut at.
pub const SEQUENCE_MARKER_HEADER: &str = "x-sequence-marker";

pub struct HttpEnsemble {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEnsemble {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EnsembleError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnsembleError::Protocol(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, EnsembleError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            Err(EnsembleError::Unreachable(format!("{status}: {body}")))
        } else {
            Err(EnsembleError::Rejected(format!("{status}: {body}")))
        }
    }

    async fn post(&self, path: &str) -> Result<(), EnsembleError> {
        debug!(path, "Ensemble control request");
        let resp = self.client.post(self.url(path)).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl Ensemble for HttpEnsemble {
    async fn status(&self) -> Result<EnsembleStatus, EnsembleError> {
        let resp = self.client.get(self.url("/status")).send().await?;
        let status = Self::check(resp).await?.json::<EnsembleStatus>().await?;
        Ok(status)
    }

    async fn snapshot(&self) -> Result<Artifact, EnsembleError> {
        let resp = self.client.post(self.url("/snapshot")).send().await?;
        let resp = Self::check(resp).await?;
        let sequence_marker = resp
            .headers()
            .get(SEQUENCE_MARKER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                EnsembleError::Protocol(format!("snapshot response lacks {SEQUENCE_MARKER_HEADER}"))
            })?;
        let data = resp.bytes().await?;
        Ok(Artifact {
            sequence_marker,
            data,
        })
    }

    async fn drain(&self) -> Result<(), EnsembleError> {
        self.post("/drain").await
    }

    async fn replace_state(&self, data: Bytes) -> Result<(), EnsembleError> {
        let resp = self
            .client
            .put(self.url("/state"))
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn reinitialize(&self, sequence_marker: u64) -> Result<(), EnsembleError> {
        let resp = self
            .client
            .post(self.url("/reinitialize"))
            .json(&serde_json::json!({ "sequence_marker": sequence_marker }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn resume(&self) -> Result<(), EnsembleError> {
        self.post("/resume").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let ensemble = HttpEnsemble::new("http://127.0.0.1:8081/", Duration::from_secs(1)).unwrap();
        assert_eq!(ensemble.url("/status"), "http://127.0.0.1:8081/status");
    }

    #[tokio::test]
    async fn test_unreachable_sidecar() {
        let ensemble = HttpEnsemble::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        assert!(matches!(
            ensemble.status().await,
            Err(EnsembleError::Unreachable(_))
        ));
    }

    #[test]
    fn test_status_defaults() {
        let status: EnsembleStatus =
            serde_json::from_str(r#"{"quorate":true,"sequence_marker":8589934621}"#).unwrap();
        assert!(status.quorate);
        assert_eq!(status.sequence_marker, 8_589_934_621);
        assert!(!status.reconfiguring);
        assert_eq!(status.pending_writes, 0);
    }
}
