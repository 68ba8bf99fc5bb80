//! Snapshot metadata index.
//!
//! Records are never stored in a table: the index is derived from the
//! object store by listing. A record is listed only when both its artifact
//! and its completion marker are present, which makes the marker write the
//! commit point of a backup regardless of listing consistency.

pub mod layout;

use crate::store::ObjectGateway;
use crate::utils::errors::StoreError;
use bytes::Bytes;
use futures_util::StreamExt;
use layout::{BackupId, BackupPaths, CompletionMarker, Encoding, RecordObject};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub sequence_marker: u64,
    pub storage_path: String,
    pub state: RecordState,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
}

impl BackupRecord {
    /// In-memory record for a backup that has not been committed yet.
    pub fn pending(paths: &BackupPaths, id: BackupId, sequence_marker: u64) -> Self {
        Self {
            id,
            sequence_marker,
            storage_path: paths.record_dir(&id),
            state: RecordState::Pending,
            size_bytes: 0,
            sha256: None,
            encoding: None,
        }
    }

    fn from_marker(paths: &BackupPaths, marker: CompletionMarker) -> Self {
        Self {
            id: marker.id,
            sequence_marker: marker.sequence_marker,
            storage_path: paths.record_dir(&marker.id),
            state: RecordState::Complete,
            size_bytes: marker.size_bytes,
            sha256: Some(marker.sha256),
            encoding: Some(marker.encoding),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Seen {
    artifact: bool,
    marker: bool,
}

pub struct BackupIndex {
    gateway: Arc<dyn ObjectGateway>,
    paths: BackupPaths,
    max_list_restarts: u32,
}

impl BackupIndex {
    pub fn new(gateway: Arc<dyn ObjectGateway>, paths: BackupPaths) -> Self {
        Self {
            gateway,
            paths,
            max_list_restarts: 5,
        }
    }

    pub fn paths(&self) -> &BackupPaths {
        &self.paths
    }

    /// All complete records, newest first.
    pub async fn list_records(&self) -> Result<Vec<BackupRecord>, StoreError> {
        let mut records = Vec::new();
        for (id, seen) in self.scan().await?.into_iter().rev() {
            if let Some(record) = self.complete_record(&id, seen).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Newest complete record, if any. Older markers are not read.
    pub async fn latest(&self) -> Result<Option<BackupRecord>, StoreError> {
        for (id, seen) in self.scan().await?.into_iter().rev() {
            if let Some(record) = self.complete_record(&id, seen).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn complete_record(&self, id: &BackupId, seen: Seen) -> Result<Option<BackupRecord>, StoreError> {
        if !seen.marker {
            if seen.artifact {
                debug!(id = %id, "Skipping record without completion marker");
            }
            return Ok(None);
        }
        if !seen.artifact {
            debug!(id = %id, "Skipping marker whose artifact is not listed");
            return Ok(None);
        }
        match self.read_marker(id).await {
            Ok(marker) => Ok(Some(BackupRecord::from_marker(&self.paths, marker))),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(StoreError::Permanent(msg)) => {
                warn!(id = %id, error = %msg, "Ignoring unreadable completion marker");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Look up a record that is safe to restore.
    ///
    /// An artifact without a readable marker is an abandoned backup and
    /// resolves to `NotFound`, exactly like an id that was never written.
    pub async fn resolve(&self, id: &BackupId) -> Result<BackupRecord, StoreError> {
        let marker = match self.read_marker(id).await {
            Ok(marker) => marker,
            Err(StoreError::Permanent(msg)) => {
                warn!(id = %id, error = %msg, "Completion marker is unreadable; treating the backup as incomplete");
                return Err(StoreError::NotFound {
                    key: self.paths.marker(id),
                });
            }
            Err(StoreError::NotFound { .. }) => {
                if self.gateway.exists(&self.paths.artifact(id)).await? {
                    warn!(id = %id, "Backup has an artifact but no completion marker; treating as abandoned");
                }
                return Err(StoreError::NotFound {
                    key: self.paths.marker(id),
                });
            }
            Err(e) => return Err(e),
        };
        if !self.gateway.exists(&self.paths.artifact(id)).await? {
            warn!(id = %id, "Completion marker present but artifact missing");
            return Err(StoreError::NotFound {
                key: self.paths.artifact(id),
            });
        }
        Ok(BackupRecord::from_marker(&self.paths, marker))
    }

    /// Write the completion marker. This is the commit point of a backup.
    pub async fn commit(&self, marker: &CompletionMarker) -> Result<BackupRecord, StoreError> {
        let body = serde_json::to_vec(marker).map_err(|e| StoreError::Permanent(e.to_string()))?;
        self.gateway
            .put(&self.paths.marker(&marker.id), Bytes::from(body))
            .await?;
        info!(id = %marker.id, sequence_marker = marker.sequence_marker, "Completion marker written");
        Ok(BackupRecord::from_marker(&self.paths, marker.clone()))
    }

    async fn read_marker(&self, id: &BackupId) -> Result<CompletionMarker, StoreError> {
        let bytes = self.gateway.get(&self.paths.marker(id)).await?;
        let marker: CompletionMarker = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Permanent(format!("corrupt completion marker for {id}: {e}")))?;
        if marker.id != *id {
            return Err(StoreError::Permanent(format!(
                "completion marker under {id} names {}",
                marker.id
            )));
        }
        Ok(marker)
    }

    /// Walk every key under the prefix. A transient failure mid-listing
    /// resumes after the last key seen instead of starting over.
    async fn scan(&self) -> Result<BTreeMap<BackupId, Seen>, StoreError> {
        let mut seen: BTreeMap<BackupId, Seen> = BTreeMap::new();
        let mut last_key: Option<String> = None;
        let mut restarts = 0u32;

        loop {
            let mut stream = self.gateway.list(self.paths.root(), last_key.as_deref());
            let mut failure = None;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(key) => {
                        if let Some((id, object)) = self.paths.parse_key(&key) {
                            let entry = seen.entry(id).or_default();
                            match object {
                                RecordObject::Artifact => entry.artifact = true,
                                RecordObject::Marker => entry.marker = true,
                            }
                        }
                        last_key = Some(key);
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                None => return Ok(seen),
                Some(e) if e.is_transient() && restarts < self.max_list_restarts => {
                    restarts += 1;
                    warn!(error = %e, restarts, after = ?last_key, "Listing interrupted, resuming");
                }
                Some(e) => return Err(e),
            }
        }
    }
}
