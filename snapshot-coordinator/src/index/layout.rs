//! Object-store layout for ensemble snapshots.
//!
//! ```text
//! {prefix}/
//! ├── .lease                     # single-writer lease record
//! ├── {id}/
//! │   ├── snapshot               # compressed artifact
//! │   └── complete               # completion marker, written last
//! └── {id}/
//!     └── ...
//! ```
//!
//! Backup ids are second-precision UTC timestamps
//! (`2024-09-12T14:32:46Z`), so lexicographic order of the directory names
//! is chronological order.

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const ID_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const ARTIFACT_NAME: &str = "snapshot";
const MARKER_NAME: &str = "complete";
const LEASE_NAME: &str = ".lease";

/// Time-ordered backup identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackupId(DateTime<Utc>);

impl BackupId {
    /// Id for a snapshot cut at `at`. Sub-second precision is dropped.
    pub fn from_instant(at: DateTime<Utc>) -> Self {
        Self(at.trunc_subsecs(0))
    }

    /// Parse the canonical form. Anything else is rejected so that two
    /// spellings can never name the same record.
    pub fn parse(s: &str) -> Result<Self, String> {
        let naive = NaiveDateTime::parse_from_str(s, ID_FORMAT)
            .map_err(|e| format!("invalid backup id {s:?}: {e}"))?;
        let id = Self(Utc.from_utc_datetime(&naive));
        if id.to_string() != s {
            return Err(format!("invalid backup id {s:?}: not in canonical form"));
        }
        Ok(id)
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(ID_FORMAT))
    }
}

impl TryFrom<String> for BackupId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BackupId> for String {
    fn from(id: BackupId) -> Self {
        id.to_string()
    }
}

/// Deterministic key generator. Computes keys only, never performs I/O.
#[derive(Debug, Clone)]
pub struct BackupPaths {
    prefix: String,
}

impl BackupPaths {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Listing prefix covering every record.
    pub fn root(&self) -> &str {
        &self.prefix
    }

    fn join(&self, rest: &str) -> String {
        if self.prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{}", self.prefix, rest)
        }
    }

    pub fn record_dir(&self, id: &BackupId) -> String {
        self.join(&id.to_string())
    }

    pub fn artifact(&self, id: &BackupId) -> String {
        format!("{}/{ARTIFACT_NAME}", self.record_dir(id))
    }

    pub fn marker(&self, id: &BackupId) -> String {
        format!("{}/{MARKER_NAME}", self.record_dir(id))
    }

    pub fn lease(&self) -> String {
        self.join(LEASE_NAME)
    }

    /// Classify a listed key as belonging to a record.
    pub fn parse_key(&self, key: &str) -> Option<(BackupId, RecordObject)> {
        let rest = if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)?.strip_prefix('/')?
        };
        let (id, name) = rest.split_once('/')?;
        let object = match name {
            ARTIFACT_NAME => RecordObject::Artifact,
            MARKER_NAME => RecordObject::Marker,
            _ => return None,
        };
        Some((BackupId::parse(id).ok()?, object))
    }
}

/// The two objects that make up a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordObject {
    Artifact,
    Marker,
}

/// How the artifact bytes are encoded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Zstd,
    Identity,
}

/// Body of the completion marker. Its presence is the only durable signal
/// that a backup is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub id: BackupId,
    pub sequence_marker: u64,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub sha256: String,
    pub encoding: Encoding,
    pub node_id: String,
}
