//! Management-layer leadership.
//!
//! Only the elected leader may run operator verbs. The election itself is
//! external; this module only asks whether this node currently holds it.
//! It is unrelated to the arbiter's lease and to the ensemble's own leader.

use crate::config::LeadershipConfig;
use crate::utils::errors::CoordinatorError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait Leadership: Send + Sync {
    async fn is_leader(&self) -> bool;
}

/// Fixed election result, from configuration.
pub struct StaticLeadership(pub bool);

#[async_trait]
impl Leadership for StaticLeadership {
    async fn is_leader(&self) -> bool {
        self.0
    }
}

/// Leadership published by the election as a file holding the leader's node id.
pub struct FileLeadership {
    path: PathBuf,
    node_id: String,
}

impl FileLeadership {
    pub fn new(path: PathBuf, node_id: String) -> Self {
        Self { path, node_id }
    }
}

#[async_trait]
impl Leadership for FileLeadership {
    async fn is_leader(&self) -> bool {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents.trim() == self.node_id,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Leader file unreadable");
                false
            }
        }
    }
}

pub fn from_config(cfg: &LeadershipConfig, node_id: &str) -> Arc<dyn Leadership> {
    match &cfg.leader_file {
        Some(path) => Arc::new(FileLeadership::new(path.clone(), node_id.to_string())),
        None => Arc::new(StaticLeadership(cfg.leader)),
    }
}

/// Fail with `NotLeader` unless this node holds management leadership.
pub async fn ensure_leader(leadership: &dyn Leadership) -> Result<(), CoordinatorError> {
    if leadership.is_leader().await {
        Ok(())
    } else {
        Err(CoordinatorError::NotLeader)
    }
}
