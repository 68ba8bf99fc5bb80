//! Tracking of operations running on this node, so they can be cancelled.

use crate::arbiter::OperationKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Running operations and their cancellation tokens
#[derive(Clone, Default)]
pub struct OperationTracker {
    operations: Arc<RwLock<HashMap<Uuid, (OperationKind, CancellationToken)>>>,
    closed: Arc<AtomicBool>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation and hand back its id and token.
    /// `None` once the tracker is closed.
    pub async fn register(&self, kind: OperationKind) -> Option<(Uuid, CancellationToken)> {
        let mut operations = self.operations.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        operations.insert(id, (kind, token.clone()));
        Some((id, token))
    }

    /// Refuse further registrations. Running operations are unaffected.
    pub async fn close(&self) {
        let _operations = self.operations.write().await;
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Remove an operation once it has finished
    pub async fn complete(&self, id: &Uuid) {
        let mut operations = self.operations.write().await;
        operations.remove(id);
    }

    /// Request cancellation of everything running. Operations past their
    /// cancellable phases ignore the request. Returns how many were signalled.
    pub async fn cancel_all(&self) -> usize {
        let operations = self.operations.read().await;
        for (kind, token) in operations.values() {
            tracing::info!(operation = %kind, "Cancellation requested");
            token.cancel();
        }
        operations.len()
    }

    pub async fn running(&self) -> Vec<OperationKind> {
        let operations = self.operations.read().await;
        operations.values().map(|(kind, _)| *kind).collect()
    }

    pub async fn running_count(&self) -> usize {
        let operations = self.operations.read().await;
        operations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_cancel_complete() {
        let tracker = OperationTracker::new();
        let (id, token) = tracker.register(OperationKind::Backup).await.unwrap();
        assert_eq!(tracker.running_count().await, 1);
        assert_eq!(tracker.running().await, vec![OperationKind::Backup]);

        assert_eq!(tracker.cancel_all().await, 1);
        assert!(token.is_cancelled());

        tracker.complete(&id).await;
        assert_eq!(tracker.running_count().await, 0);
        assert_eq!(tracker.cancel_all().await, 0);
    }

    #[tokio::test]
    async fn test_closed_tracker_refuses_new_operations() {
        let tracker = OperationTracker::new();
        let (id, _) = tracker.register(OperationKind::Restore).await.unwrap();
        tracker.close().await;

        assert!(tracker.register(OperationKind::Backup).await.is_none());
        assert_eq!(tracker.running().await, vec![OperationKind::Restore]);
        tracker.complete(&id).await;
        assert_eq!(tracker.running_count().await, 0);
    }
}
