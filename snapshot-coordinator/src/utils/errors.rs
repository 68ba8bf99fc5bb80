//! Error types for the snapshot coordinator.
//!
//! Each layer has its own enum. Only [`CoordinatorError`] crosses the
//! coordinator boundary; gateway and ensemble errors are folded into it
//! together with the phase they happened in.

use crate::coordinator::phase::Phase;
use thiserror::Error;

/// Appended to every failure raised once a restore has started draining.
pub const INDETERMINATE_GUIDANCE: &str =
    "the ensemble is in an indeterminate state and needs operator attention; no automatic recovery was attempted";

/// Errors from the object store gateway.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Transient object store error: {0}")]
    Transient(String),

    #[error("Object store authentication error: {0}")]
    Auth(String),

    /// A conditional write lost against a concurrent writer.
    #[error("Conditional write lost on {key}")]
    Conflict { key: String },

    #[error("Object store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<object_store::Error> for StoreError {
    fn from(e: object_store::Error) -> Self {
        match &e {
            object_store::Error::NotFound { path, .. } => StoreError::NotFound { key: path.clone() },
            object_store::Error::AlreadyExists { path, .. }
            | object_store::Error::Precondition { path, .. } => {
                StoreError::Conflict { key: path.clone() }
            }
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. } => StoreError::Auth(e.to_string()),
            object_store::Error::Generic { .. } | object_store::Error::JoinError { .. } => {
                StoreError::Transient(e.to_string())
            }
            _ => StoreError::Permanent(e.to_string()),
        }
    }
}

/// Errors from the ensemble control surface.
#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("Ensemble control surface unreachable: {0}")]
    Unreachable(String),

    #[error("Ensemble rejected request: {0}")]
    Rejected(String),

    #[error("Ensemble protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for EnsembleError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            EnsembleError::Unreachable(e.to_string())
        } else {
            EnsembleError::Protocol(e.to_string())
        }
    }
}

/// Errors from the single-writer arbiter.
#[derive(Error, Debug)]
pub enum ArbiterError {
    #[error("{0}")]
    Busy(String),

    /// The lease this node held was reclaimed or overwritten.
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Lease record is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by coordinator operations.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Busy: {0}")]
    Busy(String),

    #[error("Not leader: operator actions run only on the elected management leader")]
    NotLeader,

    #[error("Ensemble not quorate: {0}")]
    NotQuorate(String),

    #[error("Write in flight: {0}")]
    WriteInFlight(String),

    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Failed during {phase}: {reason}")]
    Failed { phase: Phase, reason: String },

    #[error("Cancelled during {0}")]
    Cancelled(Phase),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoordinatorError {
    /// Stable identifier used by the operator surface.
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::Busy(_) => "busy",
            CoordinatorError::NotLeader => "not_leader",
            CoordinatorError::NotQuorate(_) => "not_quorate",
            CoordinatorError::WriteInFlight(_) => "write_in_flight",
            CoordinatorError::TransientIo(_) => "transient_io",
            CoordinatorError::Auth(_) => "auth",
            CoordinatorError::NotFound(_) => "not_found",
            CoordinatorError::Failed { .. } => "failed",
            CoordinatorError::Cancelled(_) => "cancelled",
            CoordinatorError::Config(_) => "config",
        }
    }

    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Busy(_)
                | CoordinatorError::NotQuorate(_)
                | CoordinatorError::WriteInFlight(_)
                | CoordinatorError::TransientIo(_)
        )
    }

    pub(crate) fn failed(phase: Phase, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if phase.is_destructive() {
            CoordinatorError::Failed {
                phase,
                reason: format!("{reason}; {INDETERMINATE_GUIDANCE}"),
            }
        } else {
            CoordinatorError::Failed { phase, reason }
        }
    }

    /// Fold a gateway error into the coordinator taxonomy.
    pub(crate) fn store(phase: Phase, e: StoreError) -> Self {
        if phase.is_destructive() {
            return Self::failed(phase, e.to_string());
        }
        match e {
            StoreError::NotFound { key } => CoordinatorError::NotFound(key),
            StoreError::Transient(msg) => CoordinatorError::TransientIo(msg),
            StoreError::Auth(msg) => CoordinatorError::Auth(msg),
            other @ (StoreError::Conflict { .. } | StoreError::Permanent(_)) => {
                Self::failed(phase, other.to_string())
            }
        }
    }

    /// Fold a control-surface error. Outside the destructive phases an
    /// unreachable ensemble is treated like one without quorum.
    pub(crate) fn ensemble(phase: Phase, e: EnsembleError) -> Self {
        match e {
            EnsembleError::Unreachable(msg) if !phase.is_destructive() => {
                CoordinatorError::NotQuorate(format!("ensemble unreachable: {msg}"))
            }
            other => Self::failed(phase, other.to_string()),
        }
    }

    pub(crate) fn arbiter(phase: Phase, e: ArbiterError) -> Self {
        match e {
            ArbiterError::Busy(msg) => CoordinatorError::Busy(msg),
            ArbiterError::Store(e) => Self::store(phase, e),
            other => Self::failed(phase, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(CoordinatorError::Busy("held".into()).is_retryable());
        assert!(CoordinatorError::WriteInFlight("x".into()).is_retryable());
        assert!(!CoordinatorError::NotFound("x".into()).is_retryable());
        assert!(!CoordinatorError::Auth("denied".into()).is_retryable());
        assert!(!CoordinatorError::NotLeader.is_retryable());
    }

    #[test]
    fn test_destructive_failures_carry_guidance() {
        let err = CoordinatorError::failed(Phase::Replacing, "write refused");
        assert_eq!(err.kind(), "failed");
        assert!(err.to_string().contains("operator attention"));

        let err = CoordinatorError::failed(Phase::Uploading, "bucket gone");
        assert!(!err.to_string().contains("operator attention"));
    }

    #[test]
    fn test_store_errors_fold_by_phase() {
        let err = CoordinatorError::store(Phase::Uploading, StoreError::Transient("reset".into()));
        assert!(matches!(err, CoordinatorError::TransientIo(_)));

        let err = CoordinatorError::store(Phase::Uploading, StoreError::Auth("expired".into()));
        assert!(matches!(err, CoordinatorError::Auth(_)));

        let err = CoordinatorError::store(Phase::Draining, StoreError::Transient("reset".into()));
        assert!(matches!(err, CoordinatorError::Failed { phase: Phase::Draining, .. }));
    }

    #[test]
    fn test_unreachable_ensemble_is_fatal_once_destructive() {
        let err = CoordinatorError::ensemble(
            Phase::Preparing,
            EnsembleError::Unreachable("refused".into()),
        );
        assert!(matches!(err, CoordinatorError::NotQuorate(_)));

        let err = CoordinatorError::ensemble(
            Phase::Reinitializing,
            EnsembleError::Unreachable("refused".into()),
        );
        assert!(matches!(err, CoordinatorError::Failed { phase: Phase::Reinitializing, .. }));
    }

    #[test]
    fn test_object_store_error_mapping() {
        let err: StoreError = object_store::Error::NotFound {
            path: "snapshots/x/complete".into(),
            source: "missing".into(),
        }
        .into();
        assert!(matches!(err, StoreError::NotFound { .. }));

        let err: StoreError = object_store::Error::Generic {
            store: "S3",
            source: "connection reset".into(),
        }
        .into();
        assert!(err.is_transient());
    }
}
