//! Error types for the lifecycle engine.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Errors returned from a reconcile.
///
/// Every variant is handed back to the host, which requeues the work item
/// through its rate limiter.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Fetch, patch or status update failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A subroutine returned `ErrorRetry`.
    #[error("subroutine {subroutine} failed: {source:#}")]
    Subroutine {
        subroutine: String,
        requeue_after: Duration,
        #[source]
        source: anyhow::Error,
    },

    /// The prepare hook failed with a retryable error.
    #[error("prepare context failed: {0:#}")]
    Prepare(#[source] anyhow::Error),

    /// The engine is configured for a capability the object lacks.
    #[error("{kind} does not implement {capability}, required by the lifecycle configuration")]
    MissingCapability {
        kind: &'static str,
        capability: &'static str,
    },

    /// The caller cancelled the reconcile.
    #[error("reconcile cancelled")]
    Cancelled,

    /// The reconcile future panicked.
    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Requeue requested alongside the error, zero if none.
    pub fn requeue_after(&self) -> Duration {
        match self {
            Self::Subroutine { requeue_after, .. } => *requeue_after,
            _ => Duration::ZERO,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_conflict())
    }
}

/// Invalid engine or rate limiter configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("operator name cannot be empty")]
    EmptyOperatorName,

    #[error("duplicate subroutine name: {0}")]
    DuplicateSubroutine(String),

    #[error("invalid subroutine name {0:?}")]
    InvalidSubroutineName(String),

    #[error("invalid rate limiter configuration: {0}")]
    RateLimiter(String),

    #[error("invalid spread configuration: {0}")]
    Spread(String),
}
