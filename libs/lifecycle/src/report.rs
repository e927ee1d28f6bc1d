//! Error reporting sink.
//!
//! Step errors only reach the sink when the step opted in and the
//! [`ReportPolicy`] allows it. Errors caused by a terminating namespace are
//! never reported, since waiting resolves them.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tracing::error;

use crate::error::ReconcileError;
use crate::store::StoreError;

/// Destination for reportable errors (e.g. an error-tracking service).
pub trait ErrorReporter: Send + Sync {
    fn capture_error(
        &self,
        err: &anyhow::Error,
        tags: &BTreeMap<String, String>,
        extras: &BTreeMap<String, serde_json::Value>,
    );
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn capture_error(
        &self,
        _err: &anyhow::Error,
        _tags: &BTreeMap<String, String>,
        _extras: &BTreeMap<String, serde_json::Value>,
    ) {
    }
}

/// Emits reported errors as `error` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture_error(
        &self,
        err: &anyhow::Error,
        tags: &BTreeMap<String, String>,
        extras: &BTreeMap<String, serde_json::Value>,
    ) {
        error!(error = %format!("{err:#}"), ?tags, ?extras, "Reported error");
    }
}

/// When opted-in step errors are forwarded to the reporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportPolicy {
    /// Every opted-in error.
    Always,

    /// Only when `generation` differs from the observed generation, so a
    /// steady-state failure does not alert on every retry.
    #[default]
    OnGenerationChange,

    /// Nothing is reported.
    Never,
}

impl ReportPolicy {
    /// `observed_generation` is `None` when the object does not track one;
    /// that counts as changed.
    pub fn allows(&self, generation: i64, observed_generation: Option<i64>) -> bool {
        match self {
            Self::Always => true,
            Self::OnGenerationChange => observed_generation != Some(generation),
            Self::Never => false,
        }
    }
}

/// Returns false for errors caused by a terminating namespace.
pub fn should_report(err: &anyhow::Error) -> bool {
    !err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::NamespaceTerminating(_))
        ) || matches!(
            cause.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::Store(StoreError::NamespaceTerminating(_)))
        )
    })
}

/// Forward `err` to `reporter` if the filter lets it through.
///
/// Returns true if the error was captured.
pub fn capture(
    reporter: &dyn ErrorReporter,
    err: &anyhow::Error,
    tags: &BTreeMap<String, String>,
    extras: &BTreeMap<String, serde_json::Value>,
) -> bool {
    if !should_report(err) {
        return false;
    }
    reporter.capture_error(err, tags, extras);
    true
}

/// Run a host-driven future, turning a panic into [`ReconcileError::Panicked`].
///
/// The panic is reported before it is converted.
pub async fn recover_panic<F, T>(
    reporter: &dyn ErrorReporter,
    tags: BTreeMap<String, String>,
    fut: F,
) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, ReconcileError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());

            error!(panic = %message, "Recovered panic in reconcile");
            let err = anyhow::anyhow!("panic: {message}");
            reporter.capture_error(&err, &tags, &BTreeMap::new());
            Err(ReconcileError::Panicked(message))
        }
    }
}
