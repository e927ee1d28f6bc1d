//! Step outcome algebra.
//!
//! Every subroutine invocation yields a [`StepResult`]. Its [`Outcome`] tag
//! decides whether the chain continues, whether the reconcile returns an
//! error, and which condition transition is applied.
//!
//! | Outcome         | Next step runs | Ready=False | Reconcile error |
//! |-----------------|----------------|-------------|-----------------|
//! | `Continue`      | yes            | no          | no              |
//! | `StopChain`     | no             | no          | no              |
//! | `Skipped`       | yes            | no          | no              |
//! | `ErrorRetry`    | no             | yes         | yes             |
//! | `ErrorContinue` | yes            | yes         | no              |
//! | `ErrorStop`     | no             | yes         | no              |

use std::fmt;
use std::time::Duration;

/// Tag of a [`StepResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Continue,
    StopChain,
    Skipped,
    ErrorRetry,
    ErrorContinue,
    ErrorStop,
}

impl Outcome {
    /// Returns true if the chain proceeds to the next step.
    pub fn continues_chain(&self) -> bool {
        matches!(self, Self::Continue | Self::Skipped | Self::ErrorContinue)
    }

    /// Returns true for the three error outcomes.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ErrorRetry | Self::ErrorContinue | Self::ErrorStop
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::StopChain => "stop_chain",
            Self::Skipped => "skipped",
            Self::ErrorRetry => "error_retry",
            Self::ErrorContinue => "error_continue",
            Self::ErrorStop => "error_stop",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by a step, with its reporting opt-in.
#[derive(Debug)]
pub struct StepError {
    error: anyhow::Error,
    report: bool,
}

impl StepError {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: error.into(),
            report: false,
        }
    }

    /// Whether the step asked for this error to reach the error-reporting sink.
    pub fn should_report(&self) -> bool {
        self.report
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.error
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.error
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

/// Result of one subroutine invocation.
#[derive(Debug)]
pub enum StepResult {
    /// Step succeeded; proceed. A requeue keeps the resource "processing".
    Continue { requeue_after: Option<Duration> },

    /// Step succeeded and asks to end the chain cleanly.
    StopChain {
        reason: String,
        requeue_after: Option<Duration>,
    },

    /// Step had nothing to do.
    Skipped { reason: String },

    /// Transient failure: persist status, return the error to the host.
    ErrorRetry {
        error: StepError,
        requeue_after: Option<Duration>,
    },

    /// Non-retryable failure; later steps still run.
    ErrorContinue { error: StepError },

    /// Non-retryable failure that ends the chain.
    ErrorStop { error: StepError, reason: String },
}

impl StepResult {
    pub fn ok() -> Self {
        Self::Continue {
            requeue_after: None,
        }
    }

    /// Succeed, but come back after `after`.
    pub fn requeue(after: Duration) -> Self {
        Self::Continue {
            requeue_after: Some(after),
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self::StopChain {
            reason: reason.into(),
            requeue_after: None,
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn retry(error: impl Into<anyhow::Error>) -> Self {
        Self::ErrorRetry {
            error: StepError::new(error),
            requeue_after: None,
        }
    }

    pub fn retry_after(error: impl Into<anyhow::Error>, after: Duration) -> Self {
        Self::ErrorRetry {
            error: StepError::new(error),
            requeue_after: Some(after),
        }
    }

    pub fn fail(error: impl Into<anyhow::Error>) -> Self {
        Self::ErrorContinue {
            error: StepError::new(error),
        }
    }

    pub fn stop_with_error(error: impl Into<anyhow::Error>, reason: impl Into<String>) -> Self {
        Self::ErrorStop {
            error: StepError::new(error),
            reason: reason.into(),
        }
    }

    /// Opt the carried error into error reporting. No-op for successes.
    #[must_use]
    pub fn reported(mut self) -> Self {
        match &mut self {
            Self::ErrorRetry { error, .. }
            | Self::ErrorContinue { error }
            | Self::ErrorStop { error, .. } => error.report = true,
            _ => {}
        }
        self
    }

    /// Attach a requeue delay. Ignored by outcomes that never requeue.
    #[must_use]
    pub fn with_requeue(mut self, after: Duration) -> Self {
        match &mut self {
            Self::Continue { requeue_after }
            | Self::StopChain { requeue_after, .. }
            | Self::ErrorRetry { requeue_after, .. } => *requeue_after = Some(after),
            _ => {}
        }
        self
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Continue { .. } => Outcome::Continue,
            Self::StopChain { .. } => Outcome::StopChain,
            Self::Skipped { .. } => Outcome::Skipped,
            Self::ErrorRetry { .. } => Outcome::ErrorRetry,
            Self::ErrorContinue { .. } => Outcome::ErrorContinue,
            Self::ErrorStop { .. } => Outcome::ErrorStop,
        }
    }

    /// Requested requeue delay, zero when none.
    pub fn requeue_after(&self) -> Duration {
        match self {
            Self::Continue { requeue_after }
            | Self::StopChain { requeue_after, .. }
            | Self::ErrorRetry { requeue_after, .. } => requeue_after.unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    pub fn error(&self) -> Option<&StepError> {
        match self {
            Self::ErrorRetry { error, .. }
            | Self::ErrorContinue { error }
            | Self::ErrorStop { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn into_error(self) -> Option<StepError> {
        match self {
            Self::ErrorRetry { error, .. }
            | Self::ErrorContinue { error }
            | Self::ErrorStop { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::StopChain { reason, .. }
            | Self::Skipped { reason }
            | Self::ErrorStop { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Controller result returned by legacy subroutines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requeue {
    /// Zero means "do not requeue".
    pub after: Duration,
}

impl Requeue {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(after: Duration) -> Self {
        Self { after }
    }
}

/// Error returned by legacy subroutines and by the prepare hook.
#[derive(Debug)]
pub struct OperatorError {
    pub error: anyhow::Error,
    pub retry: bool,
    pub sentry: bool,
}

impl OperatorError {
    pub fn new(error: impl Into<anyhow::Error>, retry: bool, sentry: bool) -> Self {
        Self {
            error: error.into(),
            retry,
            sentry,
        }
    }

    /// Retryable, not reported.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::new(error, true, false)
    }

    /// Not retryable, not reported.
    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::new(error, false, false)
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl From<Result<Requeue, OperatorError>> for StepResult {
    fn from(value: Result<Requeue, OperatorError>) -> Self {
        match value {
            Err(OperatorError {
                error,
                retry,
                sentry,
            }) => {
                let lifted = if retry {
                    StepResult::retry(error)
                } else {
                    StepResult::fail(error)
                };
                if sentry {
                    lifted.reported()
                } else {
                    lifted
                }
            }
            Ok(requeue) if !requeue.after.is_zero() => StepResult::requeue(requeue.after),
            Ok(_) => StepResult::ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factories_map_to_outcomes() {
        assert_eq!(StepResult::ok().outcome(), Outcome::Continue);
        assert_eq!(StepResult::stop("done").outcome(), Outcome::StopChain);
        assert_eq!(StepResult::skip("n/a").outcome(), Outcome::Skipped);
        assert_eq!(
            StepResult::retry(anyhow::anyhow!("e")).outcome(),
            Outcome::ErrorRetry
        );
        assert_eq!(
            StepResult::fail(anyhow::anyhow!("e")).outcome(),
            Outcome::ErrorContinue
        );
        assert_eq!(
            StepResult::stop_with_error(anyhow::anyhow!("e"), "halt").outcome(),
            Outcome::ErrorStop
        );
    }

    #[test]
    fn test_outcome_chain_rules() {
        assert!(Outcome::Continue.continues_chain());
        assert!(Outcome::Skipped.continues_chain());
        assert!(Outcome::ErrorContinue.continues_chain());
        assert!(!Outcome::StopChain.continues_chain());
        assert!(!Outcome::ErrorRetry.continues_chain());
        assert!(!Outcome::ErrorStop.continues_chain());

        assert!(!Outcome::StopChain.is_error());
        assert!(Outcome::ErrorStop.is_error());
    }

    #[test]
    fn test_requeue_projection() {
        assert_eq!(StepResult::ok().requeue_after(), Duration::ZERO);
        assert_eq!(
            StepResult::requeue(Duration::from_secs(3)).requeue_after(),
            Duration::from_secs(3)
        );
        assert_eq!(
            StepResult::stop("x")
                .with_requeue(Duration::from_secs(9))
                .requeue_after(),
            Duration::from_secs(9)
        );
        assert_eq!(
            StepResult::fail(anyhow::anyhow!("e"))
                .with_requeue(Duration::from_secs(9))
                .requeue_after(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_reported_flag() {
        let result = StepResult::fail(anyhow::anyhow!("e"));
        assert!(!result.error().unwrap().should_report());

        let result = result.reported();
        assert!(result.error().unwrap().should_report());

        // no error to flag
        assert!(StepResult::ok().reported().error().is_none());
    }

    #[test]
    fn test_reason_projection() {
        assert_eq!(StepResult::skip("no finalizer").reason(), Some("no finalizer"));
        assert_eq!(StepResult::ok().reason(), None);
    }

    #[test]
    fn test_lift_legacy_results() {
        let lifted: StepResult = Err(OperatorError::transient(anyhow::anyhow!("e"))).into();
        assert_eq!(lifted.outcome(), Outcome::ErrorRetry);

        let lifted: StepResult = Err(OperatorError::new(anyhow::anyhow!("e"), false, true)).into();
        assert_eq!(lifted.outcome(), Outcome::ErrorContinue);
        assert!(lifted.error().unwrap().should_report());

        let lifted: StepResult = Ok(Requeue::after(Duration::from_secs(10))).into();
        assert_eq!(lifted.outcome(), Outcome::Continue);
        assert_eq!(lifted.requeue_after(), Duration::from_secs(10));

        let lifted: StepResult = Ok(Requeue::none()).into();
        assert_eq!(lifted.outcome(), Outcome::Continue);
        assert_eq!(lifted.requeue_after(), Duration::ZERO);
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = anyhow::anyhow!("inner").context("outer");
        let result = StepResult::fail(err);
        assert_eq!(result.error().unwrap().to_string(), "outer: inner");
    }
}
