//! Request-scoped reconcile context.
//!
//! Carries everything a subroutine needs besides the object itself: the
//! tracing span for the reconcile, request identity, tenant and user, the
//! propagated tracing headers, and the cancellation signal.

use std::collections::BTreeMap;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::Span;
use ulid::Ulid;

use crate::object::ObjectKey;

/// Context passed to the prepare hook and to every subroutine.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    operator: String,
    controller: String,
    key: ObjectKey,
    request_id: Ulid,
    tenant: Option<String>,
    user: Option<String>,
    headers: BTreeMap<String, String>,
    span: Span,
    cancel: CancellationToken,
}

impl ReconcileContext {
    /// Context for one reconcile of `key`.
    pub fn new(
        operator: impl Into<String>,
        controller: impl Into<String>,
        key: ObjectKey,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            operator: operator.into(),
            controller: controller.into(),
            key,
            request_id: Ulid::new(),
            tenant: None,
            user: None,
            headers: BTreeMap::new(),
            span: Span::none(),
            cancel,
        }
    }

    /// Operator running this reconcile.
    pub fn operator(&self) -> &str {
        &self.operator
    }

    /// Controller running this reconcile.
    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Key of the object being reconciled.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Unique id of this reconcile attempt.
    pub fn request_id(&self) -> Ulid {
        self.request_id
    }

    /// Tenant set by the prepare hook, if any.
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Acting user set by the prepare hook, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Propagated tracing headers (e.g. `traceparent`).
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Look up one propagated header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Span covering the whole reconcile; child spans hang off it.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Token that aborts this reconcile.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the reconcile has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run `fut` unless the reconcile is cancelled first.
    ///
    /// Returns `None` when cancellation won the race.
    pub async fn run_cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }
}
