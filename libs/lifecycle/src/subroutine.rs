//! Subroutine contract.
//!
//! A subroutine is one user-supplied unit of reconciliation logic with a
//! `process` entry point for live objects and a `finalize` entry point for
//! objects being deleted. Two styles are supported:
//!
//! - [`Subroutine`]: returns a [`StepResult`] directly
//! - [`SimpleSubroutine`]: legacy style returning `Result<Requeue, OperatorError>`,
//!   lifted into the algebra by the [`Simple`] adapter

use async_trait::async_trait;

use crate::context::ReconcileContext;
use crate::object::ManagedObject;
use crate::result::{OperatorError, Requeue, StepResult};

/// A step in the reconcile chain.
#[async_trait]
pub trait Subroutine<O: ManagedObject>: Send + Sync {
    /// Stable identifier, used in condition types.
    fn name(&self) -> &str;

    /// Finalizer tokens this step owns on `obj`. May be empty.
    fn finalizers(&self, _obj: &O) -> Vec<String> {
        Vec::new()
    }

    /// Invoked while the object is live.
    async fn process(&self, ctx: &ReconcileContext, obj: &mut O) -> StepResult;

    /// Invoked while the object is being deleted and still carries one of
    /// this step's finalizers.
    async fn finalize(&self, _ctx: &ReconcileContext, _obj: &mut O) -> StepResult {
        StepResult::ok()
    }
}

/// Legacy subroutine style.
#[async_trait]
pub trait SimpleSubroutine<O: ManagedObject>: Send + Sync {
    fn name(&self) -> &str;

    fn finalizers(&self, _obj: &O) -> Vec<String> {
        Vec::new()
    }

    async fn process(&self, ctx: &ReconcileContext, obj: &mut O)
        -> Result<Requeue, OperatorError>;

    async fn finalize(
        &self,
        _ctx: &ReconcileContext,
        _obj: &mut O,
    ) -> Result<Requeue, OperatorError> {
        Ok(Requeue::none())
    }
}

/// Adapter lifting a [`SimpleSubroutine`] into a [`Subroutine`].
///
/// - error + retry → `ErrorRetry`
/// - error, no retry → `ErrorContinue`
/// - requeue > 0 → `Continue` with requeue
/// - otherwise → `Continue`
pub struct Simple<S>(pub S);

#[async_trait]
impl<O, S> Subroutine<O> for Simple<S>
where
    O: ManagedObject,
    S: SimpleSubroutine<O>,
{
    fn name(&self) -> &str {
        self.0.name()
    }

    fn finalizers(&self, obj: &O) -> Vec<String> {
        self.0.finalizers(obj)
    }

    async fn process(&self, ctx: &ReconcileContext, obj: &mut O) -> StepResult {
        self.0.process(ctx, obj).await.into()
    }

    async fn finalize(&self, ctx: &ReconcileContext, obj: &mut O) -> StepResult {
        self.0.finalize(ctx, obj).await.into()
    }
}

/// Hook run after finalizers are reconciled and before the chain.
///
/// May enrich the context (tenant, user, headers). A retryable error fails
/// the reconcile; a non-retryable one ends it without requeue.
#[async_trait]
pub trait PrepareContext<O: ManagedObject>: Send + Sync {
    async fn prepare(
        &self,
        ctx: ReconcileContext,
        obj: &O,
    ) -> Result<ReconcileContext, OperatorError>;
}
