//! The reconcile driver.
//!
//! One call to [`LifecycleManager::reconcile`] runs the state machine for a
//! single work item:
//!
//! 1. Fetch the object (not found ends the reconcile successfully)
//! 2. Snapshot it; the snapshot is the base for patches and status diffing
//! 3. Park it if spread is enabled and nothing requires a reconcile
//! 4. Add missing finalizers
//! 5. Seed `Ready=Unknown`, run the prepare hook
//! 6. Run the chain: forward for live objects, reversed during deletion
//! 7. Decide `Ready`, stamp spread fields, write status if it changed
//! 8. Drop the refresh label
//!
//! The smallest positive requeue requested by any step is returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::conditions::{ConditionManager, Readiness, CONDITION_READY};
use crate::context::ReconcileContext;
use crate::error::{ConfigError, ReconcileError};
use crate::finalizers::FinalizerManager;
use crate::object::{ConditionsHolder, ManagedObject, ObjectKey, ObjectMeta};
use crate::report::{self, ErrorReporter, NoopReporter, ReportPolicy};
use crate::result::{Outcome, StepError, StepResult};
use crate::spread::{JitterSource, SpreadConfig, SpreadScheduler, ThreadRngJitter};
use crate::store::{ObjectStore, StoreError};
use crate::subroutine::{PrepareContext, Simple, SimpleSubroutine, Subroutine};
use crate::REFRESH_LABEL;

/// Reason recorded for steps skipped during deletion.
pub const SKIP_NO_FINALIZER: &str = "no finalizer";

/// Drives objects of type `O` through the subroutine chain.
pub struct LifecycleManager<O: ManagedObject> {
    operator: String,
    controller: String,
    store: Arc<dyn ObjectStore<O>>,
    subroutines: Vec<Arc<dyn Subroutine<O>>>,
    conditions: Option<ConditionManager>,
    spread: Option<SpreadScheduler>,
    prepare: Option<Arc<dyn PrepareContext<O>>>,
    reporter: Arc<dyn ErrorReporter>,
    report_policy: ReportPolicy,
    finalizers: FinalizerManager,
    read_only: bool,
    track_last_reconcile: bool,
}

/// Mutable state of one reconcile.
struct Run<O> {
    obj: O,
    snapshot: O,
    now: DateTime<Utc>,
    requeue_after: Duration,
    has_error: bool,
}

impl<O: ManagedObject> LifecycleManager<O> {
    /// Start configuring a manager.
    pub fn builder(
        operator: impl Into<String>,
        controller: impl Into<String>,
        store: Arc<dyn ObjectStore<O>>,
    ) -> LifecycleManagerBuilder<O> {
        LifecycleManagerBuilder::new(operator, controller, store)
    }

    /// Operator name used in span names and error tags.
    pub fn operator(&self) -> &str {
        &self.operator
    }

    /// Controller name used in error tags.
    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Whether status writes and patches are suppressed.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Names of the configured subroutines, in declaration order.
    pub fn subroutine_names(&self) -> Vec<&str> {
        self.subroutines.iter().map(|s| s.name()).collect()
    }

    /// Reconcile one work item.
    ///
    /// Returns the requeue delay (zero for none). Errors are meant to be
    /// requeued by the host through its rate limiter.
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        cancel: CancellationToken,
    ) -> Result<Duration, ReconcileError> {
        let ctx = ReconcileContext::new(&self.operator, &self.controller, key.clone(), cancel);
        let span = info_span!(
            "reconcile",
            otel.name = %format!("{}.Reconcile", self.operator),
            operator = %self.operator,
            controller = %self.controller,
            kind = O::KIND,
            key = %key,
            request_id = %ctx.request_id(),
        );
        let ctx = ctx.with_span(span.clone());

        self.reconcile_inner(ctx).instrument(span).await
    }

    async fn reconcile_inner(&self, ctx: ReconcileContext) -> Result<Duration, ReconcileError> {
        let key = ctx.key().clone();
        trace!("Starting reconcile");

        let obj = match ctx.run_cancellable(self.store.get(&key)).await {
            None => return Err(ReconcileError::Cancelled),
            Some(Ok(obj)) => obj,
            Some(Err(err)) if err.is_not_found() => {
                debug!("Object not found, nothing to reconcile");
                return Ok(Duration::ZERO);
            }
            Some(Err(err)) => {
                error!(error = %err, "Failed to fetch object");
                self.report_store_error(&err, None, &key);
                return Err(err.into());
            }
        };

        self.check_capabilities(&obj)?;

        let mut run = Run {
            snapshot: obj.clone(),
            obj,
            now: Utc::now(),
            requeue_after: Duration::ZERO,
            has_error: false,
        };
        let deleting = run.obj.metadata().is_deleting();

        if !deleting {
            if let Some(parked) = self.parked_for(&run) {
                debug!(requeue_after = ?parked, "Object up to date, parking until next reconcile");
                return Ok(parked);
            }
        }

        let added = ctx
            .run_cancellable(self.finalizers.add_all_if_needed(
                self.store.as_ref(),
                &mut run.obj,
                &mut run.snapshot,
                &self.subroutines,
            ))
            .await
            .ok_or(ReconcileError::Cancelled)?;
        if let Err(err) = added {
            error!(error = %err, "Failed to add finalizers");
            self.report_store_error(&err, Some(&run.snapshot), &key);
            return Err(err.into());
        }

        self.with_conditions(&mut run.obj, |manager, holder, meta| {
            manager.seed_ready(holder, meta);
        });

        let ctx = match &self.prepare {
            None => ctx,
            Some(hook) => {
                let prepared = ctx
                    .run_cancellable(hook.prepare(ctx.clone(), &run.obj))
                    .await
                    .ok_or(ReconcileError::Cancelled)?;
                match prepared {
                    Ok(prepared) => prepared,
                    Err(err) => {
                        if err.sentry {
                            self.report(&err.error, &run.snapshot, None);
                        }
                        if err.retry {
                            error!(error = %err, "Failed to prepare context");
                            return Err(ReconcileError::Prepare(err.error));
                        }
                        warn!(error = %err, "Failed to prepare context, not retrying");
                        return Ok(Duration::ZERO);
                    }
                }
            }
        };

        let order: Vec<&Arc<dyn Subroutine<O>>> = if deleting {
            self.subroutines.iter().rev().collect()
        } else {
            self.subroutines.iter().collect()
        };

        for step in order {
            let name = step.name().to_string();

            self.with_conditions(&mut run.obj, |manager, holder, meta| {
                manager.seed_step(holder, meta, &name);
            });

            let (result, finalized) = ctx
                .run_cancellable(self.run_step(&ctx, step.as_ref(), &mut run.obj))
                .await
                .ok_or_else(|| {
                    warn!(subroutine = %name, "Reconcile cancelled, status not written");
                    ReconcileError::Cancelled
                })?;

            run.requeue_after = min_positive(run.requeue_after, result.requeue_after());

            self.with_conditions(&mut run.obj, |manager, holder, meta| {
                manager.apply_step_result(holder, meta, &name, &result);
            });

            if let Some(err) = result.error() {
                self.report_step_error(&name, err, &run.snapshot);
            }

            let outcome = result.outcome();
            if finalized && !outcome.is_error() && result.requeue_after().is_zero() {
                let removed = ctx
                    .run_cancellable(self.finalizers.remove_for_step(
                        self.store.as_ref(),
                        &mut run.obj,
                        &mut run.snapshot,
                        step.as_ref(),
                    ))
                    .await
                    .ok_or(ReconcileError::Cancelled)?;
                if let Err(err) = removed {
                    error!(subroutine = %name, error = %err, "Failed to remove finalizers");
                    self.report_store_error(&err, Some(&run.snapshot), &key);
                    return Err(err.into());
                }
            }

            match outcome {
                Outcome::Continue | Outcome::Skipped => {}
                Outcome::StopChain => {
                    debug!(subroutine = %name, reason = ?result.reason(), "Subroutine stopped the chain");
                    break;
                }
                Outcome::ErrorContinue => {
                    run.has_error = true;
                }
                Outcome::ErrorStop => {
                    run.has_error = true;
                    debug!(subroutine = %name, reason = ?result.reason(), "Subroutine error stopped the chain");
                    break;
                }
                Outcome::ErrorRetry => {
                    let requeue_after = result.requeue_after();
                    let source = result
                        .into_error()
                        .map_or_else(|| anyhow::anyhow!("retry requested"), StepError::into_inner);
                    return self.fail_with_retry(&ctx, &mut run, name, requeue_after, source).await;
                }
            }
        }

        let readiness = Readiness::from_run(run.requeue_after, run.has_error);
        self.with_conditions(&mut run.obj, |manager, holder, meta| {
            manager.set_ready(holder, meta, readiness);
        });

        if !deleting {
            self.stamp_live_status(&mut run);
        }

        self.persist_status(&ctx, &mut run).await?;

        if !deleting {
            self.clear_refresh_label(&ctx, &mut run).await?;
        }

        info!(
            requeue_after = ?run.requeue_after,
            has_error = run.has_error,
            ready = ?readiness,
            "Reconcile complete"
        );
        Ok(run.requeue_after)
    }

    async fn run_step(
        &self,
        ctx: &ReconcileContext,
        step: &dyn Subroutine<O>,
        obj: &mut O,
    ) -> (StepResult, bool) {
        let span = info_span!(
            parent: ctx.span(),
            "subroutine",
            otel.name = %format!("{}.reconcileSubroutine.{}", self.operator, step.name()),
            subroutine = %step.name(),
        );

        async {
            let (result, finalized) = if obj.metadata().is_deleting() {
                let owned = step
                    .finalizers(obj)
                    .iter()
                    .any(|token| obj.metadata().has_finalizer(token));
                if owned {
                    trace!("Finalizing");
                    (step.finalize(ctx, obj).await, true)
                } else {
                    (StepResult::skip(SKIP_NO_FINALIZER), false)
                }
            } else {
                trace!("Processing");
                (step.process(ctx, obj).await, false)
            };

            match result.error() {
                Some(err) => warn!(
                    outcome = %result.outcome(),
                    error = %err,
                    "Subroutine returned an error"
                ),
                None => debug!(
                    outcome = %result.outcome(),
                    requeue_after = ?result.requeue_after(),
                    reason = ?result.reason(),
                    "Subroutine finished"
                ),
            }

            (result, finalized)
        }
        .instrument(span)
        .await
    }

    /// `ErrorRetry`: mark not ready, persist what we have, hand the error back.
    async fn fail_with_retry(
        &self,
        ctx: &ReconcileContext,
        run: &mut Run<O>,
        subroutine: String,
        requeue_after: Duration,
        source: anyhow::Error,
    ) -> Result<Duration, ReconcileError> {
        self.with_conditions(&mut run.obj, |manager, holder, meta| {
            manager.set_ready(holder, meta, Readiness::NotReady);
        });

        if let Err(err) = self.persist_status(ctx, run).await {
            warn!(error = %err, "Failed to persist status after retryable error");
        }

        error!(subroutine = %subroutine, error = %format!("{source:#}"), "Subroutine requested retry");
        Err(ReconcileError::Subroutine {
            subroutine,
            requeue_after,
            source,
        })
    }

    /// Requeue delay if spread parking applies to this object.
    fn parked_for(&self, run: &Run<O>) -> Option<Duration> {
        let spread = self.spread.as_ref()?;
        let status = run.obj.as_spread()?;
        if spread.reconcile_required(run.obj.metadata(), status, run.now) {
            return None;
        }
        Some(spread.on_next_reconcile(status, run.now))
    }

    fn stamp_live_status(&self, run: &mut Run<O>) {
        let meta = run.obj.metadata().clone();

        if let Some(spread) = &self.spread {
            if let Some(status) = run.obj.as_spread_mut() {
                spread.set_next_reconcile_time(status, run.now);
                spread.update_observed_generation(&meta, status);
            }
        }

        if self.track_last_reconcile {
            if let Some(status) = run.obj.as_rate_limit_status_mut() {
                status.set_last_reconcile_time(run.now);
            }
        }
    }

    /// Write status if it differs from the snapshot.
    async fn persist_status(
        &self,
        ctx: &ReconcileContext,
        run: &mut Run<O>,
    ) -> Result<(), ReconcileError> {
        if self.read_only {
            debug!("Read-only, skipping status update");
            return Ok(());
        }
        if run.obj.status() == run.snapshot.status() {
            debug!("Status unchanged, skipping update");
            return Ok(());
        }

        let updated = ctx
            .run_cancellable(self.store.update_status(&run.obj))
            .await
            .ok_or(ReconcileError::Cancelled)?;

        match updated {
            Ok(stored) => {
                let resource_version = stored.metadata().resource_version.clone();
                run.obj.metadata_mut().resource_version = resource_version.clone();
                run.snapshot.metadata_mut().resource_version = resource_version;
                info!("Status updated");
                Ok(())
            }
            Err(err) if err.is_not_found() && run.obj.metadata().is_deleting() => {
                debug!("Object gone after finalization, skipping status update");
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                warn!(error = %err, "Conflict updating status, requeueing");
                Err(err.into())
            }
            Err(err) => {
                error!(error = %err, "Failed to update status");
                self.report_store_error(&err, Some(&run.snapshot), ctx.key());
                Err(err.into())
            }
        }
    }

    async fn clear_refresh_label(
        &self,
        ctx: &ReconcileContext,
        run: &mut Run<O>,
    ) -> Result<(), ReconcileError> {
        let Some(spread) = &self.spread else {
            return Ok(());
        };
        if self.read_only || !run.snapshot.metadata().labels.contains_key(REFRESH_LABEL) {
            return Ok(());
        }

        let mut modified = run.snapshot.clone();
        spread.remove_refresh_label_if_exists(modified.metadata_mut());
        run.obj.metadata_mut().labels.remove(REFRESH_LABEL);

        let patched = ctx
            .run_cancellable(self.store.patch(&modified, &run.snapshot))
            .await
            .ok_or(ReconcileError::Cancelled)?;

        match patched {
            Ok(_) => {
                debug!(label = REFRESH_LABEL, "Removed refresh label");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Failed to remove refresh label");
                self.report_store_error(&err, Some(&run.snapshot), ctx.key());
                Err(err.into())
            }
        }
    }

    fn check_capabilities(&self, obj: &O) -> Result<(), ReconcileError> {
        let missing = if self.conditions.is_some() && obj.as_conditions().is_none() {
            Some("ConditionsHolder")
        } else if self.spread.is_some() && obj.as_spread().is_none() {
            Some("SpreadStatusHolder")
        } else if self.track_last_reconcile && obj.as_rate_limit_status().is_none() {
            Some("RateLimitStatusHolder")
        } else {
            None
        };

        let Some(capability) = missing else {
            return Ok(());
        };

        let err = ReconcileError::MissingCapability {
            kind: O::KIND,
            capability,
        };
        error!(error = %err, "Lifecycle misconfigured");
        let tags = self.tags(obj.metadata(), None);
        self.reporter
            .capture_error(&anyhow::anyhow!("{err}"), &tags, &BTreeMap::new());
        Err(err)
    }

    fn with_conditions(
        &self,
        obj: &mut O,
        f: impl FnOnce(&ConditionManager, &mut dyn ConditionsHolder, &ObjectMeta),
    ) {
        let Some(manager) = &self.conditions else {
            return;
        };
        let meta = obj.metadata().clone();
        if let Some(holder) = obj.as_conditions_mut() {
            f(manager, holder, &meta);
        }
    }

    fn observed_generation(obj: &O) -> Option<i64> {
        obj.as_spread()
            .map(|s| s.observed_generation())
            .or_else(|| obj.as_rate_limit_status().map(|s| s.observed_generation()))
    }

    fn report_step_error(&self, subroutine: &str, err: &StepError, snapshot: &O) {
        if err.should_report() {
            self.report(err.inner(), snapshot, Some(subroutine));
        }
    }

    fn report(&self, err: &anyhow::Error, snapshot: &O, subroutine: Option<&str>) {
        let meta = snapshot.metadata();
        if !self
            .report_policy
            .allows(meta.generation, Self::observed_generation(snapshot))
        {
            return;
        }

        let tags = self.tags(meta, subroutine);
        let mut extras = BTreeMap::new();
        extras.insert("generation".to_string(), serde_json::json!(meta.generation));
        if report::capture(self.reporter.as_ref(), err, &tags, &extras) {
            debug!("Error forwarded to reporter");
        }
    }

    fn report_store_error(&self, err: &StoreError, snapshot: Option<&O>, key: &ObjectKey) {
        if matches!(err, StoreError::NamespaceTerminating(_)) {
            return;
        }
        let err = anyhow::anyhow!("{err}");
        match snapshot {
            Some(snapshot) => self.report(&err, snapshot, None),
            None => {
                if self.report_policy == ReportPolicy::Never {
                    return;
                }
                let mut tags = BTreeMap::new();
                tags.insert("operator".to_string(), self.operator.clone());
                tags.insert("controller".to_string(), self.controller.clone());
                tags.insert("kind".to_string(), O::KIND.to_string());
                tags.insert("key".to_string(), key.to_string());
                self.reporter.capture_error(&err, &tags, &BTreeMap::new());
            }
        }
    }

    fn tags(&self, meta: &ObjectMeta, subroutine: Option<&str>) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("operator".to_string(), self.operator.clone());
        tags.insert("controller".to_string(), self.controller.clone());
        tags.insert("kind".to_string(), O::KIND.to_string());
        tags.insert("name".to_string(), meta.name.clone());
        if let Some(namespace) = &meta.namespace {
            tags.insert("namespace".to_string(), namespace.clone());
        }
        if let Some(cluster) = &meta.cluster {
            tags.insert("cluster".to_string(), cluster.clone());
        }
        if let Some(subroutine) = subroutine {
            tags.insert("subroutine".to_string(), subroutine.to_string());
        }
        tags
    }
}

/// Smallest positive duration of the two, zero if both are zero.
fn min_positive(current: Duration, candidate: Duration) -> Duration {
    match (current.is_zero(), candidate.is_zero()) {
        (_, true) => current,
        (true, false) => candidate,
        (false, false) => current.min(candidate),
    }
}

/// Configures a [`LifecycleManager`].
pub struct LifecycleManagerBuilder<O: ManagedObject> {
    operator: String,
    controller: String,
    store: Arc<dyn ObjectStore<O>>,
    subroutines: Vec<Arc<dyn Subroutine<O>>>,
    conditions: bool,
    spread: Option<SpreadConfig>,
    jitter: Option<Arc<dyn JitterSource>>,
    prepare: Option<Arc<dyn PrepareContext<O>>>,
    reporter: Option<Arc<dyn ErrorReporter>>,
    report_policy: ReportPolicy,
    read_only: bool,
    track_last_reconcile: bool,
}

impl<O: ManagedObject> LifecycleManagerBuilder<O> {
    fn new(
        operator: impl Into<String>,
        controller: impl Into<String>,
        store: Arc<dyn ObjectStore<O>>,
    ) -> Self {
        Self {
            operator: operator.into(),
            controller: controller.into(),
            store,
            subroutines: Vec::new(),
            conditions: false,
            spread: None,
            jitter: None,
            prepare: None,
            reporter: None,
            report_policy: ReportPolicy::default(),
            read_only: false,
            track_last_reconcile: false,
        }
    }

    /// Append a subroutine to the chain.
    #[must_use]
    pub fn subroutine(mut self, subroutine: impl Subroutine<O> + 'static) -> Self {
        self.subroutines.push(Arc::new(subroutine));
        self
    }

    /// Append a legacy-style subroutine.
    #[must_use]
    pub fn simple_subroutine(self, subroutine: impl SimpleSubroutine<O> + 'static) -> Self {
        self.subroutine(Simple(subroutine))
    }

    /// Append an already shared subroutine.
    #[must_use]
    pub fn shared_subroutine(mut self, subroutine: Arc<dyn Subroutine<O>>) -> Self {
        self.subroutines.push(subroutine);
        self
    }

    /// Maintain `Ready` and per-step conditions.
    #[must_use]
    pub fn conditions(mut self) -> Self {
        self.conditions = true;
        self
    }

    /// Park up-to-date objects with the default 24h budget.
    #[must_use]
    pub fn spread(self) -> Self {
        self.spread_with(SpreadConfig::default())
    }

    #[must_use]
    pub fn spread_with(mut self, config: SpreadConfig) -> Self {
        self.spread = Some(config);
        self
    }

    /// Random source for spread draws.
    #[must_use]
    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    #[must_use]
    pub fn prepare_context(mut self, hook: impl PrepareContext<O> + 'static) -> Self {
        self.prepare = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    #[must_use]
    pub fn report_policy(mut self, policy: ReportPolicy) -> Self {
        self.report_policy = policy;
        self
    }

    /// Issue no writes: no finalizer patches, status updates or label removal.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Stamp `status.lastReconcileTime` on live objects.
    #[must_use]
    pub fn track_last_reconcile(mut self) -> Self {
        self.track_last_reconcile = true;
        self
    }

    pub fn build(self) -> Result<LifecycleManager<O>, ConfigError> {
        if self.operator.trim().is_empty() {
            return Err(ConfigError::EmptyOperatorName);
        }

        let mut names = std::collections::BTreeSet::new();
        for subroutine in &self.subroutines {
            let name = subroutine.name();
            if name.is_empty()
                || name == CONDITION_READY
                || name.chars().any(char::is_whitespace)
            {
                return Err(ConfigError::InvalidSubroutineName(name.to_string()));
            }
            if !names.insert(name) {
                return Err(ConfigError::DuplicateSubroutine(name.to_string()));
            }
        }

        let spread = match self.spread {
            Some(config) => {
                config.validate()?;
                let jitter = self.jitter.unwrap_or_else(|| Arc::new(ThreadRngJitter));
                Some(SpreadScheduler::new(config, jitter))
            }
            None => None,
        };

        Ok(LifecycleManager {
            operator: self.operator,
            controller: self.controller,
            store: self.store,
            subroutines: self.subroutines,
            conditions: self.conditions.then_some(ConditionManager),
            spread,
            prepare: self.prepare,
            reporter: self.reporter.unwrap_or_else(|| Arc::new(NoopReporter)),
            report_policy: self.report_policy,
            finalizers: FinalizerManager::new(self.read_only),
            read_only: self.read_only,
            track_last_reconcile: self.track_last_reconcile,
        })
    }
}
