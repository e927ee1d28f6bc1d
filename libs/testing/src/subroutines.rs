//! Closure-driven subroutines.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mesh_lifecycle::{ManagedObject, ReconcileContext, StepResult, Subroutine};

type Script<O> = Arc<dyn Fn(&ReconcileContext, &mut O) -> StepResult + Send + Sync>;

/// Shared, ordered log of subroutine invocations.
///
/// Entries look like `"name.process"` or `"name.finalize"`.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// A subroutine whose behavior is supplied by closures.
///
/// Defaults to `Continue` for both `process` and `finalize`.
pub struct ScriptedSubroutine<O> {
    name: String,
    finalizers: Vec<String>,
    process: Script<O>,
    finalize: Script<O>,
    log: CallLog,
}

impl<O: ManagedObject> ScriptedSubroutine<O> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            finalizers: Vec::new(),
            process: Arc::new(|_: &ReconcileContext, _: &mut O| StepResult::ok()),
            finalize: Arc::new(|_: &ReconcileContext, _: &mut O| StepResult::ok()),
            log: CallLog::new(),
        }
    }

    /// Declare a finalizer token owned by this step.
    #[must_use]
    pub fn finalizer(mut self, token: &str) -> Self {
        self.finalizers.push(token.to_string());
        self
    }

    #[must_use]
    pub fn on_process(
        mut self,
        f: impl Fn(&ReconcileContext, &mut O) -> StepResult + Send + Sync + 'static,
    ) -> Self {
        self.process = Arc::new(f);
        self
    }

    #[must_use]
    pub fn on_finalize(
        mut self,
        f: impl Fn(&ReconcileContext, &mut O) -> StepResult + Send + Sync + 'static,
    ) -> Self {
        self.finalize = Arc::new(f);
        self
    }

    /// Record invocations into a shared log.
    #[must_use]
    pub fn log_to(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }

    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

#[async_trait]
impl<O: ManagedObject> Subroutine<O> for ScriptedSubroutine<O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn finalizers(&self, _obj: &O) -> Vec<String> {
        self.finalizers.clone()
    }

    async fn process(&self, ctx: &ReconcileContext, obj: &mut O) -> StepResult {
        self.log.record(format!("{}.process", self.name));
        (self.process)(ctx, obj)
    }

    async fn finalize(&self, ctx: &ReconcileContext, obj: &mut O) -> StepResult {
        self.log.record(format!("{}.finalize", self.name));
        (self.finalize)(ctx, obj)
    }
}
