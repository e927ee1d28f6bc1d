//! # mesh-lifecycle
//!
//! Reconciliation lifecycle engine for platform-mesh controllers.
//!
//! Given a desired-state object and an ordered chain of subroutines, the
//! engine drives the object through:
//!
//! ```text
//! fetch → snapshot → finalizers → prepare → process/finalize chain
//!       → Ready condition → status update → refresh label cleanup
//! ```
//!
//! ## Modules
//!
//! - `object`: object metadata, work-item keys and capability traits
//! - `store`: the object store contract the engine talks to
//! - `result`: the step outcome algebra (`StepResult`)
//! - `subroutine`: user-supplied steps, including the legacy adapter
//! - `finalizers`, `conditions`, `spread`: per-concern managers
//! - `ratelimit`: static-then-exponential requeue delays for the host
//! - `lifecycle`: the reconcile driver composing all of the above
//!
//! ## Invariants
//!
//! - The engine only writes `status`, `metadata.finalizers` and the refresh label
//! - Status is written at most once per reconcile, and only when it changed
//! - Steps run strictly sequentially; deletion runs them in reverse

pub mod conditions;
pub mod context;
pub mod error;
pub mod finalizers;
pub mod lifecycle;
pub mod logging;
pub mod object;
pub mod patch;
pub mod ratelimit;
pub mod report;
pub mod result;
pub mod spread;
pub mod store;
pub mod subroutine;

pub use conditions::{Condition, ConditionStatus};
pub use context::ReconcileContext;
pub use error::{ConfigError, ReconcileError};
pub use lifecycle::{LifecycleManager, LifecycleManagerBuilder};
pub use object::{
    ConditionsHolder, ManagedObject, ObjectKey, ObjectMeta, RateLimitStatusHolder,
    SpreadStatusHolder,
};
pub use ratelimit::{RateLimiterConfig, StaticThenExponentialRateLimiter};
pub use report::{ErrorReporter, NoopReporter, ReportPolicy, TracingReporter};
pub use result::{OperatorError, Outcome, Requeue, StepError, StepResult};
pub use store::{ObjectStore, StoreError};
pub use subroutine::{PrepareContext, Simple, SimpleSubroutine, Subroutine};

/// Label that forces a reconcile of an otherwise parked object.
pub const REFRESH_LABEL: &str = "platform-mesh.io/refresh-reconcile";
