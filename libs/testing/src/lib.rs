//! Test doubles for `mesh-lifecycle`.
//!
//! - [`InMemoryStore`]: an [`ObjectStore`](mesh_lifecycle::ObjectStore) with
//!   merge-patch semantics, resource versions, call recording and failure
//!   injection
//! - [`TestObject`] / [`PlainObject`]: fixtures with and without status
//!   capabilities
//! - [`ScriptedSubroutine`]: a subroutine driven by closures
//! - [`RecordingReporter`], [`FixedJitter`]: deterministic collaborators

pub mod fixtures;
pub mod reporter;
pub mod store;
pub mod subroutines;

pub use fixtures::{PlainObject, PlainStatus, TestObject, TestStatus};
pub use reporter::{FixedJitter, RecordingReporter, ReportedError};
pub use store::{InMemoryStore, RecordedPatch};
pub use subroutines::{CallLog, ScriptedSubroutine};

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mesh_lifecycle=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
