//! Conditions bookkeeping.
//!
//! The engine maintains one primary `Ready` condition and one condition per
//! subroutine (`<name>_Ready` while processing, `<name>_Finalize` while the
//! object is being deleted). Conditions of any other type are left untouched.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::{ConditionsHolder, ObjectMeta};
use crate::result::{Outcome, StepResult};

/// Type of the primary condition.
pub const CONDITION_READY: &str = "Ready";

pub const REASON_COMPLETE: &str = "Complete";
pub const REASON_PROCESSING: &str = "Processing";
pub const REASON_ERROR: &str = "Error";

pub const MESSAGE_RESOURCE_READY: &str = "The resource is ready";
pub const MESSAGE_RESOURCE_NOT_READY: &str = "The resource is not ready";
pub const MESSAGE_RESOURCE_PROCESSING: &str = "The resource is processing";

const STEP_KIND_PROCESS: &str = "subroutine";
const STEP_KIND_FINALIZE: &str = "subroutine finalization";

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A named status record describing one facet of the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    pub reason: String,

    pub message: String,

    pub last_transition_time: DateTime<Utc>,

    #[serde(default)]
    pub observed_generation: i64,
}

impl Condition {
    /// Build a condition stamped with the current time.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation,
        }
    }
}

/// Find a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Returns true if the condition exists and is `True`.
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Remove a condition by type. Returns true if it was present.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

/// Insert or update a condition in place.
///
/// `last_transition_time` only moves when the status changes. Returns true
/// if anything about the list changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) else {
        conditions.push(new);
        return true;
    };

    let mut changed = false;
    if existing.status != new.status {
        existing.status = new.status;
        existing.last_transition_time = new.last_transition_time;
        changed = true;
    }
    if existing.reason != new.reason {
        existing.reason = new.reason;
        changed = true;
    }
    if existing.message != new.message {
        existing.message = new.message;
        changed = true;
    }
    if existing.observed_generation != new.observed_generation {
        existing.observed_generation = new.observed_generation;
        changed = true;
    }
    changed
}

/// Condition type for a step, depending on the lifecycle phase.
pub fn step_condition_type(step_name: &str, deleting: bool) -> String {
    if deleting {
        format!("{step_name}_Finalize")
    } else {
        format!("{step_name}_Ready")
    }
}

/// Final state of the `Ready` condition after a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Processing,
    NotReady,
}

impl Readiness {
    /// Fold the chain outcome into a readiness verdict.
    pub fn from_run(requeue_after: std::time::Duration, has_error: bool) -> Self {
        if !requeue_after.is_zero() {
            Self::Processing
        } else if has_error {
            Self::NotReady
        } else {
            Self::Ready
        }
    }

    fn status(self) -> ConditionStatus {
        match self {
            Self::Ready => ConditionStatus::True,
            Self::Processing | Self::NotReady => ConditionStatus::False,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Self::Ready => MESSAGE_RESOURCE_READY,
            Self::Processing => MESSAGE_RESOURCE_PROCESSING,
            Self::NotReady => MESSAGE_RESOURCE_NOT_READY,
        }
    }
}

/// Applies the engine's condition transitions to a [`ConditionsHolder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionManager;

impl ConditionManager {
    /// Seed `Ready=Unknown` if the object has no `Ready` condition yet.
    pub fn seed_ready(&self, holder: &mut dyn ConditionsHolder, meta: &ObjectMeta) {
        Self::seed(
            holder,
            meta,
            CONDITION_READY,
            REASON_COMPLETE,
            MESSAGE_RESOURCE_PROCESSING,
        );
    }

    /// Seed the per-step condition with `Unknown` if it is missing.
    pub fn seed_step(
        &self,
        holder: &mut dyn ConditionsHolder,
        meta: &ObjectMeta,
        step_name: &str,
    ) {
        let deleting = meta.is_deleting();
        let type_ = step_condition_type(step_name, deleting);
        let message = format!("The {} is processing", step_kind(deleting));
        Self::seed(holder, meta, &type_, REASON_PROCESSING, &message);
    }

    fn seed(
        holder: &mut dyn ConditionsHolder,
        meta: &ObjectMeta,
        type_: &str,
        reason: &str,
        message: &str,
    ) {
        if find_condition(holder.conditions(), type_).is_some() {
            return;
        }
        let mut conditions = holder.conditions().to_vec();
        conditions.push(Condition::new(
            type_,
            ConditionStatus::Unknown,
            reason,
            message,
            meta.generation,
        ));
        holder.set_conditions(conditions);
    }

    /// Record the outcome of one step on its condition.
    pub fn apply_step_result(
        &self,
        holder: &mut dyn ConditionsHolder,
        meta: &ObjectMeta,
        step_name: &str,
        result: &StepResult,
    ) {
        let deleting = meta.is_deleting();
        let kind = step_kind(deleting);

        let (status, reason, message) = match (result.outcome(), result.error()) {
            (_, Some(err)) => (
                ConditionStatus::False,
                REASON_ERROR,
                format!("The {kind} has an error: {err}"),
            ),
            (Outcome::Continue | Outcome::Skipped | Outcome::StopChain, None)
                if !result.requeue_after().is_zero() =>
            {
                (
                    ConditionStatus::Unknown,
                    REASON_PROCESSING,
                    format!("The {kind} is processing"),
                )
            }
            _ => (
                ConditionStatus::True,
                REASON_COMPLETE,
                format!("The {kind} is complete"),
            ),
        };

        let condition = Condition::new(
            step_condition_type(step_name, deleting),
            status,
            reason,
            message,
            meta.generation,
        );
        Self::set(holder, condition);
    }

    /// Set the primary `Ready` condition.
    pub fn set_ready(
        &self,
        holder: &mut dyn ConditionsHolder,
        meta: &ObjectMeta,
        readiness: Readiness,
    ) {
        let condition = Condition::new(
            CONDITION_READY,
            readiness.status(),
            REASON_COMPLETE,
            readiness.message(),
            meta.generation,
        );
        Self::set(holder, condition);
    }

    fn set(holder: &mut dyn ConditionsHolder, condition: Condition) {
        let mut conditions = holder.conditions().to_vec();
        if set_condition(&mut conditions, condition) {
            holder.set_conditions(conditions);
        }
    }
}

fn step_kind(deleting: bool) -> &'static str {
    if deleting {
        STEP_KIND_FINALIZE
    } else {
        STEP_KIND_PROCESS
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    #[derive(Default)]
    struct Holder(Vec<Condition>);

    impl ConditionsHolder for Holder {
        fn conditions(&self) -> &[Condition] {
            &self.0
        }

        fn set_conditions(&mut self, conditions: Vec<Condition>) {
            self.0 = conditions;
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_set_condition_keeps_transition_time_on_same_status() {
        let mut conditions = vec![];
        let mut first = Condition::new("A", ConditionStatus::True, "R", "m1", 1);
        first.last_transition_time = at(100);
        assert!(set_condition(&mut conditions, first));

        let mut second = Condition::new("A", ConditionStatus::True, "R", "m2", 1);
        second.last_transition_time = at(200);
        assert!(set_condition(&mut conditions, second));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "m2");
        assert_eq!(conditions[0].last_transition_time, at(100));

        let mut third = Condition::new("A", ConditionStatus::False, "R", "m2", 1);
        third.last_transition_time = at(300);
        assert!(set_condition(&mut conditions, third));
        assert_eq!(conditions[0].last_transition_time, at(300));
    }

    #[test]
    fn test_set_condition_reports_no_change() {
        let mut conditions = vec![Condition::new("A", ConditionStatus::True, "R", "m", 1)];
        let same = Condition::new("A", ConditionStatus::True, "R", "m", 1);
        assert!(!set_condition(&mut conditions, same));
    }

    #[test]
    fn test_remove_and_lookup() {
        let mut conditions = vec![
            Condition::new("A", ConditionStatus::True, "R", "m", 1),
            Condition::new("B", ConditionStatus::False, "R", "m", 1),
        ];
        assert!(is_condition_true(&conditions, "A"));
        assert!(!is_condition_true(&conditions, "B"));
        assert!(remove_condition(&mut conditions, "A"));
        assert!(find_condition(&conditions, "A").is_none());
    }

    #[test]
    fn test_seed_does_not_overwrite() {
        let meta = ObjectMeta::new("ns", "a");
        let mut holder = Holder::default();
        let manager = ConditionManager;

        manager.set_ready(&mut holder, &meta, Readiness::Ready);
        manager.seed_ready(&mut holder, &meta);

        let ready = find_condition(&holder.0, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
    }

    #[test]
    fn test_seeded_conditions_are_unknown() {
        let meta = ObjectMeta::new("ns", "a");
        let mut holder = Holder::default();
        let manager = ConditionManager;

        manager.seed_ready(&mut holder, &meta);
        manager.seed_step(&mut holder, &meta, "deploy");

        let ready = find_condition(&holder.0, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.reason, REASON_COMPLETE);

        let step = find_condition(&holder.0, "deploy_Ready").unwrap();
        assert_eq!(step.status, ConditionStatus::Unknown);
        assert_eq!(step.reason, REASON_PROCESSING);
    }

    #[test]
    fn test_step_condition_type_by_phase() {
        assert_eq!(step_condition_type("deploy", false), "deploy_Ready");
        assert_eq!(step_condition_type("deploy", true), "deploy_Finalize");
    }

    #[rstest]
    #[case::ok(StepResult::ok(), ConditionStatus::True, REASON_COMPLETE)]
    #[case::requeue(StepResult::requeue(Duration::from_secs(5)), ConditionStatus::Unknown, REASON_PROCESSING)]
    #[case::skipped(StepResult::skip("nothing to do"), ConditionStatus::True, REASON_COMPLETE)]
    #[case::stop(StepResult::stop("done early"), ConditionStatus::True, REASON_COMPLETE)]
    #[case::retry(StepResult::retry(anyhow::anyhow!("boom")), ConditionStatus::False, REASON_ERROR)]
    #[case::fail(StepResult::fail(anyhow::anyhow!("boom")), ConditionStatus::False, REASON_ERROR)]
    #[case::stop_err(StepResult::stop_with_error(anyhow::anyhow!("boom"), "halt"), ConditionStatus::False, REASON_ERROR)]
    fn test_step_transitions(
        #[case] result: StepResult,
        #[case] status: ConditionStatus,
        #[case] reason: &str,
    ) {
        let meta = ObjectMeta::new("ns", "a");
        let mut holder = Holder::default();
        let manager = ConditionManager;

        manager.seed_step(&mut holder, &meta, "step");
        manager.apply_step_result(&mut holder, &meta, "step", &result);

        let condition = find_condition(&holder.0, "step_Ready").unwrap();
        assert_eq!(condition.status, status);
        assert_eq!(condition.reason, reason);
        assert_eq!(holder.0.len(), 1);
    }

    #[test]
    fn test_error_message_carries_cause() {
        let mut meta = ObjectMeta::new("ns", "a");
        meta.deletion_timestamp = Some(Utc::now());
        let mut holder = Holder::default();

        ConditionManager.apply_step_result(
            &mut holder,
            &meta,
            "cleanup",
            &StepResult::fail(anyhow::anyhow!("x")),
        );

        let condition = find_condition(&holder.0, "cleanup_Finalize").unwrap();
        assert_eq!(
            condition.message,
            "The subroutine finalization has an error: x"
        );
    }

    #[rstest]
    #[case(Duration::from_secs(1), false, Readiness::Processing)]
    #[case(Duration::from_secs(1), true, Readiness::Processing)]
    #[case(Duration::ZERO, true, Readiness::NotReady)]
    #[case(Duration::ZERO, false, Readiness::Ready)]
    fn test_readiness_from_run(
        #[case] requeue: Duration,
        #[case] has_error: bool,
        #[case] expected: Readiness,
    ) {
        assert_eq!(Readiness::from_run(requeue, has_error), expected);
    }

    #[test]
    fn test_foreign_conditions_survive() {
        let meta = ObjectMeta::new("ns", "a");
        let mut holder = Holder(vec![Condition::new(
            "Custom",
            ConditionStatus::False,
            "Mine",
            "owned by a step",
            1,
        )]);

        ConditionManager.seed_ready(&mut holder, &meta);
        ConditionManager.set_ready(&mut holder, &meta, Readiness::Ready);

        let custom = find_condition(&holder.0, "Custom").unwrap();
        assert_eq!(custom.reason, "Mine");
        assert_eq!(holder.0.len(), 2);
    }
}
