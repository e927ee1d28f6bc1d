//! Managed object fixtures.

use std::time::Duration;

use chrono::{DateTime, Utc};
use mesh_lifecycle::conditions::find_condition;
use mesh_lifecycle::{
    Condition, ConditionsHolder, ManagedObject, ObjectKey, ObjectMeta, RateLimitStatusHolder,
    SpreadStatusHolder,
};
use serde::{Deserialize, Serialize};

/// Status of [`TestObject`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatus {
    /// Free-form field the scripted subroutines mutate.
    #[serde(default)]
    pub some: String,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_reconcile_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Overrides the spread budget when set.
    #[serde(default, skip)]
    pub reconcile_budget: Option<Duration>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Object implementing every status capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestObject {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub status: TestStatus,
}

impl TestObject {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            status: TestStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    #[must_use]
    pub fn with_generation(mut self, generation: i64) -> Self {
        self.metadata.generation = generation;
        self
    }

    #[must_use]
    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.status.observed_generation = generation;
        self
    }

    #[must_use]
    pub fn with_next_reconcile_time(mut self, at: DateTime<Utc>) -> Self {
        self.status.next_reconcile_time = Some(at);
        self
    }

    #[must_use]
    pub fn with_some(mut self, value: &str) -> Self {
        self.status.some = value.to_string();
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_finalizer(mut self, token: &str) -> Self {
        self.metadata.add_finalizer(token);
        self
    }

    #[must_use]
    pub fn in_cluster(mut self, cluster: &str) -> Self {
        self.metadata.cluster = Some(cluster.to_string());
        self
    }

    /// Mark the object for deletion.
    #[must_use]
    pub fn deleting(mut self) -> Self {
        self.metadata.deletion_timestamp = Some(Utc::now());
        self
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        find_condition(&self.status.conditions, type_)
    }
}

impl ConditionsHolder for TestStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn set_conditions(&mut self, conditions: Vec<Condition>) {
        self.conditions = conditions;
    }
}

impl SpreadStatusHolder for TestStatus {
    fn observed_generation(&self) -> i64 {
        self.observed_generation
    }

    fn set_observed_generation(&mut self, generation: i64) {
        self.observed_generation = generation;
    }

    fn next_reconcile_time(&self) -> Option<DateTime<Utc>> {
        self.next_reconcile_time
    }

    fn set_next_reconcile_time(&mut self, at: DateTime<Utc>) {
        self.next_reconcile_time = Some(at);
    }

    fn reconcile_budget(&self) -> Option<Duration> {
        self.reconcile_budget
    }
}

impl RateLimitStatusHolder for TestStatus {
    fn last_reconcile_time(&self) -> Option<DateTime<Utc>> {
        self.last_reconcile_time
    }

    fn set_last_reconcile_time(&mut self, at: DateTime<Utc>) {
        self.last_reconcile_time = Some(at);
    }

    fn observed_generation(&self) -> i64 {
        self.observed_generation
    }
}

impl ManagedObject for TestObject {
    type Status = TestStatus;

    const KIND: &'static str = "TestObject";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &TestStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut TestStatus {
        &mut self.status
    }

    fn as_conditions(&self) -> Option<&dyn ConditionsHolder> {
        Some(&self.status)
    }

    fn as_conditions_mut(&mut self) -> Option<&mut dyn ConditionsHolder> {
        Some(&mut self.status)
    }

    fn as_spread(&self) -> Option<&dyn SpreadStatusHolder> {
        Some(&self.status)
    }

    fn as_spread_mut(&mut self) -> Option<&mut dyn SpreadStatusHolder> {
        Some(&mut self.status)
    }

    fn as_rate_limit_status(&self) -> Option<&dyn RateLimitStatusHolder> {
        Some(&self.status)
    }

    fn as_rate_limit_status_mut(&mut self) -> Option<&mut dyn RateLimitStatusHolder> {
        Some(&mut self.status)
    }
}

/// Status of [`PlainObject`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlainStatus {
    #[serde(default)]
    pub some: String,
}

/// Object with no status capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlainObject {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub status: PlainStatus,
}

impl PlainObject {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            status: PlainStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}

impl ManagedObject for PlainObject {
    type Status = PlainStatus;

    const KIND: &'static str = "PlainObject";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &PlainStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut PlainStatus {
        &mut self.status
    }
}
