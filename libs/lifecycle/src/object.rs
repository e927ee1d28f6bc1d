//! Managed object model.
//!
//! The engine does not own the object schema. Objects expose their metadata
//! and status through [`ManagedObject`], and opt into the optional status
//! capabilities by overriding the `as_*` accessors.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

/// Identity of a work item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Logical cluster, for multi-cluster hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    /// Namespace, absent for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: None,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object.
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            cluster: None,
            namespace: None,
            name: name.into(),
        }
    }

    /// Pin the key to a logical cluster.
    #[must_use]
    pub fn in_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(cluster) = &self.cluster {
            write!(f, "{cluster}/")?;
        }
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Object metadata the engine reads and (partially) writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    /// Monotonically increasing desired-state generation.
    #[serde(default)]
    pub generation: i64,

    /// Opaque version used for optimistic concurrency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Set once when deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finalizers: Vec<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Metadata for a new namespaced object at generation 1.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            generation: 1,
            ..Default::default()
        }
    }

    /// The work-item key for this object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Returns true once deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.iter().any(|f| f == token)
    }

    /// Add a finalizer token. Returns true if it was missing.
    pub fn add_finalizer(&mut self, token: &str) -> bool {
        if self.has_finalizer(token) {
            return false;
        }
        self.finalizers.push(token.to_string());
        true
    }

    /// Remove a finalizer token. Returns true if it was present.
    pub fn remove_finalizer(&mut self, token: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != token);
        self.finalizers.len() != before
    }
}

/// Status capability: a list of typed conditions.
pub trait ConditionsHolder {
    fn conditions(&self) -> &[Condition];

    fn set_conditions(&mut self, conditions: Vec<Condition>);
}

/// Status capability: observed generation and the next scheduled reconcile.
pub trait SpreadStatusHolder {
    fn observed_generation(&self) -> i64;

    fn set_observed_generation(&mut self, generation: i64);

    fn next_reconcile_time(&self) -> Option<DateTime<Utc>>;

    fn set_next_reconcile_time(&mut self, at: DateTime<Utc>);

    /// Optional per-object spread budget, overriding the engine default.
    fn reconcile_budget(&self) -> Option<Duration> {
        None
    }
}

/// Status capability: when the object was last reconciled.
pub trait RateLimitStatusHolder {
    fn last_reconcile_time(&self) -> Option<DateTime<Utc>>;

    fn set_last_reconcile_time(&mut self, at: DateTime<Utc>);

    fn observed_generation(&self) -> i64;
}

/// An object the lifecycle engine can drive.
///
/// Capability accessors default to `None`. An engine configured to use a
/// capability the object does not expose fails the reconcile before any
/// subroutine runs.
pub trait ManagedObject: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Status subrecord, compared against the snapshot to decide on writes.
    type Status: Clone + PartialEq + Send + Sync;

    /// Kind name used in logs and error reports.
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn status(&self) -> &Self::Status;

    fn status_mut(&mut self) -> &mut Self::Status;

    fn as_conditions(&self) -> Option<&dyn ConditionsHolder> {
        None
    }

    fn as_conditions_mut(&mut self) -> Option<&mut dyn ConditionsHolder> {
        None
    }

    fn as_spread(&self) -> Option<&dyn SpreadStatusHolder> {
        None
    }

    fn as_spread_mut(&mut self) -> Option<&mut dyn SpreadStatusHolder> {
        None
    }

    fn as_rate_limit_status(&self) -> Option<&dyn RateLimitStatusHolder> {
        None
    }

    fn as_rate_limit_status_mut(&mut self) -> Option<&mut dyn RateLimitStatusHolder> {
        None
    }
}
