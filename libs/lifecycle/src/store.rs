//! Object store contract.
//!
//! The engine never talks to a backend directly. Hosts provide an
//! [`ObjectStore`] with typed get, merge-patch and status-update semantics
//! and optimistic concurrency on status writes.

use async_trait::async_trait;
use thiserror::Error;

use crate::object::{ManagedObject, ObjectKey};

/// Errors returned by an [`ObjectStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object does not exist.
    #[error("object not found: {0}")]
    NotFound(ObjectKey),

    /// Optimistic concurrency check failed.
    #[error("conflict updating {key}: {detail}")]
    Conflict { key: ObjectKey, detail: String },

    /// The enclosing namespace is being deleted; waiting resolves it.
    #[error("namespace {0} is being terminated")]
    NamespaceTerminating(String),

    /// Any other backend failure, retried by the host.
    #[error("store error: {0}")]
    Transient(String),

    /// Object could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Typed access to the objects a controller manages.
#[async_trait]
pub trait ObjectStore<O: ManagedObject>: Send + Sync {
    /// Load the current state of an object.
    async fn get(&self, key: &ObjectKey) -> Result<O, StoreError>;

    /// Apply the JSON merge patch that turns `original` into `modified`.
    ///
    /// Returns the object as stored after the patch.
    async fn patch(&self, modified: &O, original: &O) -> Result<O, StoreError>;

    /// Replace the status subresource, checking the resource version.
    async fn update_status(&self, obj: &O) -> Result<O, StoreError>;
}
