//! Finalizer management.
//!
//! Each subroutine declares the finalizer tokens it owns. While an object is
//! live every declared token is kept on it; during deletion a step's tokens
//! are removed once its `finalize` succeeds without requeue.
//!
//! Patches only carry `metadata.finalizers` and are computed against the
//! snapshot, never against the post-mutation object.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::object::ManagedObject;
use crate::store::{ObjectStore, StoreError};
use crate::subroutine::Subroutine;

/// Adds and removes finalizer tokens on behalf of the subroutines.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinalizerManager {
    read_only: bool,
}

impl FinalizerManager {
    pub fn new(read_only: bool) -> Self {
        Self { read_only }
    }

    /// Tokens declared by the steps that are not yet on the object, in
    /// declaration order.
    pub fn missing<O: ManagedObject>(obj: &O, steps: &[Arc<dyn Subroutine<O>>]) -> Vec<String> {
        let mut seen = BTreeSet::new();
        steps
            .iter()
            .flat_map(|step| step.finalizers(obj))
            .filter(|token| !obj.metadata().has_finalizer(token))
            .filter(|token| seen.insert(token.clone()))
            .collect()
    }

    /// Ensure every declared token is present on a live object.
    ///
    /// Returns true if a patch was issued.
    pub async fn add_all_if_needed<O, S>(
        &self,
        store: &S,
        obj: &mut O,
        snapshot: &mut O,
        steps: &[Arc<dyn Subroutine<O>>],
    ) -> Result<bool, StoreError>
    where
        O: ManagedObject,
        S: ObjectStore<O> + ?Sized,
    {
        if self.read_only || obj.metadata().is_deleting() {
            return Ok(false);
        }

        let missing = Self::missing(obj, steps);
        if missing.is_empty() {
            return Ok(false);
        }

        for token in &missing {
            obj.metadata_mut().add_finalizer(token);
        }

        info!(finalizers = ?missing, "Adding finalizers");
        Self::patch_finalizers(store, obj, snapshot).await?;
        Ok(true)
    }

    /// Remove the tokens owned by `step` after a successful finalize.
    ///
    /// Returns true if a patch was issued.
    pub async fn remove_for_step<O, S>(
        &self,
        store: &S,
        obj: &mut O,
        snapshot: &mut O,
        step: &dyn Subroutine<O>,
    ) -> Result<bool, StoreError>
    where
        O: ManagedObject,
        S: ObjectStore<O> + ?Sized,
    {
        if self.read_only {
            return Ok(false);
        }

        let tokens = step.finalizers(obj);
        let mut removed = Vec::new();
        for token in &tokens {
            if obj.metadata_mut().remove_finalizer(token) {
                removed.push(token.as_str());
            }
        }

        if removed.is_empty() {
            debug!(subroutine = step.name(), "No finalizers to remove");
            return Ok(false);
        }

        info!(subroutine = step.name(), finalizers = ?removed, "Removing finalizers");
        Self::patch_finalizers(store, obj, snapshot).await?;
        Ok(true)
    }

    async fn patch_finalizers<O, S>(store: &S, obj: &mut O, snapshot: &mut O) -> Result<(), StoreError>
    where
        O: ManagedObject,
        S: ObjectStore<O> + ?Sized,
    {
        let mut modified = snapshot.clone();
        modified.metadata_mut().finalizers = obj.metadata().finalizers.clone();

        let stored = store.patch(&modified, snapshot).await?;
        let resource_version = stored.metadata().resource_version.clone();

        snapshot.metadata_mut().finalizers = obj.metadata().finalizers.clone();
        snapshot.metadata_mut().resource_version = resource_version.clone();
        obj.metadata_mut().resource_version = resource_version;
        Ok(())
    }
}
