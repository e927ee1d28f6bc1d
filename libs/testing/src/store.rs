//! In-memory object store.
//!
//! Behaves like a status-subresource API server for a single kind:
//!
//! - `patch` applies an RFC 7386 merge patch computed from (original, modified)
//!   and never touches `status`
//! - `update_status` replaces only `status` and rejects stale resource versions
//! - every successful write bumps the resource version
//! - an object that is deleting and has no finalizers left is removed
//!
//! Errors can be queued per operation; each queued error fails exactly one call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use mesh_lifecycle::patch::{apply_merge_patch, is_empty_patch, merge_patch_between};
use mesh_lifecycle::{ManagedObject, ObjectKey, ObjectStore, StoreError};
use serde_json::Value;
use tracing::debug;

/// A merge patch as received by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPatch {
    pub key: ObjectKey,
    pub patch: Value,
}

#[derive(Default)]
struct Failures {
    get: VecDeque<StoreError>,
    patch: VecDeque<StoreError>,
    update_status: VecDeque<StoreError>,
}

/// Thread-safe in-memory [`ObjectStore`].
pub struct InMemoryStore<O> {
    objects: Mutex<HashMap<ObjectKey, O>>,
    patches: Mutex<Vec<RecordedPatch>>,
    status_updates: Mutex<Vec<O>>,
    gets: AtomicU64,
    failures: Mutex<Failures>,
    version: AtomicU64,
}

impl<O: ManagedObject> InMemoryStore<O> {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            patches: Mutex::new(Vec::new()),
            status_updates: Mutex::new(Vec::new()),
            gets: AtomicU64::new(0),
            failures: Mutex::new(Failures::default()),
            version: AtomicU64::new(0),
        }
    }

    /// A store seeded with one object.
    pub fn with_object(obj: O) -> Self {
        let store = Self::new();
        store.insert(obj);
        store
    }

    /// Insert or replace an object, assigning it a fresh resource version.
    pub fn insert(&self, mut obj: O) -> ObjectKey {
        obj.metadata_mut().resource_version = Some(self.next_version());
        let key = obj.metadata().key();
        lock(&self.objects).insert(key.clone(), obj);
        key
    }

    /// Current stored state of an object.
    pub fn object(&self, key: &ObjectKey) -> Option<O> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        lock(&self.objects).contains_key(key)
    }

    /// Mutate a stored object in place, as another writer would.
    pub fn modify(&self, key: &ObjectKey, f: impl FnOnce(&mut O)) {
        let version = self.next_version();
        if let Some(obj) = lock(&self.objects).get_mut(key) {
            f(obj);
            obj.metadata_mut().resource_version = Some(version);
        }
    }

    pub fn patches(&self) -> Vec<RecordedPatch> {
        lock(&self.patches).clone()
    }

    /// Objects as passed to `update_status`, in call order.
    pub fn status_updates(&self) -> Vec<O> {
        lock(&self.status_updates).clone()
    }

    pub fn status_update_count(&self) -> usize {
        lock(&self.status_updates).len()
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Fail the next `get` with `err`.
    pub fn fail_next_get(&self, err: StoreError) {
        lock(&self.failures).get.push_back(err);
    }

    /// Fail the next `patch` with `err`.
    pub fn fail_next_patch(&self, err: StoreError) {
        lock(&self.failures).patch.push_back(err);
    }

    /// Fail the next `update_status` with `err`.
    pub fn fail_next_status_update(&self, err: StoreError) {
        lock(&self.failures).update_status.push_back(err);
    }

    /// Forget recorded calls, keeping the stored objects.
    pub fn clear_history(&self) {
        lock(&self.patches).clear();
        lock(&self.status_updates).clear();
        self.gets.store(0, Ordering::SeqCst);
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

impl<O: ManagedObject> Default for InMemoryStore<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<O: ManagedObject> ObjectStore<O> for InMemoryStore<O> {
    async fn get(&self, key: &ObjectKey) -> Result<O, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.failures).get.pop_front() {
            return Err(err);
        }
        self.object(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn patch(&self, modified: &O, original: &O) -> Result<O, StoreError> {
        let key = original.metadata().key();
        if let Some(err) = lock(&self.failures).patch.pop_front() {
            return Err(err);
        }

        let mut patch = merge_patch_between(original, modified)?;
        // the status subresource is not writable through the main resource
        if let Some(map) = patch.as_object_mut() {
            map.remove("status");
        }

        lock(&self.patches).push(RecordedPatch {
            key: key.clone(),
            patch: patch.clone(),
        });

        let version = self.next_version();
        let mut objects = lock(&self.objects);
        let stored = objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if is_empty_patch(&patch) {
            return Ok(stored.clone());
        }

        let mut value = serde_json::to_value(stored)?;
        apply_merge_patch(&mut value, &patch);
        let mut updated: O = serde_json::from_value(value)?;
        updated.metadata_mut().resource_version = Some(version);

        let meta = updated.metadata();
        if meta.is_deleting() && meta.finalizers.is_empty() {
            debug!(key = %key, "Last finalizer removed, deleting object");
            objects.remove(&key);
        } else {
            objects.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn update_status(&self, obj: &O) -> Result<O, StoreError> {
        let key = obj.metadata().key();
        if let Some(err) = lock(&self.failures).update_status.pop_front() {
            return Err(err);
        }

        let version = self.next_version();
        let mut objects = lock(&self.objects);
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if stored.metadata().resource_version != obj.metadata().resource_version {
            return Err(StoreError::Conflict {
                key,
                detail: format!(
                    "resource version {:?} is stale, current is {:?}",
                    obj.metadata().resource_version,
                    stored.metadata().resource_version
                ),
            });
        }

        *stored.status_mut() = obj.status().clone();
        stored.metadata_mut().resource_version = Some(version);
        let stored = stored.clone();
        drop(objects);

        lock(&self.status_updates).push(obj.clone());
        Ok(stored)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
