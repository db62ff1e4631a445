// SPDX-License-Identifier: GPL-3.0-only

//! In-memory resource store.
//!
//! Resources live in one arena keyed by `(type, id)`. Every successful write
//! bumps the resource version and wakes the watchers of that type (and id)
//! after the write lock has been released, so a watcher reading the store in
//! response always sees the write that woke it.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use storage_types::{Metadata, Phase, Resource, ResourceSpec};
use tracing::trace;

use crate::error::{Result, StoreError};

/// Type-erased spec held by the arena.
trait StoredSpec: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn to_json(&self) -> serde_json::Value;
}

impl<T: ResourceSpec> StoredSpec for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    metadata: Metadata,
    spec: Arc<dyn StoredSpec>,
}

impl Entry {
    fn new<T: ResourceSpec>(resource: Resource<T>) -> Self {
        Self {
            metadata: resource.metadata,
            spec: Arc::new(resource.spec),
        }
    }

    fn resource<T: ResourceSpec>(&self) -> Option<Resource<T>> {
        self.spec
            .as_any()
            .downcast_ref::<T>()
            .map(|spec| Resource {
                metadata: self.metadata.clone(),
                spec: spec.clone(),
            })
    }
}

type Key = (&'static str, String);

struct Watch {
    resource_type: &'static str,
    id: Option<String>,
    notify: Sender<()>,
}

/// Process-wide resource store shared by every controller.
#[derive(Default)]
pub struct Store {
    resources: RwLock<BTreeMap<Key, Entry>>,
    watches: Mutex<Vec<Watch>>,
    /// Output types written by exactly one controller.
    exclusive: RwLock<HashMap<&'static str, String>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("resources", &self.resources.read().len())
            .finish()
    }
}

fn not_found(resource_type: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    }
}

fn phase_conflict(resource_type: &str, id: &str) -> StoreError {
    StoreError::PhaseConflict {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    }
}

impl Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve `resource_type` for writes by `owner` only.
    pub fn claim_exclusive(&self, resource_type: &'static str, owner: &str) -> Result<()> {
        let mut exclusive = self.exclusive.write();
        match exclusive.get(resource_type) {
            Some(existing) if existing != owner => Err(StoreError::OutputClaimed {
                resource_type: resource_type.to_string(),
                owner: existing.clone(),
            }),
            _ => {
                exclusive.insert(resource_type, owner.to_string());
                Ok(())
            }
        }
    }

    /// Wake `notify` whenever a resource of `resource_type` (restricted to
    /// `id` when given) is written.
    ///
    /// Notifications are `try_send`, so a bounded channel coalesces bursts.
    pub fn watch(&self, resource_type: &'static str, id: Option<&str>, notify: Sender<()>) {
        self.watches.lock().push(Watch {
            resource_type,
            id: id.map(str::to_string),
            notify,
        });
    }

    fn notify(&self, resource_type: &str, id: &str) {
        trace!("store write {}/{}", resource_type, id);
        self.watches.lock().retain(|watch| {
            if watch.resource_type != resource_type
                || watch.id.as_deref().is_some_and(|watched| watched != id)
            {
                return true;
            }
            !matches!(watch.notify.try_send(()), Err(TrySendError::Disconnected(_)))
        });
    }

    fn check_writer(
        &self,
        resource_type: &'static str,
        id: &str,
        existing_owner: Option<&str>,
        writer: &str,
    ) -> Result<()> {
        if let Some(owner) = self.exclusive.read().get(resource_type)
            && owner != writer
        {
            return Err(StoreError::OwnerConflict {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                owner: owner.clone(),
                writer: writer.to_string(),
            });
        }

        match existing_owner {
            Some(owner) if !owner.is_empty() && owner != writer => Err(StoreError::OwnerConflict {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                owner: owner.to_string(),
                writer: writer.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn get<T: ResourceSpec>(&self, id: &str) -> Option<Resource<T>> {
        self.resources
            .read()
            .get(&(T::TYPE, id.to_string()))
            .and_then(Entry::resource)
    }

    /// All resources of type `T`, ordered by id.
    pub fn list<T: ResourceSpec>(&self) -> Vec<Resource<T>> {
        self.resources
            .read()
            .iter()
            .filter(|((resource_type, _), _)| *resource_type == T::TYPE)
            .filter_map(|(_, entry)| entry.resource())
            .collect()
    }

    pub fn list_labeled<T: ResourceSpec>(&self, key: &str, value: &str) -> Vec<Resource<T>> {
        self.list::<T>()
            .into_iter()
            .filter(|r| r.metadata.label(key) == Some(value))
            .collect()
    }

    pub fn create<T: ResourceSpec>(&self, writer: &str, mut resource: Resource<T>) -> Result<Resource<T>> {
        let key = (T::TYPE, resource.metadata.id.clone());
        {
            let mut resources = self.resources.write();
            if resources.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    resource_type: T::TYPE.to_string(),
                    id: key.1,
                });
            }
            self.check_writer(T::TYPE, &key.1, None, writer)?;

            resource.metadata.resource_type = T::TYPE;
            resource.metadata.version = 1;
            resource.metadata.phase = Phase::Running;
            resource.metadata.owner = writer.to_string();
            resources.insert(key.clone(), Entry::new(resource.clone()));
        }

        self.notify(T::TYPE, &key.1);
        Ok(resource)
    }

    /// Replace spec and labels, conditional on the version `resource` was read at.
    pub fn update<T: ResourceSpec>(&self, writer: &str, resource: Resource<T>) -> Result<Resource<T>> {
        let id = resource.metadata.id.clone();
        let updated = {
            let mut resources = self.resources.write();
            let entry = resources
                .get_mut(&(T::TYPE, id.clone()))
                .ok_or_else(|| not_found(T::TYPE, &id))?;
            self.check_writer(T::TYPE, &id, Some(&entry.metadata.owner), writer)?;

            if entry.metadata.version != resource.metadata.version {
                return Err(StoreError::Conflict {
                    resource_type: T::TYPE.to_string(),
                    id,
                    expected: resource.metadata.version,
                    found: entry.metadata.version,
                });
            }
            if entry.metadata.is_tearing_down() {
                return Err(phase_conflict(T::TYPE, &id));
            }

            entry.metadata.version += 1;
            entry.metadata.labels = resource.metadata.labels;
            entry.metadata.owner = writer.to_string();
            entry.spec = Arc::new(resource.spec);
            entry.resource::<T>().ok_or_else(|| not_found(T::TYPE, &id))?
        };

        self.notify(T::TYPE, &id);
        Ok(updated)
    }

    /// Create or update resource `id`.
    ///
    /// `f` sees the current resource (or a fresh one built from `init`); only
    /// its spec and labels are kept. Nothing is written, and no watcher is
    /// woken, when `f` leaves both unchanged.
    pub fn modify<T, I, F>(&self, writer: &str, id: &str, init: I, f: F) -> Result<Resource<T>>
    where
        T: ResourceSpec,
        I: FnOnce() -> T,
        F: FnOnce(&mut Resource<T>),
    {
        self.modify_in_phase(writer, id, init, f, false)
    }

    /// Like [`Store::modify`], but also writes resources already tearing down.
    pub fn modify_any_phase<T, I, F>(&self, writer: &str, id: &str, init: I, f: F) -> Result<Resource<T>>
    where
        T: ResourceSpec,
        I: FnOnce() -> T,
        F: FnOnce(&mut Resource<T>),
    {
        self.modify_in_phase(writer, id, init, f, true)
    }

    fn modify_in_phase<T, I, F>(
        &self,
        writer: &str,
        id: &str,
        init: I,
        f: F,
        any_phase: bool,
    ) -> Result<Resource<T>>
    where
        T: ResourceSpec,
        I: FnOnce() -> T,
        F: FnOnce(&mut Resource<T>),
    {
        let key = (T::TYPE, id.to_string());
        let result = {
            let mut resources = self.resources.write();

            match resources.get_mut(&key) {
                Some(entry) => {
                    self.check_writer(T::TYPE, id, Some(&entry.metadata.owner), writer)?;
                    if entry.metadata.is_tearing_down() && !any_phase {
                        return Err(phase_conflict(T::TYPE, id));
                    }

                    let current = entry.resource::<T>().ok_or_else(|| not_found(T::TYPE, id))?;
                    let mut next = current.clone();
                    f(&mut next);

                    if next.spec == current.spec && next.metadata.labels == current.metadata.labels {
                        return Ok(current);
                    }

                    entry.metadata.version += 1;
                    entry.metadata.labels = next.metadata.labels;
                    entry.metadata.owner = writer.to_string();
                    entry.spec = Arc::new(next.spec);
                    entry.resource::<T>().ok_or_else(|| not_found(T::TYPE, id))?
                }
                None => {
                    self.check_writer(T::TYPE, id, None, writer)?;

                    let mut resource = Resource::new(id, init());
                    f(&mut resource);
                    resource.metadata = Metadata {
                        version: 1,
                        owner: writer.to_string(),
                        labels: resource.metadata.labels,
                        ..Metadata::new(T::TYPE, id)
                    };
                    resources.insert(key.clone(), Entry::new(resource.clone()));
                    resource
                }
            }
        };

        self.notify(T::TYPE, id);
        Ok(result)
    }

    /// Move resource `id` to `TearingDown`.
    ///
    /// Returns whether it is ready to be destroyed (no finalizers left).
    pub fn teardown<T: ResourceSpec>(&self, writer: &str, id: &str) -> Result<bool> {
        let ready = {
            let mut resources = self.resources.write();
            let entry = resources
                .get_mut(&(T::TYPE, id.to_string()))
                .ok_or_else(|| not_found(T::TYPE, id))?;
            self.check_writer(T::TYPE, id, Some(&entry.metadata.owner), writer)?;

            if entry.metadata.is_tearing_down() {
                return Ok(entry.metadata.finalizers.is_empty());
            }

            entry.metadata.phase = Phase::TearingDown;
            entry.metadata.version += 1;
            entry.metadata.finalizers.is_empty()
        };

        self.notify(T::TYPE, id);
        Ok(ready)
    }

    /// Remove resource `id`; refused while any finalizer remains.
    pub fn destroy<T: ResourceSpec>(&self, writer: &str, id: &str) -> Result<()> {
        {
            let mut resources = self.resources.write();
            let key = (T::TYPE, id.to_string());
            let entry = resources.get(&key).ok_or_else(|| not_found(T::TYPE, id))?;
            self.check_writer(T::TYPE, id, Some(&entry.metadata.owner), writer)?;

            if !entry.metadata.finalizers.is_empty() {
                return Err(StoreError::HasFinalizers {
                    resource_type: T::TYPE.to_string(),
                    id: id.to_string(),
                    finalizers: entry.metadata.finalizers.iter().cloned().collect(),
                });
            }

            resources.remove(&key);
        }

        self.notify(T::TYPE, id);
        Ok(())
    }

    /// Add `finalizer` to resource `id`. Any controller may hold a finalizer.
    ///
    /// Fails with a phase conflict once the resource is tearing down.
    pub fn add_finalizer<T: ResourceSpec>(&self, id: &str, finalizer: &str) -> Result<()> {
        {
            let mut resources = self.resources.write();
            let entry = resources
                .get_mut(&(T::TYPE, id.to_string()))
                .ok_or_else(|| not_found(T::TYPE, id))?;

            if entry.metadata.has_finalizer(finalizer) {
                return Ok(());
            }
            if entry.metadata.is_tearing_down() {
                return Err(phase_conflict(T::TYPE, id));
            }

            entry.metadata.finalizers.insert(finalizer.to_string());
            entry.metadata.version += 1;
        }

        self.notify(T::TYPE, id);
        Ok(())
    }

    pub fn remove_finalizer<T: ResourceSpec>(&self, id: &str, finalizer: &str) -> Result<()> {
        {
            let mut resources = self.resources.write();
            let entry = resources
                .get_mut(&(T::TYPE, id.to_string()))
                .ok_or_else(|| not_found(T::TYPE, id))?;

            if !entry.metadata.finalizers.remove(finalizer) {
                return Ok(());
            }
            entry.metadata.version += 1;
        }

        self.notify(T::TYPE, id);
        Ok(())
    }

    /// Snapshot of every resource of the given types as JSON, for operators.
    pub fn dump(&self, types: &[&str]) -> serde_json::Value {
        let resources = self.resources.read();
        let mut out = serde_json::Map::new();

        for ((resource_type, _), entry) in resources.iter() {
            if !types.is_empty() && !types.contains(resource_type) {
                continue;
            }

            let list = out
                .entry(resource_type.to_string())
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let serde_json::Value::Array(list) = list {
                list.push(serde_json::json!({
                    "metadata": entry.metadata,
                    "spec": entry.spec.to_json(),
                }));
            }
        }

        serde_json::Value::Object(out)
    }
}
