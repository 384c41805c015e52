//! In-process object store
//!
//! Mimics the API server semantics the reconciler relies on: every write
//! bumps a global resourceVersion, updates with a stale resourceVersion are
//! rejected, and status is only changed through `patch_status`. Reads can be
//! made to fail per object to exercise error paths.

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{store_error, ManagedObject, ObjectStore};
use crate::{Error, Result};

type ObjectKey = (String, Option<String>, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    failing_reads: BTreeSet<ObjectKey>,
    last_version: u64,
    writes: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn key<K: ManagedObject>(namespace: Option<&str>, name: &str) -> ObjectKey {
    (K::kind_name(), namespace.map(str::to_string), name.to_string())
}

fn key_of<K: ManagedObject>(obj: &K) -> ObjectKey {
    key::<K>(obj.meta().namespace.as_deref(), &obj.name_any())
}

fn decode<K: ManagedObject>(value: &Value) -> Result<K> {
    serde_json::from_value(value.clone()).map_err(Error::from)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed or overwrite an object without counting it as a write
    pub fn insert<K: ManagedObject>(&self, mut obj: K) -> Result<K> {
        let mut state = self.lock();
        let version = state.bump();
        obj.meta_mut().resource_version = Some(version);
        let value = serde_json::to_value(&obj)?;
        state.objects.insert(key_of(&obj), value);
        Ok(obj)
    }

    /// Read an object without going through the async interface
    pub fn object<K: ManagedObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.lock();
        state
            .objects
            .get(&key::<K>(namespace, name))
            .and_then(|v| decode(v).ok())
    }

    /// Remove an object without counting it as a write
    pub fn remove<K: ManagedObject>(&self, namespace: Option<&str>, name: &str) -> bool {
        self.lock()
            .objects
            .remove(&key::<K>(namespace, name))
            .is_some()
    }

    /// Make every subsequent read of the object fail
    pub fn fail_reads<K: ManagedObject>(&self, namespace: Option<&str>, name: &str) {
        self.lock().failing_reads.insert(key::<K>(namespace, name));
    }

    pub fn clear_failures(&self) {
        self.lock().failing_reads.clear();
    }

    /// Number of mutating calls made through [`ObjectStore`]
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: ManagedObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>> {
        let state = self.lock();
        let key = key::<K>(namespace, name);
        if state.failing_reads.contains(&key) {
            return Err(store_error::<K>("get", name, "injected read failure"));
        }
        state.objects.get(&key).map(decode).transpose()
    }

    async fn create<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut state = self.lock();
        let key = key_of(obj);
        if state.objects.contains_key(&key) {
            return Err(store_error::<K>("create", &name, "already exists"));
        }

        let mut created = obj.clone();
        let version = state.bump();
        let meta = created.meta_mut();
        meta.resource_version = Some(version.clone());
        meta.uid = Some(format!("uid-{}", version));
        meta.generation = Some(1);

        state.objects.insert(key, serde_json::to_value(&created)?);
        state.writes += 1;
        Ok(created)
    }

    async fn update<K: ManagedObject>(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut state = self.lock();
        let key = key_of(obj);
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| store_error::<K>("update", &name, "not found"))?;

        let stored_version = stored
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(version) = obj.meta().resource_version.as_deref() {
            if stored_version.as_deref() != Some(version) {
                return Err(store_error::<K>(
                    "update",
                    &name,
                    "conflict: the object has been modified",
                ));
            }
        }
        let stored_status = stored.get("status").cloned();
        let generation = stored
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let mut updated = obj.clone();
        let version = state.bump();
        updated.meta_mut().resource_version = Some(version);
        updated.meta_mut().generation = Some(generation + 1);

        let mut value = serde_json::to_value(&updated)?;
        if let (Some(status), Some(map)) = (stored_status, value.as_object_mut()) {
            map.insert("status".to_string(), status);
        }
        let updated = decode(&value)?;
        state.objects.insert(key, value);
        state.writes += 1;
        Ok(updated)
    }

    async fn delete<K: ManagedObject>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        let mut state = self.lock();
        let existed = state.objects.remove(&key::<K>(namespace, name)).is_some();
        if existed {
            state.writes += 1;
        }
        Ok(existed)
    }

    async fn patch_status<K: ManagedObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<()> {
        let mut state = self.lock();
        let version = state.bump();
        let stored = state
            .objects
            .get_mut(&key::<K>(namespace, name))
            .ok_or_else(|| store_error::<K>("update status of", name, "not found"))?;

        if let Some(map) = stored.as_object_mut() {
            map.insert("status".to_string(), status.clone());
        }
        if let Some(meta) = stored.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".to_string(), Value::String(version));
        }
        state.writes += 1;
        Ok(())
    }
}
