//! In-memory [`ObjectStore`] used by the reconciler and controller tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::ResourceExt;

use super::{source_of, Deletion, ObjectStore};
use crate::resources::Source;
use crate::{Error, Result};

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Source, DynamicObject>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    version: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls made for `verb` (get, create, update, delete, list)
    pub fn calls(&self, verb: &str) -> usize {
        self.calls.lock().unwrap().get(verb).copied().unwrap_or_default()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn contains(&self, key: &Source) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn object(&self, key: &Source) -> Option<DynamicObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Stores `obj` as is, bypassing version checks
    pub fn insert(&self, obj: DynamicObject) -> DynamicObject {
        let key = source_of(&obj).unwrap();
        let mut obj = obj;
        obj.metadata.resource_version = Some(self.next_version());
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", key.name));
        }
        self.objects.lock().unwrap().insert(key, obj.clone());
        obj
    }

    /// Removes `key` regardless of finalizers, as an external actor would
    pub fn remove(&self, key: &Source) {
        self.objects.lock().unwrap().remove(key);
    }

    fn count(&self, verb: &'static str) {
        *self.calls.lock().unwrap().entry(verb).or_default() += 1;
    }

    fn next_version(&self) -> String {
        let mut version = self.version.lock().unwrap();
        *version += 1;
        version.to_string()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &Source) -> Result<Option<DynamicObject>> {
        self.count("get");
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.count("create");
        let key = source_of(obj)?;
        if self.contains(&key) {
            return Err(Error::Conflict(format!("{key} already exists")));
        }
        Ok(self.insert(obj.clone()))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        self.count("update");
        let key = source_of(obj)?;
        let current = self
            .object(&key)
            .ok_or_else(|| Error::InvalidInput(format!("{key} does not exist")))?;
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != current.metadata.resource_version
        {
            return Err(Error::Conflict(key.to_string()));
        }
        let mut obj = obj.clone();
        obj.metadata.uid = current.metadata.uid.clone();
        obj.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        if obj.metadata.deletion_timestamp.is_some() && obj.finalizers().is_empty() {
            self.remove(&key);
            return Ok(obj);
        }
        Ok(self.insert(obj))
    }

    async fn delete(&self, key: &Source) -> Result<Deletion> {
        self.count("delete");
        let mut objects = self.objects.lock().unwrap();
        let Some(obj) = objects.get_mut(key) else {
            return Ok(Deletion::Gone);
        };
        if obj.finalizers().is_empty() {
            objects.remove(key);
            return Ok(Deletion::Gone);
        }
        if obj.metadata.deletion_timestamp.is_none() {
            obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        Ok(Deletion::Pending)
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        self.count("list");
        let wanted: Vec<(&str, &str)> = selector
            .split(',')
            .filter_map(|term| term.split_once('='))
            .collect();
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| {
                key.api_version == api_version
                    && key.kind == kind
                    && (namespace.is_empty() || key.namespace == namespace)
            })
            .filter(|(_, obj)| {
                wanted
                    .iter()
                    .all(|(k, v)| obj.labels().get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

/// Builds a dynamic object from JSON, for fixtures
pub fn object(value: serde_json::Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_map(name: &str) -> DynamicObject {
        object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns", "labels": {"app": name}},
            "data": {"a": "1"}
        }))
    }

    #[tokio::test]
    async fn stale_updates_conflict() {
        let store = MemoryStore::new();
        let created = store.create(&config_map("one")).await.unwrap();
        let mut first = created.clone();
        first.data["data"]["a"] = json!("2");
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.data["data"]["a"] = json!("3");
        let err = store.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn finalizers_hold_deletion() {
        let store = MemoryStore::new();
        let mut cm = config_map("held");
        cm.metadata.finalizers = Some(vec!["x".into()]);
        store.create(&cm).await.unwrap();
        let key = Source::new("v1", "ConfigMap", "held", "ns");

        assert_eq!(store.delete(&key).await.unwrap(), Deletion::Pending);
        let mut live = store.get(&key).await.unwrap().unwrap();
        assert!(live.metadata.deletion_timestamp.is_some());

        live.metadata.finalizers = Some(vec![]);
        store.update(&live).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(store.delete(&key).await.unwrap(), Deletion::Gone);
    }

    #[tokio::test]
    async fn list_filters_by_label() {
        let store = MemoryStore::new();
        store.create(&config_map("one")).await.unwrap();
        store.create(&config_map("two")).await.unwrap();
        let found = store.list("v1", "ConfigMap", "ns", "app=two").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "two");
        assert_eq!(store.calls("list"), 1);
    }
}
