//! The narrow client contract every reconciler talks to.

use async_trait::async_trait;
use kube::api::{DynamicObject, ObjectMeta, TypeMeta};
use kube::{Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dynamic::Document;
use crate::resources::Source;
use crate::{Error, Result};

mod kube_store;
pub use kube_store::KubeStore;

#[cfg(test)]
pub mod memory;

/// Outcome of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// The object is gone, or never existed
    Gone,
    /// The object still exists, e.g. while finalizers run
    Pending,
}

/// CRUD + List access to a Kubernetes style object store.
///
/// Updates are optimistic: an object carrying a stale `resourceVersion` fails with a conflict.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &Source) -> Result<Option<DynamicObject>>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn delete(&self, key: &Source) -> Result<Deletion>;

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>>;
}

/// The weak reference identifying `obj`
pub fn source_of(obj: &DynamicObject) -> Result<Source> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| Error::InvalidInput(format!("object {} has no type", obj.name_any())))?;
    Ok(Source::new(
        &types.api_version,
        &types.kind,
        obj.name_any(),
        obj.namespace().unwrap_or_default(),
    ))
}

pub fn from_document(doc: Document) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::Value::Object(doc))?)
}

/// Converts a typed resource into its dynamic form
pub fn to_dynamic<K: Resource<DynamicType = ()> + Serialize>(obj: &K) -> Result<DynamicObject> {
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    dynamic.types = Some(TypeMeta {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
    });
    Ok(dynamic)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Key of a typed resource
pub fn key_of<K: Resource<DynamicType = ()>>(name: &str, namespace: &str) -> Source {
    Source::new(K::api_version(&()), K::kind(&()), name, namespace)
}

pub async fn get_typed<K>(store: &dyn ObjectStore, name: &str, namespace: &str) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    match store.get(&key_of::<K>(name, namespace)).await? {
        Some(obj) => Ok(Some(from_dynamic(obj)?)),
        None => Ok(None),
    }
}

pub async fn update_typed<K>(store: &dyn ObjectStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    from_dynamic(store.update(&to_dynamic(obj)?).await?)
}

/// Metadata for a new namespaced object
pub fn new_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}
