use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiResource, Scope};
use kube::Client;
use tokio::sync::RwLock;
use tracing::*;

use super::{source_of, Deletion, ObjectStore};
use crate::resources::Source;
use crate::{Error, Result};

#[derive(Clone)]
struct Resolved {
    resource: ApiResource,
    namespaced: bool,
    status_subresource: bool,
}

/// [`ObjectStore`] backed by a Kubernetes API server.
///
/// Kinds are resolved through discovery once and cached.
pub struct KubeStore {
    client: Client,
    resolved: RwLock<HashMap<(String, String), Resolved>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(&self, api_version: &str, kind: &str) -> Result<Resolved> {
        let key = (api_version.to_string(), kind.to_string());
        if let Some(resolved) = self.resolved.read().await.get(&key) {
            return Ok(resolved.clone());
        }

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (resource, caps) = discovery::pinned_kind(&self.client, &gvk).await?;
        let resolved = Resolved {
            resource,
            namespaced: caps.scope == Scope::Namespaced,
            status_subresource: caps.subresources.iter().any(|(sub, _)| sub.plural == "status"),
        };
        debug!(api_version, kind, "resolved api resource");
        self.resolved.write().await.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// The discovered resource for `api_version` and `kind`
    pub async fn api_resource(&self, api_version: &str, kind: &str) -> Result<ApiResource> {
        Ok(self.resolve(api_version, kind).await?.resource)
    }

    async fn api(&self, api_version: &str, kind: &str, namespace: &str) -> Result<(Api<DynamicObject>, Resolved)> {
        let resolved = self.resolve(api_version, kind).await?;
        let api = if resolved.namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &resolved.resource)
        } else {
            Api::all_with(self.client.clone(), &resolved.resource)
        };
        Ok((api, resolved))
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &Source) -> Result<Option<DynamicObject>> {
        let (api, _) = self.api(&key.api_version, &key.kind, &key.namespace).await?;
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = source_of(obj)?;
        let (api, _) = self.api(&key.api_version, &key.kind, &key.namespace).await?;
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = source_of(obj)?;
        let (api, resolved) = self.api(&key.api_version, &key.kind, &key.namespace).await?;
        let pp = PostParams::default();
        let mut updated = api.replace(&key.name, &pp, obj).await.map_err(conflict)?;

        // the main endpoint ignores status when the kind has a status subresource
        if let Some(status) = obj.data.get("status").filter(|_| resolved.status_subresource) {
            let mut with_status = updated.clone();
            with_status.data["status"] = status.clone();
            updated = api
                .replace_status(&key.name, &pp, serde_json::to_vec(&with_status)?)
                .await
                .map_err(conflict)?;
        }
        Ok(updated)
    }

    async fn delete(&self, key: &Source) -> Result<Deletion> {
        let (api, _) = self.api(&key.api_version, &key.kind, &key.namespace).await?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(outcome) if outcome.is_left() => Ok(Deletion::Pending),
            Ok(_) => Ok(Deletion::Gone),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(Deletion::Gone),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let (api, _) = self.api(api_version, kind, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(selector);
        }
        let mut items = api.list(&lp).await?.items;
        // lists omit apiVersion and kind on their items
        for item in items.iter_mut() {
            if item.types.is_none() {
                item.types = Some(kube::api::TypeMeta {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                });
            }
        }
        debug!(api_version, kind, namespace, count = items.len(), "listed objects");
        Ok(items)
    }
}

fn conflict(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(resp.message),
        other => other.into(),
    }
}
