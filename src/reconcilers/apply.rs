use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tracing::*;

use super::{Progress, ResourceManager};
use crate::resources::{state, Source};
use crate::store::{source_of, Deletion, ObjectStore};
use crate::{Error, Result};

impl ResourceManager {
    /// Converges `target` towards `expected` and prunes what was applied before but is no
    /// longer expected.
    ///
    /// The returned sources are everything believed to be applied. When a write fails the
    /// previously applied sources are kept as well so pruning can resume on the next pass.
    pub async fn reconcile_resources(
        &self,
        target: &dyn ObjectStore,
        expected: &[DynamicObject],
        previously_applied: &[Source],
    ) -> Progress {
        let mut applied: Vec<Source> = vec![];
        for resource in expected {
            match self.apply(target, resource).await {
                Ok(source) => {
                    if !applied.contains(&source) {
                        applied.push(source);
                    }
                }
                Err(err) => {
                    warn!("failed to apply rendered resource: {err}");
                    for source in previously_applied {
                        if !applied.contains(source) {
                            applied.push(source.clone());
                        }
                    }
                    return Progress {
                        sources: applied,
                        error: Some(err),
                    };
                }
            }
        }

        let orphans: Vec<&Source> = previously_applied
            .iter()
            .filter(|source| !applied.contains(source))
            .collect();
        for orphan in orphans {
            match self.prune(target, orphan).await {
                Ok(Deletion::Gone) => debug!(resource = %orphan, "pruned"),
                Ok(Deletion::Pending) => applied.push(orphan.clone()),
                Err(err) => {
                    warn!(resource = %orphan, "failed to prune, will retry: {err}");
                    applied.push(orphan.clone());
                }
            }
        }
        Progress {
            sources: applied,
            error: None,
        }
    }

    /// Creates `resource`, or updates its payload when it drifted
    async fn apply(&self, target: &dyn ObjectStore, resource: &DynamicObject) -> Result<Source> {
        let source = source_of(resource)?;
        match target.get(&source).await? {
            None => {
                target.create(resource).await?;
                info!(resource = %source, "created");
            }
            Some(found) => {
                if let Some(updated) = self.drifted(resource, found) {
                    target.update(&updated).await?;
                    info!(resource = %source, "updated");
                } else {
                    debug!(resource = %source, "up to date");
                }
            }
        }
        Ok(source)
    }

    /// `found` with the expected payload, if the payload key differs
    fn drifted(&self, expected: &DynamicObject, mut found: DynamicObject) -> Option<DynamicObject> {
        let types = expected.types.as_ref()?;
        let key = self
            .payload_keys
            .key_for(&types.api_version, &types.kind, &expected.data)?;
        let wanted = expected.data.get(key)?;
        if found.data.get(key) == Some(wanted) {
            return None;
        }
        if !found.data.is_object() {
            found.data = Value::Object(Default::default());
        }
        found.data[key] = wanted.clone();
        Some(found)
    }

    /// Deletes an orphan, or asks it to delete itself
    async fn prune(&self, target: &dyn ObjectStore, orphan: &Source) -> Result<Deletion> {
        match target.get(orphan).await? {
            None => Ok(Deletion::Gone),
            Some(live) => self.request_deletion(target, live).await,
        }
    }

    async fn request_deletion(&self, target: &dyn ObjectStore, live: DynamicObject) -> Result<Deletion> {
        let source = source_of(&live)?;
        if !self.delete_intent.contains(&source.api_version) {
            let deletion = target.delete(&source).await?;
            info!(resource = %source, ?deletion, "deleted");
            return Ok(deletion);
        }

        let mut live = live;
        let mut attempt = 0;
        loop {
            if live.data["status"]["state"] == Value::from(state::DELETE) {
                return Ok(Deletion::Pending);
            }
            if !live.data["status"].is_object() {
                live.data["status"] = Value::Object(Default::default());
            }
            live.data["status"]["state"] = Value::from(state::DELETE);
            match target.update(&live).await {
                Ok(_) => {
                    info!(resource = %source, "marked for deletion");
                    return Ok(Deletion::Pending);
                }
                Err(err) if err.is_conflict() && attempt < self.conflict_retries => {
                    attempt += 1;
                    debug!(resource = %source, attempt, "conflict marking for deletion, retrying");
                    match target.get(&source).await? {
                        Some(fresh) => live = fresh,
                        None => return Ok(Deletion::Gone),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Asks every source to go away. Sources that are gone are dropped, everything else
    /// stays in the returned list until a later pass confirms it is gone.
    pub async fn delete_sub_resources(&self, target: &dyn ObjectStore, sources: &[Source]) -> Progress {
        let mut remaining = vec![];
        let mut last_error: Option<Error> = None;
        for source in sources {
            let live = match target.get(source).await {
                Ok(Some(live)) => live,
                Ok(None) => {
                    debug!(resource = %source, "already deleted");
                    continue;
                }
                Err(err) => {
                    warn!(resource = %source, "failed to fetch resource for deletion: {err}");
                    remaining.push(source.clone());
                    last_error = Some(err);
                    continue;
                }
            };
            if let Err(err) = self.request_deletion(target, live).await {
                warn!(resource = %source, "failed to delete resource: {err}");
                last_error = Some(err);
            }
            remaining.push(source.clone());
        }
        Progress {
            sources: remaining,
            error: last_error,
        }
    }

    /// The sources that still exist; lookups that fail count as existing
    pub async fn existing(&self, target: &dyn ObjectStore, sources: &[Source]) -> Vec<Source> {
        let mut existing = vec![];
        for source in sources {
            match target.get(source).await {
                Ok(None) => {}
                Ok(Some(live)) => {
                    debug!(resource = %source, name = %live.name_any(), "still present");
                    existing.push(source.clone());
                }
                Err(err) => {
                    warn!(resource = %source, "failed to check resource: {err}");
                    existing.push(source.clone());
                }
            }
        }
        existing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcilers::fixtures::*;
    use crate::store::memory::{object, MemoryStore};
    use crate::store::MockObjectStore;
    use serde_json::json;

    fn config_map(name: &str, data: Value) -> DynamicObject {
        object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": NAMESPACE},
            "data": data
        }))
    }

    fn deployment_request(name: &str) -> DynamicObject {
        object(json!({
            "apiVersion": "deployment.servicefabrik.io/v1alpha1",
            "kind": "Director",
            "metadata": {"name": name, "namespace": NAMESPACE},
            "spec": {"options": "{}"},
            "status": {"state": "succeeded"}
        }))
    }

    #[tokio::test]
    async fn creates_missing_resources() {
        let store = MemoryStore::new();
        let expected = vec![postgres("foo", None)];
        let applied = manager()
            .reconcile_resources(&store, &expected, &[])
            .await
            .into_result()
            .unwrap();
        assert_eq!(applied, vec![postgres_source("foo")]);
        assert!(store.contains(&postgres_source("foo")));
    }

    #[tokio::test]
    async fn second_pass_is_idempotent() {
        let store = MemoryStore::new();
        let manager = manager();
        let expected = vec![postgres("foo", None), config_map("cfg", json!({"a": "1"}))];
        let applied = manager
            .reconcile_resources(&store, &expected, &[])
            .await
            .into_result()
            .unwrap();

        store.reset_calls();
        let again = manager
            .reconcile_resources(&store, &expected, &applied)
            .await
            .into_result()
            .unwrap();
        assert_eq!(again, applied);
        assert_eq!(store.calls("update"), 0);
        assert_eq!(store.calls("create"), 0);
        assert_eq!(store.calls("delete"), 0);
    }

    #[tokio::test]
    async fn drift_overwrites_only_the_payload_key() {
        let store = MemoryStore::new();
        let mut live = postgres("foo", Some("Running"));
        live.data["spec"]["version"] = json!("10");
        live.metadata.labels = Some([("keep".to_string(), "me".to_string())].into());
        store.insert(live);

        manager()
            .reconcile_resources(&store, &[postgres("foo", None)], &[])
            .await
            .into_result()
            .unwrap();
        assert_eq!(store.calls("update"), 1);
        let updated = store.object(&postgres_source("foo")).unwrap();
        assert_eq!(updated.data["spec"]["version"], json!("11"));
        assert_eq!(updated.data["status"]["phase"], json!("Running"));
        assert_eq!(updated.labels()["keep"], "me");
    }

    #[tokio::test]
    async fn data_key_is_diffed_without_spec() {
        let store = MemoryStore::new();
        store.insert(config_map("cfg", json!({"a": "1"})));
        manager()
            .reconcile_resources(&store, &[config_map("cfg", json!({"a": "2"}))], &[])
            .await
            .into_result()
            .unwrap();
        let cfg = store
            .object(&Source::new("v1", "ConfigMap", "cfg", NAMESPACE))
            .unwrap();
        assert_eq!(cfg.data["data"]["a"], json!("2"));
    }

    #[tokio::test]
    async fn prunes_orphans_regardless_of_order() {
        let store = MemoryStore::new();
        let manager = manager();
        let all = vec![
            postgres("a", None),
            postgres("b", None),
            postgres("c", None),
        ];
        let applied = manager
            .reconcile_resources(&store, &all, &[])
            .await
            .into_result()
            .unwrap();

        let mut previously = applied.clone();
        previously.reverse();
        let kept = manager
            .reconcile_resources(&store, &all[1..2], &previously)
            .await
            .into_result()
            .unwrap();
        assert_eq!(kept, vec![postgres_source("b")]);
        assert!(!store.contains(&postgres_source("a")));
        assert!(store.contains(&postgres_source("b")));
        assert!(!store.contains(&postgres_source("c")));
    }

    #[tokio::test]
    async fn vanished_orphans_are_not_errors() {
        let store = MemoryStore::new();
        let progress = manager()
            .reconcile_resources(&store, &[], &[postgres_source("gone")])
            .await;
        assert!(progress.error.is_none());
        assert!(progress.sources.is_empty());
    }

    #[tokio::test]
    async fn delete_intent_kinds_are_marked_not_deleted() {
        let store = MemoryStore::new();
        store.insert(deployment_request("d1"));
        let source = Source::new(
            "deployment.servicefabrik.io/v1alpha1",
            "Director",
            "d1",
            NAMESPACE,
        );
        let kept = manager()
            .reconcile_resources(&store, &[], &[source.clone()])
            .await
            .into_result()
            .unwrap();
        assert_eq!(kept, vec![source.clone()]);
        let live = store.object(&source).unwrap();
        assert_eq!(live.data["status"]["state"], json!("delete"));

        store.reset_calls();
        manager()
            .delete_sub_resources(&store, &[source])
            .await
            .into_result()
            .unwrap();
        assert_eq!(store.calls("update"), 0);
    }

    #[tokio::test]
    async fn failed_orphan_deletion_is_retried_later() {
        let mut target = MockObjectStore::new();
        target
            .expect_get()
            .returning(|key| Ok(Some(postgres(&key.name, None))));
        target
            .expect_delete()
            .returning(|_| Err(Error::Conflict("busy".into())));

        let progress = manager()
            .reconcile_resources(&target, &[], &[postgres_source("a")])
            .await;
        assert!(progress.error.is_none());
        assert_eq!(progress.sources, vec![postgres_source("a")]);
    }

    #[tokio::test]
    async fn failed_apply_keeps_previous_sources() {
        let mut target = MockObjectStore::new();
        target.expect_get().returning(|_| Ok(None));
        target
            .expect_create()
            .returning(|_| Err(Error::Conflict("exists".into())));

        let progress = manager()
            .reconcile_resources(&target, &[postgres("new", None)], &[postgres_source("old")])
            .await;
        assert!(progress.error.is_some());
        assert_eq!(progress.sources, vec![postgres_source("old")]);
    }

    #[tokio::test]
    async fn delete_sub_resources_is_level_triggered() {
        let store = MemoryStore::new();
        store.insert(postgres("present", None));
        let sources = vec![postgres_source("present"), postgres_source("absent")];

        let remaining = manager()
            .delete_sub_resources(&store, &sources)
            .await
            .into_result()
            .unwrap();
        assert_eq!(remaining, vec![postgres_source("present")]);
        assert!(!store.contains(&postgres_source("present")));

        let remaining = manager()
            .delete_sub_resources(&store, &remaining)
            .await
            .into_result()
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn delete_sub_resources_keeps_sources_on_fetch_errors() {
        let mut target = MockObjectStore::new();
        target
            .expect_get()
            .returning(|_| Err(Error::Conflict("unavailable".into())));
        let progress = manager()
            .delete_sub_resources(&target, &[postgres_source("a")])
            .await;
        assert_eq!(progress.sources, vec![postgres_source("a")]);
        assert!(progress.error.is_some());
    }

    #[tokio::test]
    async fn existing_filters_vanished_sources() {
        let store = MemoryStore::new();
        store.insert(postgres("here", None));
        let existing = manager()
            .existing(&store, &[postgres_source("here"), postgres_source("gone")])
            .await;
        assert_eq!(existing, vec![postgres_source("here")]);
    }
}
