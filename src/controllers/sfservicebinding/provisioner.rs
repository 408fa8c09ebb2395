use k8s_openapi::api::core::v1::Secret;
use kube::{Resource, ResourceExt};
use tracing::*;

use crate::controllers::lifecycle::{
    effective_state, expect_in_progress, has_finalizer, last_operation, Outcome, Provisioner,
};
use crate::reconcilers::expected::set_owner_reference;
use crate::reconcilers::status::GenericStatus;
use crate::reconcilers::{Progress, RenderRequest};
use crate::resources::sfplans::actions;
use crate::resources::sfservicebindings::SFServiceBinding;
use crate::resources::{state, Source, INTEROPERATOR_FINALIZER};
use crate::store::{get_typed, key_of, new_meta, source_of, to_dynamic, Deletion};
use crate::{Error, Result};

/// Key of the Secret holding the bind response
const RESPONSE_KEY: &str = "response";

impl Provisioner {
    /// One pass of the binding lifecycle: dispatch bind or unbind, then fold the observed
    /// status back into the binding
    pub async fn reconcile_binding(&self, name: &str, namespace: &str) -> Result<Outcome> {
        let Some(binding) = get_typed::<SFServiceBinding>(self.source.as_ref(), name, namespace).await?
        else {
            debug!(name, "binding deleted");
            return Ok(Outcome::Settled);
        };
        match self.binding_pass(binding).await {
            Ok(outcome) => {
                self.clear_error_count::<SFServiceBinding>(name, namespace).await?;
                Ok(outcome)
            }
            Err(err) => {
                warn!(name, "binding reconciliation failed: {err}");
                self.handle_error::<SFServiceBinding>(name, namespace, err).await
            }
        }
    }

    async fn binding_pass(&self, binding: SFServiceBinding) -> Result<Outcome> {
        let name = binding.name_any();
        let namespace = binding.namespace().unwrap_or_default();
        let deleting = binding.meta().deletion_timestamp.is_some();
        if deleting && !has_finalizer(&binding) {
            return Ok(Outcome::Settled);
        }
        if !deleting {
            self.ensure_finalizer::<SFServiceBinding>(&name, &namespace).await?;
        }

        let operation = effective_state(&binding).to_string();
        match operation.as_str() {
            state::IN_QUEUE | state::UPDATE => {
                let request = RenderRequest::for_binding(&binding, actions::BIND);
                let mut expected = self
                    .manager
                    .compute_expected_resources(self.source.as_ref(), &request)
                    .await?;
                set_owner_reference(&binding, &mut expected)?;
                let progress = self
                    .manager
                    .reconcile_resources(self.target.as_ref(), &expected, &binding.resources())
                    .await;
                self.set_in_progress::<SFServiceBinding>(&name, &namespace, &operation, progress.sources)
                    .await?;
                if let Some(err) = progress.error {
                    return Err(err);
                }
            }
            state::DELETE => {
                let remaining = self.unbind(&binding).await?;
                self.set_in_progress::<SFServiceBinding>(&name, &namespace, &operation, remaining)
                    .await?;
            }
            state::IN_PROGRESS => {}
            state::SUCCEEDED | state::FAILED => return Ok(Outcome::Settled),
            other => {
                warn!(name, state = other, "ignoring binding in unknown state");
                return Ok(Outcome::Settled);
            }
        }

        let Some(binding) = get_typed::<SFServiceBinding>(self.source.as_ref(), &name, &namespace).await?
        else {
            return Ok(Outcome::Settled);
        };
        if binding.state() != state::IN_PROGRESS {
            return Ok(Outcome::Settled);
        }
        match last_operation(&binding) {
            state::DELETE => self.update_unbind_status(&binding).await,
            _ => self.update_bind_status(&binding).await,
        }
    }

    /// Renders `unbind` when the plan has one, removes the bind secret, and returns the
    /// resources that still have to go.
    ///
    /// Without an `unbind` template every bind resource is deleted. With one, its
    /// resources are applied in place of the bind resources and are not recorded in
    /// `status.resources`: the binding is released once the bind resources are gone, and
    /// the unbind resources are collected through their owner reference to the binding.
    async fn unbind(&self, binding: &SFServiceBinding) -> Result<Vec<Source>> {
        let request = RenderRequest::for_binding(binding, actions::UNBIND);
        let progress = match self
            .manager
            .compute_expected_resources(self.source.as_ref(), &request)
            .await
        {
            Ok(mut expected) => {
                set_owner_reference(binding, &mut expected)?;
                let progress = self
                    .manager
                    .reconcile_resources(self.target.as_ref(), &expected, &binding.resources())
                    .await;
                let unbind_sources: Vec<Source> = expected
                    .iter()
                    .filter_map(|r| source_of(r).ok())
                    .collect();
                Progress {
                    sources: progress
                        .sources
                        .into_iter()
                        .filter(|s| !unbind_sources.contains(s))
                        .collect(),
                    error: progress.error,
                }
            }
            Err(Error::TemplateNotFound { .. }) => {
                debug!(binding = %request.binding_id, "no unbind template, deleting bind resources");
                self.manager
                    .delete_sub_resources(self.target.as_ref(), &binding.resources())
                    .await
            }
            Err(err) => return Err(err),
        };
        if let Some(err) = progress.error {
            return Err(err);
        }
        self.delete_bind_secret(binding).await?;
        Ok(progress.sources)
    }

    async fn delete_bind_secret(&self, binding: &SFServiceBinding) -> Result<()> {
        let key = key_of::<Secret>(&binding.secret_name(), &request_namespace(binding));
        if self.source.delete(&key).await? == Deletion::Gone {
            debug!(secret = %key, "bind secret deleted");
        }
        Ok(())
    }

    /// Stores the bind response in the binding's Secret unless it already exists
    async fn ensure_bind_secret(&self, binding: &SFServiceBinding, response: &str) -> Result<()> {
        let name = binding.secret_name();
        let namespace = request_namespace(binding);
        if self.source.get(&key_of::<Secret>(&name, &namespace)).await?.is_some() {
            return Ok(());
        }
        let mut secret = Secret {
            metadata: new_meta(&name, &namespace),
            string_data: Some([(RESPONSE_KEY.to_string(), response.to_string())].into()),
            ..Default::default()
        };
        let owner = binding.controller_owner_ref(&()).ok_or_else(|| {
            Error::Precondition(format!("{} has no uid yet", binding.name_any()))
        })?;
        secret.metadata.owner_references = Some(vec![owner]);
        self.source.create(&to_dynamic(&secret)?).await?;
        info!(secret = %name, "bind secret created");
        Ok(())
    }

    /// Copies the computed bind status onto the binding and publishes the bind response
    async fn update_bind_status(&self, binding: &SFServiceBinding) -> Result<Outcome> {
        let request = RenderRequest::for_binding(binding, actions::BIND);
        let computed = self
            .manager
            .compute_status(self.source.as_ref(), self.target.as_ref(), &request)
            .await?
            .bind;
        let succeeded = computed.state == state::SUCCEEDED;
        if succeeded {
            self.ensure_bind_secret(binding, &computed.response).await?;
        }

        let updated = self
            .write::<SFServiceBinding, _>(&binding.name_any(), &request.namespace, |obj| {
                expect_in_progress(obj)?;
                let secret_name = obj.secret_name();
                let spec = obj.spec.clone();
                let status = obj.status.get_or_insert_with(Default::default);
                let before = status.clone();
                if !computed.state.is_empty() {
                    status.state = computed.state.clone();
                }
                status.error = computed.error.clone();
                if succeeded {
                    status.response.secret_ref = secret_name;
                    status.applied_spec = Some(spec);
                }
                Ok(*status != before)
            })
            .await?;

        let current = updated.as_ref().map(|b| b.state()).unwrap_or_default();
        info!(binding = %request.binding_id, state = current, "bind status");
        Ok(match current {
            state::IN_PROGRESS => Outcome::Progressing,
            _ => Outcome::Settled,
        })
    }

    /// Copies the computed unbind status onto the binding and releases it once every
    /// remaining resource is gone
    async fn update_unbind_status(&self, binding: &SFServiceBinding) -> Result<Outcome> {
        let request = RenderRequest::for_binding(binding, actions::UNBIND);
        let computed = match self
            .manager
            .compute_status(self.source.as_ref(), self.target.as_ref(), &request)
            .await
        {
            Ok(status) => status.unbind,
            Err(err) if err.is_not_found() => {
                debug!(binding = %request.binding_id, "no unbind status: {err}");
                GenericStatus {
                    state: binding.state().to_string(),
                    error: err.to_string(),
                    ..Default::default()
                }
            }
            Err(err) => return Err(err),
        };

        let mut remaining = self
            .manager
            .existing(self.target.as_ref(), &binding.resources())
            .await;
        if !remaining.is_empty() && computed.state == state::SUCCEEDED {
            remaining = self
                .manager
                .delete_sub_resources(self.target.as_ref(), &remaining)
                .await
                .sources;
        }
        let released = remaining.is_empty();

        let updated = self
            .write::<SFServiceBinding, _>(&binding.name_any(), &request.namespace, |obj| {
                expect_in_progress(obj)?;
                if released {
                    obj.finalizers_mut().retain(|f| f != INTEROPERATOR_FINALIZER);
                }
                let status = obj.status.get_or_insert_with(Default::default);
                if released {
                    status.state = state::SUCCEEDED.to_string();
                } else if !computed.state.is_empty() && computed.state != state::SUCCEEDED {
                    status.state = computed.state.clone();
                }
                status.error = computed.error.clone();
                status.resources = remaining.clone();
                Ok(true)
            })
            .await?;

        if released {
            info!(binding = %request.binding_id, "unbound, finalizer removed");
            return Ok(Outcome::Settled);
        }
        Ok(match updated.as_ref().map(|b| b.state()) {
            Some(state::FAILED) | None => Outcome::Settled,
            _ => Outcome::Progressing,
        })
    }
}

fn request_namespace(binding: &SFServiceBinding) -> String {
    binding.namespace().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use serde_json::json;

    use super::*;
    use crate::reconcilers::fixtures::*;
    use crate::resources::sfplans::TemplateSpec;
    use crate::resources::sfserviceinstances::SFServiceInstance;
    use crate::store::from_dynamic;
    use crate::store::memory::MemoryStore;

    const CREDENTIALS_TEMPLATE: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ binding.metadata.name }}-creds\ndata:\n  user: admin\n";
    const BIND_STATUS: &str = "bind:\n  state: succeeded\n  response: {\"user\": \"admin\"}\nunbind:\n  state: succeeded\n";

    fn provisioner(store: Arc<MemoryStore>) -> Provisioner {
        Provisioner {
            source: store.clone(),
            target: store,
            manager: manager(),
            error_threshold: 10,
        }
    }

    fn bind_templates(extra: Vec<TemplateSpec>) -> Vec<TemplateSpec> {
        let mut templates = vec![
            template(actions::PROVISION, POSTGRES_TEMPLATE),
            template(actions::BIND, CREDENTIALS_TEMPLATE),
            template(actions::SOURCES, "{}"),
            template(actions::STATUS, BIND_STATUS),
        ];
        templates.extend(extra);
        templates
    }

    fn setup(templates: Vec<TemplateSpec>, binding: SFServiceBinding) -> Arc<MemoryStore> {
        let store = store_with(plan(templates));
        let inst: SFServiceInstance = finalized(instance("inst-1", state::SUCCEEDED));
        store.insert(to_dynamic(&inst).unwrap());
        store.insert(to_dynamic(&binding).unwrap());
        store
    }

    fn stored(store: &MemoryStore, name: &str) -> Option<SFServiceBinding> {
        store
            .object(&key_of::<SFServiceBinding>(name, NAMESPACE))
            .map(|obj| from_dynamic(obj).unwrap())
    }

    fn creds_source() -> Source {
        Source::new("v1", "ConfigMap", "bind-1-creds", NAMESPACE)
    }

    fn secret_source() -> Source {
        key_of::<Secret>("sf-bind-1", NAMESPACE)
    }

    fn deleting(mut binding: SFServiceBinding, resources: Vec<Source>) -> SFServiceBinding {
        binding.metadata.finalizers = Some(vec![INTEROPERATOR_FINALIZER.into()]);
        binding.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        binding.status.get_or_insert_with(Default::default).resources = resources;
        binding
    }

    #[tokio::test]
    async fn bind_publishes_the_response_in_a_secret() {
        let store = setup(bind_templates(vec![]), binding("bind-1", "inst-1", in_queue()));

        let outcome = provisioner(store.clone())
            .reconcile_binding("bind-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Settled);

        let bound = stored(&store, "bind-1").unwrap();
        let status = bound.status.clone().unwrap();
        assert_eq!(status.state, state::SUCCEEDED);
        assert_eq!(status.response.secret_ref, "sf-bind-1");
        assert_eq!(status.resources, vec![creds_source()]);
        assert!(has_finalizer(&bound));

        let secret = store.object(&secret_source()).unwrap();
        assert_eq!(
            secret.data["stringData"]["response"],
            json!(r#"{"user":"admin"}"#)
        );
        assert_eq!(secret.owner_references()[0].name, "bind-1");
    }

    #[tokio::test]
    async fn unbind_without_template_deletes_everything() {
        let binding = deleting(
            binding("bind-1", "inst-1", state::SUCCEEDED),
            vec![creds_source()],
        );
        let store = setup(bind_templates(vec![]), binding);
        let provisioner = provisioner(store.clone());
        store.insert(crate::store::memory::object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "bind-1-creds", "namespace": NAMESPACE},
        })));
        store.insert(crate::store::memory::object(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "sf-bind-1", "namespace": NAMESPACE},
        })));

        let outcome = provisioner.reconcile_binding("bind-1", NAMESPACE).await.unwrap();
        assert_eq!(outcome, Outcome::Settled);
        assert!(stored(&store, "bind-1").is_none());
        assert!(!store.contains(&creds_source()));
        assert!(!store.contains(&secret_source()));
    }

    #[tokio::test]
    async fn unbind_template_replaces_bind_resources() {
        let unbind = template(
            actions::UNBIND,
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ binding.metadata.name }}-revoke\n",
        );
        let binding = deleting(
            binding("bind-1", "inst-1", state::SUCCEEDED),
            vec![creds_source()],
        );
        let store = setup(bind_templates(vec![unbind]), binding);
        store.insert(crate::store::memory::object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "bind-1-creds", "namespace": NAMESPACE},
        })));

        let outcome = provisioner(store.clone())
            .reconcile_binding("bind-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Settled);
        assert!(stored(&store, "bind-1").is_none());
        assert!(!store.contains(&creds_source()));
        let revoke = store
            .object(&Source::new("v1", "ConfigMap", "bind-1-revoke", NAMESPACE))
            .unwrap();
        assert_eq!(revoke.owner_references()[0].name, "bind-1");
    }

    #[tokio::test]
    async fn failed_bindings_are_unbound_once_deleted() {
        let binding = deleting(
            binding("bind-1", "inst-1", state::FAILED),
            vec![creds_source()],
        );
        let store = setup(bind_templates(vec![]), binding);
        store.insert(crate::store::memory::object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "bind-1-creds", "namespace": NAMESPACE},
        })));

        let outcome = provisioner(store.clone())
            .reconcile_binding("bind-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Settled);
        assert!(stored(&store, "bind-1").is_none());
        assert!(!store.contains(&creds_source()));
    }

    #[tokio::test]
    async fn bind_waits_for_a_result() {
        let templates = vec![
            template(actions::BIND, CREDENTIALS_TEMPLATE),
            template(actions::SOURCES, "{}"),
            template(actions::STATUS, "bind:\n  state: in progress\n"),
        ];
        let store = setup(templates, binding("bind-1", "inst-1", in_queue()));

        let outcome = provisioner(store.clone())
            .reconcile_binding("bind-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Progressing);
        assert_eq!(stored(&store, "bind-1").unwrap().state(), state::IN_PROGRESS);
        assert!(!store.contains(&secret_source()));
    }
}
