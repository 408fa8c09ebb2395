use kube::{Resource, ResourceExt};
use tracing::*;

use crate::controllers::lifecycle::{
    effective_state, expect_in_progress, has_finalizer, last_operation, Outcome, Provisioner,
};
use crate::reconcilers::expected::set_owner_reference;
use crate::reconcilers::status::GenericStatus;
use crate::reconcilers::RenderRequest;
use crate::resources::sfplans::actions;
use crate::resources::sfserviceinstances::SFServiceInstance;
use crate::resources::{state, INTEROPERATOR_FINALIZER};
use crate::store::get_typed;
use crate::Result;

impl Provisioner {
    /// One pass of the instance lifecycle: dispatch the requested operation, then fold the
    /// observed status of the rendered resources back into the instance
    pub async fn reconcile_instance(&self, name: &str, namespace: &str) -> Result<Outcome> {
        let Some(instance) = get_typed::<SFServiceInstance>(self.source.as_ref(), name, namespace).await?
        else {
            debug!(name, "instance deleted");
            return Ok(Outcome::Settled);
        };
        match self.instance_pass(instance).await {
            Ok(outcome) => {
                self.clear_error_count::<SFServiceInstance>(name, namespace).await?;
                Ok(outcome)
            }
            Err(err) => {
                warn!(name, "instance reconciliation failed: {err}");
                self.handle_error::<SFServiceInstance>(name, namespace, err).await
            }
        }
    }

    async fn instance_pass(&self, instance: SFServiceInstance) -> Result<Outcome> {
        let name = instance.name_any();
        let namespace = instance.namespace().unwrap_or_default();
        let deleting = instance.meta().deletion_timestamp.is_some();
        if deleting && !has_finalizer(&instance) {
            return Ok(Outcome::Settled);
        }
        if !deleting {
            self.ensure_finalizer::<SFServiceInstance>(&name, &namespace).await?;
        }

        let operation = effective_state(&instance).to_string();
        match operation.as_str() {
            state::IN_QUEUE | state::UPDATE => {
                let request = RenderRequest::for_instance(&instance, actions::PROVISION);
                let mut expected = self
                    .manager
                    .compute_expected_resources(self.source.as_ref(), &request)
                    .await?;
                set_owner_reference(&instance, &mut expected)?;
                let progress = self
                    .manager
                    .reconcile_resources(self.target.as_ref(), &expected, &instance.resources())
                    .await;
                self.set_in_progress::<SFServiceInstance>(&name, &namespace, &operation, progress.sources)
                    .await?;
                if let Some(err) = progress.error {
                    return Err(err);
                }
            }
            state::DELETE => {
                let progress = self
                    .manager
                    .delete_sub_resources(self.target.as_ref(), &instance.resources())
                    .await;
                self.set_in_progress::<SFServiceInstance>(&name, &namespace, &operation, progress.sources)
                    .await?;
                if let Some(err) = progress.error {
                    return Err(err);
                }
            }
            state::IN_PROGRESS => {}
            state::SUCCEEDED | state::FAILED => return Ok(Outcome::Settled),
            other => {
                warn!(name, state = other, "ignoring instance in unknown state");
                return Ok(Outcome::Settled);
            }
        }

        let Some(instance) = get_typed::<SFServiceInstance>(self.source.as_ref(), &name, &namespace).await?
        else {
            return Ok(Outcome::Settled);
        };
        if instance.state() != state::IN_PROGRESS {
            return Ok(Outcome::Settled);
        }
        match last_operation(&instance) {
            state::DELETE => self.update_deprovision_status(&instance).await,
            _ => self.update_provision_status(&instance).await,
        }
    }

    /// Copies the computed provision status onto the instance
    async fn update_provision_status(&self, instance: &SFServiceInstance) -> Result<Outcome> {
        let request = RenderRequest::for_instance(instance, actions::PROVISION);
        let computed = self
            .manager
            .compute_status(self.source.as_ref(), self.target.as_ref(), &request)
            .await?
            .provision;

        let updated = self
            .write::<SFServiceInstance, _>(&instance.name_any(), &request.namespace, |obj| {
                expect_in_progress(obj)?;
                let spec = obj.spec.clone();
                let status = obj.status.get_or_insert_with(Default::default);
                let before = status.clone();
                if !computed.state.is_empty() {
                    status.state = computed.state.clone();
                }
                status.error = computed.error.clone();
                status.description = computed.response.clone();
                status.dashboard_url = computed.dashboard_url.clone();
                status.instance_usable = computed.instance_usable.clone();
                status.update_repeatable = computed.update_repeatable.clone();
                if status.state == state::SUCCEEDED {
                    status.applied_spec = Some(spec);
                }
                Ok(*status != before)
            })
            .await?;

        let current = updated.as_ref().map(|i| i.state()).unwrap_or_default();
        info!(instance = %request.instance_id, state = current, "provision status");
        Ok(match current {
            state::IN_PROGRESS => Outcome::Progressing,
            _ => Outcome::Settled,
        })
    }

    /// Copies the computed deprovision status onto the instance and releases it once every
    /// applied resource is gone
    async fn update_deprovision_status(&self, instance: &SFServiceInstance) -> Result<Outcome> {
        let request = RenderRequest::for_instance(instance, actions::PROVISION);
        let computed = match self
            .manager
            .compute_status(self.source.as_ref(), self.target.as_ref(), &request)
            .await
        {
            Ok(status) => status.deprovision,
            Err(err) if err.is_not_found() => {
                debug!(instance = %request.instance_id, "no deprovision status: {err}");
                GenericStatus {
                    state: instance.state().to_string(),
                    error: err.to_string(),
                    ..Default::default()
                }
            }
            Err(err) => return Err(err),
        };

        let mut remaining = self
            .manager
            .existing(self.target.as_ref(), &instance.resources())
            .await;
        if !remaining.is_empty() && computed.state == state::SUCCEEDED {
            // reported done, but some resources are still around
            remaining = self
                .manager
                .delete_sub_resources(self.target.as_ref(), &remaining)
                .await
                .sources;
        }
        let released = remaining.is_empty();

        let updated = self
            .write::<SFServiceInstance, _>(&instance.name_any(), &request.namespace, |obj| {
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
                status.description = computed.response.clone();
                status.resources = remaining.clone();
                Ok(true)
            })
            .await?;

        if released {
            info!(instance = %request.instance_id, "deprovisioned, finalizer removed");
            return Ok(Outcome::Settled);
        }
        Ok(match updated.as_ref().map(|i| i.state()) {
            Some(state::FAILED) | None => Outcome::Settled,
            _ => Outcome::Progressing,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::ResourceExt;

    use super::*;
    use crate::controllers::lifecycle::error_count;
    use crate::reconcilers::fixtures::*;
    use crate::resources::{ERROR_COUNT_LABEL, LAST_OPERATION_LABEL};
    use crate::store::memory::MemoryStore;
    use crate::store::{from_dynamic, key_of, to_dynamic};

    const SUCCEEDED_STATUS: &str = "provision:\n  state: succeeded\n  response: ok\ndeprovision:\n  state: succeeded\n";

    fn provisioner(store: Arc<MemoryStore>) -> Provisioner {
        Provisioner {
            source: store.clone(),
            target: store,
            manager: manager(),
            error_threshold: 10,
        }
    }

    fn stored(store: &MemoryStore, name: &str) -> Option<SFServiceInstance> {
        store
            .object(&key_of::<SFServiceInstance>(name, NAMESPACE))
            .map(|obj| from_dynamic(obj).unwrap())
    }

    fn foo_plan() -> crate::resources::sfplans::SFPlan {
        plan(vec![
            template(
                actions::PROVISION,
                "apiVersion: kubedb.com/v1alpha1\nkind: Postgres\nmetadata:\n  name: foo\nspec:\n  version: \"11\"\n",
            ),
            template(actions::SOURCES, "{}"),
            template(actions::STATUS, SUCCEEDED_STATUS),
        ])
    }

    fn deleting(mut instance: SFServiceInstance, resources: Vec<crate::resources::Source>) -> SFServiceInstance {
        instance.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        instance.status.get_or_insert_with(Default::default).resources = resources;
        instance
    }

    #[tokio::test]
    async fn one_pass_provisions_and_reports_success() {
        let store = store_with(foo_plan());
        store.insert(to_dynamic(&instance("inst-1", in_queue())).unwrap());

        let outcome = provisioner(store.clone())
            .reconcile_instance("inst-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Settled);

        let inst = stored(&store, "inst-1").unwrap();
        let status = inst.status.clone().unwrap();
        assert_eq!(status.state, state::SUCCEEDED);
        assert_eq!(status.description, "ok");
        assert_eq!(status.resources, vec![postgres_source("foo")]);
        assert!(has_finalizer(&inst));
        assert_eq!(last_operation(&inst), state::IN_QUEUE);

        let postgres = store.object(&postgres_source("foo")).unwrap();
        assert_eq!(postgres.owner_references()[0].name, "inst-1");
    }

    #[tokio::test]
    async fn pending_status_keeps_the_instance_in_progress() {
        let store = store_with(plan(default_templates()));
        store.insert(to_dynamic(&instance("inst-1", in_queue())).unwrap());
        let provisioner = provisioner(store.clone());

        let outcome = provisioner.reconcile_instance("inst-1", NAMESPACE).await.unwrap();
        assert_eq!(outcome, Outcome::Progressing);
        assert_eq!(stored(&store, "inst-1").unwrap().state(), state::IN_PROGRESS);

        let mut live = store.object(&postgres_source("inst-1")).unwrap();
        live.data["status"] = serde_json::json!({"phase": "succeeded"});
        store.insert(live);

        let outcome = provisioner.reconcile_instance("inst-1", NAMESPACE).await.unwrap();
        assert_eq!(outcome, Outcome::Settled);
        let inst = stored(&store, "inst-1").unwrap();
        assert_eq!(inst.state(), state::SUCCEEDED);
        assert_eq!(
            inst.status.unwrap().dashboard_url,
            "https://dashboard/inst-1"
        );
    }

    #[tokio::test]
    async fn settled_instances_are_left_alone() {
        let store = store_with(foo_plan());
        store.insert(to_dynamic(&finalized(instance("inst-1", state::SUCCEEDED))).unwrap());
        store.reset_calls();

        let outcome = provisioner(store.clone())
            .reconcile_instance("inst-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Settled);
        assert_eq!(store.calls("update"), 0);
        assert_eq!(store.calls("create"), 0);
    }

    #[tokio::test]
    async fn deletion_removes_resources_then_the_finalizer() {
        let store = store_with(foo_plan());
        let inst = deleting(
            finalized(instance("inst-1", state::SUCCEEDED)),
            vec![postgres_source("foo")],
        );
        store.insert(to_dynamic(&inst).unwrap());

        let outcome = provisioner(store.clone())
            .reconcile_instance("inst-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Settled);
        assert!(stored(&store, "inst-1").is_none());
    }

    #[tokio::test]
    async fn finalizer_stays_while_resources_remain() {
        let store = store_with(foo_plan());
        let mut blocked = postgres("foo", None);
        blocked.metadata.finalizers = Some(vec!["kubedb.com".into()]);
        store.insert(blocked);
        let inst = deleting(
            finalized(instance("inst-1", state::SUCCEEDED)),
            vec![postgres_source("foo")],
        );
        store.insert(to_dynamic(&inst).unwrap());
        let provisioner = provisioner(store.clone());

        let outcome = provisioner.reconcile_instance("inst-1", NAMESPACE).await.unwrap();
        assert_eq!(outcome, Outcome::Progressing);
        let inst = stored(&store, "inst-1").unwrap();
        assert!(has_finalizer(&inst));
        assert_eq!(inst.resources(), vec![postgres_source("foo")]);
        assert_eq!(inst.labels()[LAST_OPERATION_LABEL], state::DELETE);

        store.remove(&postgres_source("foo"));
        let outcome = provisioner.reconcile_instance("inst-1", NAMESPACE).await.unwrap();
        assert_eq!(outcome, Outcome::Settled);
        assert!(stored(&store, "inst-1").is_none());
    }

    #[tokio::test]
    async fn failed_instances_are_deprovisioned_once_deleted() {
        let store = store_with(foo_plan());
        store.insert(postgres("foo", None));
        let inst = deleting(
            finalized(instance("inst-1", state::FAILED)),
            vec![postgres_source("foo")],
        );
        store.insert(to_dynamic(&inst).unwrap());

        let outcome = provisioner(store.clone())
            .reconcile_instance("inst-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Settled);
        assert!(!store.contains(&postgres_source("foo")));
        assert!(stored(&store, "inst-1").is_none());
    }

    #[tokio::test]
    async fn failed_deletions_stay_failed() {
        let store = store_with(foo_plan());
        store.insert(postgres("foo", None));
        let mut inst = deleting(
            finalized(instance("inst-1", state::FAILED)),
            vec![postgres_source("foo")],
        );
        inst.labels_mut()
            .insert(LAST_OPERATION_LABEL.into(), state::DELETE.into());
        store.insert(to_dynamic(&inst).unwrap());
        store.reset_calls();

        let outcome = provisioner(store.clone())
            .reconcile_instance("inst-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Settled);
        assert_eq!(store.calls("delete"), 0);
        assert!(store.contains(&postgres_source("foo")));
        assert!(has_finalizer(&stored(&store, "inst-1").unwrap()));
    }

    #[tokio::test]
    async fn deletion_without_status_template_carries_state_over() {
        let store = store_with(plan(vec![template(
            actions::PROVISION,
            POSTGRES_TEMPLATE,
        )]));
        let inst = deleting(finalized(instance("inst-1", state::SUCCEEDED)), vec![]);
        store.insert(to_dynamic(&inst).unwrap());

        let outcome = provisioner(store.clone())
            .reconcile_instance("inst-1", NAMESPACE)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Settled);
        assert!(stored(&store, "inst-1").is_none());
    }

    #[tokio::test]
    async fn repeated_failures_end_in_failed() {
        let store = store_with(foo_plan());
        let mut inst = instance("inst-1", in_queue());
        inst.spec.plan_id = "plan-missing".into();
        inst.labels_mut().insert(ERROR_COUNT_LABEL.into(), "10".into());
        store.insert(to_dynamic(&inst).unwrap());

        let outcome = provisioner(store.clone())
            .reconcile_instance("inst-1", NAMESPACE)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Failed(ref m) if m.starts_with("Retry threshold reached for inst-1.")));
        let inst = stored(&store, "inst-1").unwrap();
        assert_eq!(inst.state(), state::FAILED);
        assert_eq!(inst.status.unwrap().description, "SFPlan plan-missing not found");
        assert_eq!(error_count(&stored(&store, "inst-1").unwrap()), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_counted_and_returned() {
        let store = store_with(foo_plan());
        let mut inst = instance("inst-1", in_queue());
        inst.spec.plan_id = "plan-missing".into();
        store.insert(to_dynamic(&inst).unwrap());

        let err = provisioner(store.clone())
            .reconcile_instance("inst-1", NAMESPACE)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(error_count(&stored(&store, "inst-1").unwrap()), 1);
        assert_eq!(stored(&store, "inst-1").unwrap().state(), state::IN_QUEUE);
    }
}
