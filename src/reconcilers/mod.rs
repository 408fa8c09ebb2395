//! Template driven resource management: render a plan template into resources, converge
//! the target cluster towards them, and project their observed state into a status.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;
use tracing::*;

use crate::config::InteroperatorConfig;
use crate::dynamic::{to_document, Document};
use crate::renderer::Registry;
use crate::resources::sfplans::SFPlan;
use crate::resources::sfservicebindings::SFServiceBinding;
use crate::resources::sfserviceinstances::SFServiceInstance;
use crate::resources::sfservices::SFService;
use crate::resources::Source;
use crate::store::{from_dynamic, get_typed, ObjectStore};
use crate::{Error, Result};

pub mod apply;
pub mod expected;
pub mod status;

pub use status::Status;

/// Identifies what to render and for whom
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub action: String,
    /// Namespace of the instance or binding, and of the rendered resources
    pub namespace: String,
}

impl RenderRequest {
    pub fn for_instance(instance: &SFServiceInstance, action: &str) -> Self {
        Self {
            instance_id: kube::ResourceExt::name_any(instance),
            binding_id: String::new(),
            service_id: instance.spec.service_id.clone(),
            plan_id: instance.spec.plan_id.clone(),
            action: action.to_string(),
            namespace: kube::ResourceExt::namespace(instance).unwrap_or_default(),
        }
    }

    pub fn for_binding(binding: &SFServiceBinding, action: &str) -> Self {
        Self {
            instance_id: binding.spec.instance_id.clone(),
            binding_id: kube::ResourceExt::name_any(binding),
            service_id: binding.spec.service_id.clone(),
            plan_id: binding.spec.plan_id.clone(),
            action: action.to_string(),
            namespace: kube::ResourceExt::namespace(binding).unwrap_or_default(),
        }
    }

    /// Name used for the render, the binding when there is one
    fn render_name(&self) -> &str {
        if self.binding_id.is_empty() {
            &self.instance_id
        } else {
            &self.binding_id
        }
    }
}

/// The payload key compared when diffing a resource
#[derive(Clone, Debug)]
pub struct PayloadKeys {
    overrides: BTreeMap<String, String>,
    defaults: Vec<String>,
}

impl PayloadKeys {
    pub fn new(overrides: BTreeMap<String, String>, defaults: Vec<String>) -> Self {
        Self {
            overrides,
            defaults,
        }
    }

    /// The override for `apiVersion/kind` or `kind`, else the first default key present in `doc`
    pub fn key_for<'a>(&'a self, api_version: &str, kind: &str, doc: &Value) -> Option<&'a str> {
        if let Some(key) = self
            .overrides
            .get(&format!("{api_version}/{kind}"))
            .or_else(|| self.overrides.get(kind))
        {
            return Some(key.as_str());
        }
        self.defaults
            .iter()
            .find(|key| doc.get(key.as_str()).is_some())
            .map(String::as_str)
    }
}

/// The plan's view of one instance or binding
#[derive(Clone, Debug, Default)]
pub(crate) struct Entities {
    pub instance: Option<SFServiceInstance>,
    pub binding: Option<SFServiceBinding>,
    pub service: Option<SFService>,
    pub plan: Option<SFPlan>,
}

impl Entities {
    /// Template values: `instance`, `binding`, `service` and `plan` as nested maps
    pub fn values(&self) -> Result<Document> {
        fn entry<T: serde::Serialize>(entity: &Option<T>) -> Result<Value> {
            Ok(match entity {
                Some(entity) => Value::Object(to_document(entity)?),
                None => Value::Object(Document::new()),
            })
        }
        let mut values = Document::new();
        values.insert("instance".into(), entry(&self.instance)?);
        values.insert("binding".into(), entry(&self.binding)?);
        values.insert("service".into(), entry(&self.service)?);
        values.insert("plan".into(), entry(&self.plan)?);
        Ok(values)
    }

    pub fn plan(&self, request: &RenderRequest) -> Result<&SFPlan> {
        self.plan
            .as_ref()
            .ok_or_else(|| Error::PlanNotFound(request.plan_id.clone()))
    }
}

/// Renders plan templates and applies the results
#[derive(Clone)]
pub struct ResourceManager {
    registry: Registry,
    payload_keys: PayloadKeys,
    delete_intent: HashSet<String>,
    /// Namespace holding SFService and SFPlan objects
    services_namespace: String,
    /// Attempts for writes that lose an optimistic concurrency race
    conflict_retries: u32,
}

impl ResourceManager {
    pub fn new(registry: Registry, config: &InteroperatorConfig, services_namespace: &str) -> Self {
        Self {
            registry,
            payload_keys: PayloadKeys::new(
                config.payload_keys.clone(),
                config.default_payload_keys.clone(),
            ),
            delete_intent: config.delete_intent_kinds.iter().cloned().collect(),
            services_namespace: services_namespace.to_string(),
            conflict_retries: config.error_threshold,
        }
    }

    pub fn conflict_retries(&self) -> u32 {
        self.conflict_retries
    }

    /// Fetches the instance, binding, service and plan named by `request`
    pub(crate) async fn entities(
        &self,
        store: &dyn ObjectStore,
        request: &RenderRequest,
    ) -> Result<Entities> {
        let mut entities = Entities::default();
        if !request.instance_id.is_empty() {
            entities.instance = Some(
                get_typed(store, &request.instance_id, &request.namespace)
                    .await?
                    .ok_or_else(|| Error::InstanceNotFound(request.instance_id.clone()))?,
            );
        }
        if !request.binding_id.is_empty() {
            entities.binding = Some(
                get_typed(store, &request.binding_id, &request.namespace)
                    .await?
                    .ok_or_else(|| Error::BindingNotFound(request.binding_id.clone()))?,
            );
        }
        if !request.service_id.is_empty() && !request.plan_id.is_empty() {
            let service: SFService = self
                .catalog_entry(store, &request.service_id, |s: &SFService| &s.spec.id)
                .await?
                .ok_or_else(|| Error::ServiceNotFound(request.service_id.clone()))?;
            let plan: SFPlan = self
                .catalog_entry(store, &request.plan_id, |p: &SFPlan| &p.spec.id)
                .await?
                .filter(|p| p.spec.service_id == request.service_id)
                .ok_or_else(|| Error::PlanNotFound(request.plan_id.clone()))?;
            entities.service = Some(service);
            entities.plan = Some(plan);
        }
        Ok(entities)
    }

    /// Looks a catalog object up by name, then by its `spec.id`
    async fn catalog_entry<K, F>(&self, store: &dyn ObjectStore, id: &str, id_of: F) -> Result<Option<K>>
    where
        K: kube::Resource<DynamicType = ()> + serde::de::DeserializeOwned,
        F: Fn(&K) -> &String,
    {
        if let Some(found) = get_typed::<K>(store, id, &self.services_namespace).await? {
            return Ok(Some(found));
        }
        let candidates = store
            .list(
                &K::api_version(&()),
                &K::kind(&()),
                &self.services_namespace,
                "",
            )
            .await?;
        for candidate in candidates {
            let candidate: K = from_dynamic(candidate)?;
            if id_of(&candidate) == id {
                return Ok(Some(candidate));
            }
        }
        debug!(id, kind = %K::kind(&()), "catalog entry not found");
        Ok(None)
    }
}

/// Sources produced by a pass that may have stopped early
#[derive(Debug, Default)]
pub struct Progress {
    pub sources: Vec<Source>,
    pub error: Option<Error>,
}

impl Progress {
    pub fn into_result(self) -> Result<Vec<Source>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.sources),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::resources::sfplans::actions;
    use crate::store::to_dynamic;
    use serde_json::json;

    #[test]
    fn payload_key_overrides_take_precedence() {
        let keys = PayloadKeys::new(
            [
                ("v1/ConfigMap".to_string(), "data".to_string()),
                ("Secret".to_string(), "stringData".to_string()),
            ]
            .into_iter()
            .collect(),
            vec!["spec".into(), "Spec".into(), "data".into()],
        );
        let doc = json!({"spec": {}, "data": {}});
        assert_eq!(keys.key_for("v1", "ConfigMap", &doc), Some("data"));
        assert_eq!(keys.key_for("v1", "Secret", &doc), Some("stringData"));
        assert_eq!(keys.key_for("apps/v1", "Deployment", &doc), Some("spec"));
        assert_eq!(keys.key_for("x/v1", "Thing", &json!({"Spec": 1})), Some("Spec"));
        assert_eq!(keys.key_for("x/v1", "Thing", &json!({"other": 1})), None);
    }

    #[tokio::test]
    async fn resolves_entities_by_name_or_id() {
        let store = store_with(plan(default_templates()));
        let mut renamed = service();
        renamed.metadata.name = Some("catalog-postgres".into());
        renamed.spec.id = "svc-other".into();
        store.insert(to_dynamic(&renamed).unwrap());
        store.insert(to_dynamic(&instance("inst-1", in_queue())).unwrap());

        let manager = manager();
        let mut request = RenderRequest::for_instance(&instance("inst-1", in_queue()), actions::PROVISION);
        let entities = manager.entities(store.as_ref(), &request).await.unwrap();
        assert!(entities.instance.is_some());
        assert!(entities.binding.is_none());
        assert_eq!(entities.plan.unwrap().spec.id, "plan-small");

        request.service_id = "svc-other".into();
        let err = manager.entities(store.as_ref(), &request).await.unwrap_err();
        assert!(matches!(err, Error::PlanNotFound(_)));

        request.service_id = "svc-missing".into();
        let err = manager.entities(store.as_ref(), &request).await.unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound(id) if id == "svc-missing"));
    }

    #[tokio::test]
    async fn missing_instance_is_typed() {
        let store = store_with(plan(default_templates()));
        let request = RenderRequest::for_instance(&instance("ghost", in_queue()), actions::PROVISION);
        let err = manager().entities(store.as_ref(), &request).await.unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound(id) if id == "ghost"));
    }

    #[test]
    fn values_expose_every_entity() {
        let entities = Entities {
            instance: Some(instance("inst-1", in_queue())),
            ..Default::default()
        };
        let values = entities.values().unwrap();
        assert_eq!(values["instance"]["spec"]["planId"], json!("plan-small"));
        assert_eq!(values["instance"]["metadata"]["name"], json!("inst-1"));
        assert_eq!(values["binding"], json!({}));
        assert_eq!(values["plan"], json!({}));
    }

    #[test]
    fn progress_surfaces_errors() {
        let ok = Progress {
            sources: vec![postgres_source("a")],
            error: None,
        };
        assert_eq!(ok.into_result().unwrap().len(), 1);
        let failed = Progress {
            sources: vec![],
            error: Some(Error::Conflict("x".into())),
        };
        assert!(failed.into_result().is_err());
    }
}
