use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::*;

use super::{RenderRequest, ResourceManager};
use crate::dynamic::{self, Document};
use crate::store::{from_document, ObjectStore};
use crate::{Error, Result};

impl ResourceManager {
    /// Renders the plan template for `request.action` into resources in `request.namespace`.
    ///
    /// Rendered files and documents that do not convert into a resource are skipped.
    pub async fn compute_expected_resources(
        &self,
        store: &dyn ObjectStore,
        request: &RenderRequest,
    ) -> Result<Vec<DynamicObject>> {
        let entities = self.entities(store, request).await?;
        let template = entities.plan(request)?.template(&request.action)?;
        let output = self
            .registry
            .render(
                template,
                request.render_name(),
                &request.namespace,
                entities.values()?,
            )
            .await?;

        let mut resources = vec![];
        for file in output.list_files() {
            let content = match output.file_content(&file) {
                Ok(content) => content,
                Err(err) => {
                    warn!(file, "skipping rendered file: {err}");
                    continue;
                }
            };
            for doc in dynamic::partition_documents(&file, &content) {
                match into_resource(doc, &request.namespace) {
                    Ok(resource) => resources.push(resource),
                    Err(err) => warn!(file, "skipping rendered document: {err}"),
                }
            }
        }
        debug!(
            action = %request.action,
            count = resources.len(),
            "computed expected resources"
        );
        Ok(resources)
    }
}

/// Stamps `namespace` on a rendered document and checks it names a resource
fn into_resource(mut doc: Document, namespace: &str) -> Result<DynamicObject> {
    let metadata = doc
        .entry("metadata")
        .or_insert_with(|| Value::Object(Document::new()));
    let Value::Object(metadata) = metadata else {
        return Err(Error::Conversion("metadata is not a mapping".into()));
    };
    metadata.insert("namespace".into(), Value::String(namespace.to_string()));

    for field in ["apiVersion", "kind"] {
        if !doc.get(field).is_some_and(Value::is_string) {
            return Err(Error::Conversion(format!("{field} is missing")));
        }
    }
    let resource = from_document(doc)?;
    if resource.meta().name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::Conversion("metadata.name is missing".into()));
    }
    Ok(resource)
}

/// Makes `owner` the controller of every resource
pub fn set_owner_reference<K>(owner: &K, resources: &mut [DynamicObject]) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::Precondition(format!("{} has no uid yet", owner.name_any()))
    })?;
    for resource in resources.iter_mut() {
        let refs = resource.owner_references_mut();
        refs.retain(|r| r.uid != owner_ref.uid);
        refs.push(owner_ref.clone());
    }
    Ok(())
}
