use base64::{engine::general_purpose::STANDARD, Engine};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Template actions understood by the controllers
pub mod actions {
    pub const PROVISION: &str = "provision";
    pub const BIND: &str = "bind";
    pub const UNBIND: &str = "unbind";
    pub const SOURCES: &str = "sources";
    pub const STATUS: &str = "status";
    pub const CLUSTER_SELECTOR: &str = "clusterSelector";
}

/// SFPlan is a service tier of an SFService. It carries the templates that are rendered
/// for every lifecycle action of instances and bindings created against it.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "SFPlan",
    group = "osb.servicefabrik.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Plan", "type":"string", "jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Service", "type":"string", "jsonPath":".spec.serviceId"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(shortname = "sfplan")]
#[serde(rename_all = "camelCase")]
pub struct SFPlanSpec {
    /// The catalog name of the plan
    pub name: String,
    /// Unique id of the plan
    pub id: String,
    pub description: String,
    /// Id of the SFService this plan belongs to
    pub service_id: String,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updatable: bool,
    #[serde(default)]
    pub auto_update_instances: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub maintenance_info: Option<serde_json::Value>,
    /// Parameter schemas published to the broker catalog
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub schemas: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub manager: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub context: Option<serde_json::Value>,
    /// Ordered templates; the first template for an action wins
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
}

/// A single plan template
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    /// One of provision, bind, unbind, sources, status, clusterSelector
    pub action: String,
    /// Renderer used for this template, `gotemplate` or `helm`
    #[serde(rename = "type")]
    pub type_: String,
    /// Location of a chart for chart based templates
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Inline template text
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    /// Base64 encoded template text, used when `content` is empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_encoded: String,
}

impl TemplateSpec {
    /// The template text, decoding `contentEncoded` when no inline content is set
    pub fn text(&self) -> Result<Option<String>> {
        if !self.content.is_empty() {
            return Ok(Some(self.content.clone()));
        }
        if self.content_encoded.is_empty() {
            return Ok(None);
        }
        let bytes = STANDARD
            .decode(self.content_encoded.trim())
            .map_err(|e| Error::InvalidInput(format!("contentEncoded is not base64: {e}")))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("contentEncoded is not utf-8: {e}")))
    }
}

impl SFPlan {
    /// Looks up the template for `action`, first match wins
    pub fn template(&self, action: &str) -> Result<&TemplateSpec> {
        self.spec
            .templates
            .iter()
            .find(|t| t.action == action)
            .ok_or_else(|| Error::TemplateNotFound {
                action: action.to_string(),
                plan_id: self.spec.id.clone(),
            })
    }
}
