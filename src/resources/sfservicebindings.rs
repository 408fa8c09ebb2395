use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resources::Source;

/// SFServiceBinding binds an application to an SFServiceInstance. Its plan's `bind`
/// template is rendered into resources and the computed bind response is kept in a Secret.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "SFServiceBinding",
    group = "osb.servicefabrik.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Instance", "type":"string", "jsonPath":".spec.instanceId"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "SFServiceBindingStatus", shortname = "sfsb")]
#[serde(rename_all = "camelCase")]
pub struct SFServiceBindingSpec {
    /// Id assigned by the broker, usually equal to the object name
    pub id: String,
    pub instance_id: String,
    pub plan_id: String,
    pub service_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub bind_resource: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub accepts_incomplete: bool,
}

/// Status of the SFServiceBinding
/// This is set and managed automatically by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SFServiceBindingStatus {
    /// Lifecycle state: in_queue, delete, in progress, succeeded or failed
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub response: BindingResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<SFServiceBindingSpec>,
    /// Resources applied from the rendered templates, the ground truth for pruning
    #[serde(default)]
    pub resources: Vec<Source>,
}

/// Where the bind response (credentials) can be found
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BindingResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_ref: String,
}

impl SFServiceBinding {
    /// Broker id, falling back to the object name
    pub fn binding_id(&self) -> String {
        if self.spec.id.is_empty() {
            kube::ResourceExt::name_any(self)
        } else {
            self.spec.id.clone()
        }
    }

    /// Name of the Secret holding the bind response
    pub fn secret_name(&self) -> String {
        format!("sf-{}", self.binding_id())
    }

    pub fn state(&self) -> &str {
        self.status.as_ref().map(|s| s.state.as_str()).unwrap_or_default()
    }

    pub fn resources(&self) -> Vec<Source> {
        self.status
            .as_ref()
            .map(|s| s.resources.clone())
            .unwrap_or_default()
    }
}
