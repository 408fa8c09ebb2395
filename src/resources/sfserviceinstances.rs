use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resources::Source;

/// SFServiceInstance is a provisioned service instance. Its plan's `provision` template is
/// rendered into downstream resources and its `status` template reports back on them.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    kind = "SFServiceInstance",
    group = "osb.servicefabrik.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Plan", "type":"string", "jsonPath":".spec.planId"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "SFServiceInstanceStatus", shortname = "sfsi")]
#[serde(rename_all = "camelCase")]
pub struct SFServiceInstanceSpec {
    pub service_id: String,
    pub plan_id: String,
    /// Id assigned by the broker, usually equal to the object name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization_guid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub space_guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub previous_values: Option<serde_json::Value>,
    /// Cluster the instance was scheduled to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
}

/// Status of the SFServiceInstance
/// This is set and managed automatically by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SFServiceInstanceStatus {
    /// Lifecycle state: in_queue, update, delete, in progress, succeeded or failed
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dashboard_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_usable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_repeatable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<SFServiceInstanceSpec>,
    /// Resources applied from the rendered templates, the ground truth for pruning
    #[serde(default)]
    pub resources: Vec<Source>,
}

impl SFServiceInstance {
    /// Broker id, falling back to the object name
    pub fn instance_id(&self) -> String {
        if self.spec.instance_id.is_empty() {
            kube::ResourceExt::name_any(self)
        } else {
            self.spec.instance_id.clone()
        }
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
