use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// SFService is a broker catalog entry. Instances and bindings reference it by id.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "SFService",
    group = "osb.servicefabrik.io",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"Display Name", "type":"string", "jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(shortname = "sfservice")]
#[serde(rename_all = "camelCase")]
pub struct SFServiceSpec {
    pub name: String,
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub instance_retrievable: bool,
    #[serde(default)]
    pub binding_retrievable: bool,
    #[serde(default)]
    pub plan_updatable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_client: Option<DashboardClient>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::resources::preserve_unknown_fields")]
    pub context: Option<serde_json::Value>,
}

/// OAuth client used by the service dashboard
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DashboardClient {
    pub id: Option<String>,
    pub secret: Option<String>,
    pub redirect_uri: Option<String>,
}
