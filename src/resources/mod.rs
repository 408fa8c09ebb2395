use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod sfplans;
pub mod sfservicebindings;
pub mod sfserviceinstances;
pub mod sfservices;

/// API group of every custom resource owned by this operator
pub const GROUP: &str = "osb.servicefabrik.io";

/// Finalizer placed on instances and bindings until their rendered resources are gone
pub static INTEROPERATOR_FINALIZER: &str = "interoperator.servicefabrik.io";

/// Label recording the last operation that was dispatched downstream
pub const LAST_OPERATION_LABEL: &str = "state";

/// Label counting consecutive reconciliation errors
pub const ERROR_COUNT_LABEL: &str = "error-count";

/// Lifecycle states shared by instances and bindings
pub mod state {
    pub const IN_QUEUE: &str = "in_queue";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const IN_PROGRESS: &str = "in progress";
    pub const SUCCEEDED: &str = "succeeded";
    pub const FAILED: &str = "failed";
}

/// A weak reference to a resource created from a rendered template
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl Source {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {}/{}",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

/// An `{apiVersion, kind}` pair, used for watch lists and per-kind overrides
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersionKind {
    pub api_version: String,
    pub kind: String,
}

/// Schema for free-form payloads such as `context` or `parameters`
pub(crate) fn preserve_unknown_fields(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    }))
    .unwrap()
}
