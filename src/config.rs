use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::resources::ApiVersionKind;
use crate::Result;

/// Key of the config map entry holding the YAML configuration
pub const CONFIG_MAP_KEY: &str = "config";

pub const DEFAULT_INSTANCE_WORKER_COUNT: u16 = 2;
pub const DEFAULT_BINDING_WORKER_COUNT: u16 = 4;
pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;

/// Runtime tunables, read from the operator config map
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InteroperatorConfig {
    pub instance_worker_count: u16,
    pub binding_worker_count: u16,
    /// Consecutive errors tolerated before an object is marked failed
    pub error_threshold: u32,
    /// Kinds whose objects owned by an instance re-trigger its reconciliation
    pub instance_controller_watch_list: Vec<ApiVersionKind>,
    /// Kinds whose objects owned by a binding re-trigger its reconciliation
    pub binding_controller_watch_list: Vec<ApiVersionKind>,
    /// Payload key to diff, by `apiVersion/kind` or by `kind`
    pub payload_keys: BTreeMap<String, String>,
    /// Payload keys tried in order when no override matches
    pub default_payload_keys: Vec<String>,
    /// apiVersions whose resources are asked to delete themselves through `status.state`
    pub delete_intent_kinds: Vec<String>,
}

impl Default for InteroperatorConfig {
    fn default() -> Self {
        Self {
            instance_worker_count: DEFAULT_INSTANCE_WORKER_COUNT,
            binding_worker_count: DEFAULT_BINDING_WORKER_COUNT,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            instance_controller_watch_list: vec![],
            binding_controller_watch_list: vec![],
            payload_keys: BTreeMap::new(),
            default_payload_keys: default_payload_keys(),
            delete_intent_kinds: default_delete_intent_kinds(),
        }
    }
}

fn default_payload_keys() -> Vec<String> {
    ["spec", "Spec", "SPEC", "data"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_delete_intent_kinds() -> Vec<String> {
    [
        "deployment.servicefabrik.io/v1alpha1",
        "bind.servicefabrik.io/v1alpha1",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl InteroperatorConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config.with_defaults())
    }

    /// Replaces zero and empty values with defaults
    pub fn with_defaults(mut self) -> Self {
        if self.instance_worker_count == 0 {
            self.instance_worker_count = DEFAULT_INSTANCE_WORKER_COUNT;
        }
        if self.binding_worker_count == 0 {
            self.binding_worker_count = DEFAULT_BINDING_WORKER_COUNT;
        }
        if self.error_threshold == 0 {
            self.error_threshold = DEFAULT_ERROR_THRESHOLD;
        }
        if self.default_payload_keys.is_empty() {
            self.default_payload_keys = default_payload_keys();
        }
        self
    }

    /// Reads the config map, falling back to defaults when it does not exist
    pub async fn load(client: Client, namespace: &str, name: &str) -> Result<Self> {
        let api: Api<ConfigMap> = Api::namespaced(client, namespace);
        let Some(config_map) = api.get_opt(name).await? else {
            info!(namespace, name, "config map not found, using defaults");
            return Ok(Self::default());
        };
        let content = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(CONFIG_MAP_KEY))
            .map(String::as_str)
            .unwrap_or_default();
        let config = Self::from_yaml(content)?;
        debug!(?config, "loaded interoperator config");
        Ok(config)
    }
}
