use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::*;

use super::{RenderRequest, ResourceManager};
use crate::renderer::select_file;
use crate::resources::sfplans::actions;
use crate::resources::Source;
use crate::store::ObjectStore;
use crate::Result;

pub const SOURCES_FILE: &str = "sources.yaml";
pub const STATUS_FILE: &str = "status.yaml";

/// Status computed from the observed state of rendered resources.
///
/// Produced fresh on every reconciliation, each operation reported independently.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Status {
    pub provision: ProvisionStatus,
    pub bind: GenericStatus,
    pub unbind: GenericStatus,
    pub deprovision: GenericStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvisionStatus {
    pub state: String,
    #[serde(deserialize_with = "text")]
    pub error: String,
    #[serde(deserialize_with = "text")]
    pub response: String,
    #[serde(rename = "dashboardUrl", alias = "dashboardURL")]
    pub dashboard_url: String,
    #[serde(deserialize_with = "optional_text")]
    pub instance_usable: Option<String>,
    #[serde(deserialize_with = "optional_text")]
    pub update_repeatable: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct GenericStatus {
    pub state: String,
    #[serde(deserialize_with = "text")]
    pub error: String,
    #[serde(deserialize_with = "text")]
    pub response: String,
}

/// Scalars as written, structured values as JSON
fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(optional_text(deserializer)?.unwrap_or_default())
}

fn optional_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        structured => Some(structured.to_string()),
    })
}

/// Parses the rendered sources template: logical name to resource reference
pub fn parse_sources(content: &str) -> Result<BTreeMap<String, Source>> {
    let sources: Option<BTreeMap<String, Source>> = serde_yaml::from_str(content)?;
    Ok(sources.unwrap_or_default())
}

/// Parses the rendered status template
pub fn parse_status(content: &str) -> Result<Status> {
    let status: Option<Status> = serde_yaml::from_str(content)?;
    Ok(status.unwrap_or_default())
}

impl ResourceManager {
    /// Renders the `sources` template, observes the referenced resources in `target` and
    /// renders the `status` template against them.
    ///
    /// Sources that cannot be fetched are left out. Failing to render or parse either
    /// template is an error.
    pub async fn compute_status(
        &self,
        source: &dyn ObjectStore,
        target: &dyn ObjectStore,
        request: &RenderRequest,
    ) -> Result<Status> {
        let entities = self.entities(source, request).await?;
        let plan = entities.plan(request)?;
        let mut values = entities.values()?;

        let sources_template = plan.template(actions::SOURCES)?;
        let output = self
            .registry
            .render(
                sources_template,
                request.render_name(),
                &request.namespace,
                values.clone(),
            )
            .await?;
        let sources = parse_sources(&select_file(output.as_ref(), SOURCES_FILE)?)?;

        for (name, mut reference) in sources {
            if reference.name.is_empty() {
                debug!(source = %name, "skipping unnamed source");
                continue;
            }
            if reference.namespace.is_empty() {
                reference.namespace = request.namespace.clone();
            }
            match target.get(&reference).await {
                Ok(Some(live)) => {
                    values.insert(name, serde_json::to_value(live)?);
                }
                Ok(None) => debug!(source = %name, resource = %reference, "source not found"),
                Err(err) => warn!(source = %name, resource = %reference, "failed to fetch source: {err}"),
            }
        }

        let status_template = plan.template(actions::STATUS)?;
        let output = self
            .registry
            .render(
                status_template,
                request.render_name(),
                &request.namespace,
                values,
            )
            .await?;
        let status = parse_status(&select_file(output.as_ref(), STATUS_FILE)?)?;
        trace!(?status, "computed status");
        Ok(status)
    }
}
