//! Packaged chart renderer.
//!
//! A chart is a directory (or gzipped tarball of one) holding `Chart.yaml`, `values.yaml`,
//! `templates/`, `crds/` and dependency charts under `charts/`. Templates use the same
//! syntax and helpers as inline plan templates and see `Values`, `Release` and `Chart`.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::*;

use super::{functions, template::TemplateRenderer, RenderInput, RenderOutput, Renderer};
use crate::dynamic::{self, Document};
use crate::resources::sfplans::TemplateSpec;
use crate::{Error, Result};

/// Template type handled by [`ChartRenderer`]
pub const TYPE: &str = "helm";

const NOTES_FILE: &str = "NOTES.txt";

/// Release name for a managed object, short enough for any chart naming scheme
pub fn release_name(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("in-{hex}")
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub repository: String,
    /// Comma separated value paths, the first one that resolves to a bool decides
    #[serde(default)]
    pub condition: String,
    pub enabled: Option<bool>,
    pub alias: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub values: Document,
    /// Template sources keyed by their path below `templates/`
    pub templates: BTreeMap<String, String>,
    /// Custom resource definitions keyed by their path below `crds/`
    pub crds: BTreeMap<String, String>,
    pub dependencies: Vec<Chart>,
}

impl Chart {
    /// Builds a chart from files keyed by their path relative to the chart root
    pub fn from_files(files: BTreeMap<String, Vec<u8>>) -> Result<Chart> {
        let text = |bytes: &[u8], path: &str| {
            String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::renderer(TYPE, format!("{path} is not utf-8: {e}")))
        };

        let chart_yaml = files
            .get("Chart.yaml")
            .ok_or_else(|| Error::renderer(TYPE, "Chart.yaml is missing"))?;
        let metadata: ChartMetadata = serde_yaml::from_slice(chart_yaml)?;

        let values = match files.get("values.yaml") {
            Some(bytes) => {
                let content = text(bytes, "values.yaml")?;
                if content.trim().is_empty() {
                    Document::new()
                } else {
                    dynamic::document_from_str(&content)?
                }
            }
            None => Document::new(),
        };

        let mut chart = Chart {
            metadata,
            values,
            ..Default::default()
        };
        let mut subcharts: BTreeMap<String, BTreeMap<String, Vec<u8>>> = BTreeMap::new();
        for (path, bytes) in &files {
            if let Some(rel) = path.strip_prefix("templates/") {
                chart.templates.insert(rel.to_string(), text(bytes, path)?);
            } else if let Some(rel) = path.strip_prefix("crds/") {
                chart.crds.insert(rel.to_string(), text(bytes, path)?);
            } else if let Some(rel) = path.strip_prefix("charts/") {
                match rel.split_once('/') {
                    Some((dir, inner)) => {
                        subcharts
                            .entry(dir.to_string())
                            .or_default()
                            .insert(inner.to_string(), bytes.clone());
                    }
                    None if rel.ends_with(".tgz") => {
                        chart.dependencies.push(Chart::from_archive(bytes)?);
                    }
                    None => {}
                }
            }
        }
        for (_, files) in subcharts {
            chart.dependencies.push(Chart::from_files(files)?);
        }
        Ok(chart)
    }

    /// Loads a gzipped tarball whose entries share a top-level chart directory
    pub fn from_archive(bytes: &[u8]) -> Result<Chart> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut files = BTreeMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.into_owned();
            let Some(rel) = strip_root(&path) else {
                continue;
            };
            let mut content = vec![];
            entry.read_to_end(&mut content)?;
            files.insert(rel, content);
        }
        Chart::from_files(files)
    }

    /// Loads an unpacked chart directory
    pub fn from_dir(dir: &Path) -> Result<Chart> {
        let mut files = BTreeMap::new();
        collect_files(dir, dir, &mut files)?;
        Chart::from_files(files)
    }

    /// Loads a local chart directory or archive
    pub fn from_path(path: &Path) -> Result<Chart> {
        if path.is_dir() {
            Chart::from_dir(path)
        } else {
            Chart::from_archive(&std::fs::read(path)?)
        }
    }
}

/// Drops the archive's top-level directory, rejecting paths that escape it
fn strip_root(path: &Path) -> Option<String> {
    let mut components = path.components();
    components.next()?;
    let rest: PathBuf = components
        .map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect::<Option<PathBuf>>()?;
    let rel = rest.to_str()?.replace('\\', "/");
    (!rel.is_empty()).then_some(rel)
}

fn collect_files(root: &Path, dir: &Path, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            files.insert(rel, std::fs::read(&path)?);
        }
    }
    Ok(())
}

/// Remote charts downloaded so far, keyed by URL. Shared by every renderer instance.
#[derive(Clone, Default)]
pub struct ChartCache {
    charts: Arc<RwLock<HashMap<String, Arc<Chart>>>>,
}

impl ChartCache {
    async fn load(&self, locator: &str) -> Result<Arc<Chart>> {
        if !is_remote(locator) {
            return Ok(Arc::new(Chart::from_path(Path::new(locator))?));
        }
        if let Some(chart) = self.charts.read().await.get(locator) {
            return Ok(chart.clone());
        }
        info!(url = locator, "downloading chart");
        let bytes = reqwest::get(locator)
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let chart = Arc::new(Chart::from_archive(&bytes)?);
        self.charts
            .write()
            .await
            .insert(locator.to_string(), chart.clone());
        Ok(chart)
    }
}

fn is_remote(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

pub struct ChartRenderer {
    cache: ChartCache,
}

impl ChartRenderer {
    pub fn new(cache: ChartCache) -> Self {
        Self { cache }
    }

    /// Renders every template of `chart` and its enabled dependencies
    pub fn render_chart(
        chart: &Chart,
        release_name: &str,
        namespace: &str,
        overrides: &Document,
    ) -> Result<ChartOutput> {
        let mut values = chart.values.clone();
        merge(&mut values, overrides);
        let release = json!({
            "Name": release_name,
            "Namespace": namespace,
            "Revision": 1,
            "IsInstall": true,
            "IsUpgrade": false,
            "Service": "interoperator",
        });
        let mut rendered = Rendered::default();
        render_into(chart, &chart.metadata.name, &values, &release, &mut rendered)?;
        rendered
            .templates
            .retain(|key, _| !key.ends_with(NOTES_FILE));
        Ok(ChartOutput::new(rendered))
    }
}

#[async_trait]
impl Renderer for ChartRenderer {
    fn input(
        &self,
        template: &TemplateSpec,
        name: &str,
        namespace: &str,
        values: Document,
    ) -> Result<RenderInput> {
        if template.url.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{} template has no chart url",
                template.action
            )));
        }
        Ok(RenderInput::Chart {
            locator: template.url.clone(),
            release_name: release_name(name),
            namespace: namespace.to_string(),
            values_template: template.text()?,
            values,
        })
    }

    async fn render(&self, input: RenderInput) -> Result<Box<dyn RenderOutput>> {
        let RenderInput::Chart {
            locator,
            release_name,
            namespace,
            values_template,
            values,
        } = input
        else {
            return Err(Error::InvalidInput(format!(
                "{TYPE} renderer needs a chart input"
            )));
        };

        let overrides = match values_template {
            Some(text) => {
                let rendered = TemplateRenderer::render_text(&release_name, &text, &values)?;
                if rendered.trim().is_empty() {
                    Document::new()
                } else {
                    dynamic::document_from_str(&rendered)?
                }
            }
            None => Document::new(),
        };

        let chart = self.cache.load(&locator).await?;
        debug!(chart = %chart.metadata.name, release = %release_name, "rendering chart");
        Ok(Box::new(Self::render_chart(
            &chart,
            &release_name,
            &namespace,
            &overrides,
        )?))
    }
}

#[derive(Default)]
struct Rendered {
    crds: BTreeMap<String, String>,
    templates: BTreeMap<String, String>,
}

fn render_into(
    chart: &Chart,
    prefix: &str,
    values: &Document,
    release: &Value,
    out: &mut Rendered,
) -> Result<()> {
    for (rel, content) in &chart.crds {
        out.crds
            .insert(format!("{prefix}/crds/{rel}"), content.clone());
    }

    let mut env = functions::environment();
    for (rel, source) in &chart.templates {
        env.add_template_owned(rel.clone(), source.clone())
            .map_err(|e| Error::renderer(TYPE, format!("{prefix}/templates/{rel}: {e:#}")))?;
    }
    let ctx = json!({
        "Values": values,
        "Release": release,
        "Chart": {
            "Name": chart.metadata.name,
            "Version": chart.metadata.version,
            "AppVersion": chart.metadata.app_version,
        },
    });
    for rel in chart.templates.keys() {
        if is_partial(rel) {
            continue;
        }
        let rendered = env
            .get_template(rel)
            .and_then(|t| t.render(&ctx))
            .map_err(|e| Error::renderer(TYPE, format!("{prefix}/templates/{rel}: {e:#}")))?;
        out.templates
            .insert(format!("{prefix}/templates/{rel}"), rendered);
    }

    for dependency in &chart.dependencies {
        let declared = chart
            .metadata
            .dependencies
            .iter()
            .find(|d| d.name == dependency.metadata.name);
        if let Some(declared) = declared {
            if !is_enabled(declared, values) {
                debug!(dependency = %declared.name, "dependency disabled");
                continue;
            }
        }
        let name = declared
            .and_then(|d| d.alias.clone())
            .unwrap_or_else(|| dependency.metadata.name.clone());
        let scoped = scoped_values(dependency, &name, values);
        render_into(
            dependency,
            &format!("{prefix}/charts/{name}"),
            &scoped,
            release,
            out,
        )?;
    }

    let missing: Vec<&str> = chart
        .metadata
        .dependencies
        .iter()
        .filter(|d| !chart.dependencies.iter().any(|c| c.metadata.name == d.name))
        .map(|d| d.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(Error::renderer(
            TYPE,
            format!(
                "{prefix}: dependencies {} declared in Chart.yaml are missing from charts/",
                missing.join(", ")
            ),
        ));
    }
    Ok(())
}

fn is_partial(rel: &str) -> bool {
    rel.rsplit('/').next().is_some_and(|base| base.starts_with('_'))
}

fn is_enabled(dependency: &Dependency, values: &Document) -> bool {
    for path in dependency.condition.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mut current = values.get(path.split('.').next().unwrap_or_default());
        for part in path.split('.').skip(1) {
            current = current.and_then(|v| v.get(part));
        }
        if let Some(Value::Bool(enabled)) = current {
            return *enabled;
        }
    }
    dependency.enabled.unwrap_or(true)
}

/// A dependency sees its own defaults, overridden by the parent's `<name>` section and `global`
fn scoped_values(dependency: &Chart, name: &str, parent: &Document) -> Document {
    let mut values = dependency.values.clone();
    if let Some(Value::Object(section)) = parent.get(name) {
        merge(&mut values, section);
    }
    if let Some(Value::Object(global)) = parent.get("global") {
        let mut scoped_global = match values.remove("global") {
            Some(Value::Object(own)) => own,
            _ => Document::new(),
        };
        merge(&mut scoped_global, global);
        values.insert("global".to_string(), Value::Object(scoped_global));
    }
    values
}

/// Deep merges `overrides` into `base`; maps merge, everything else is replaced
pub fn merge(base: &mut Document, overrides: &Document) {
    for (key, value) in overrides {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge(existing, incoming),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Rendered chart files, exposed by base name
#[derive(Debug)]
pub struct ChartOutput {
    files: Vec<(String, String)>,
}

impl ChartOutput {
    /// Files are keyed `<chart>/templates/<file>`, `<chart>/crds/<file>` or below
    /// `<chart>/charts/<dependency>/`. CRDs of every chart come first.
    fn new(rendered: Rendered) -> Self {
        let keyed: Vec<(String, String)> = rendered
            .crds
            .into_iter()
            .chain(rendered.templates)
            .collect();
        let mut seen: HashMap<String, usize> = HashMap::new();
        for (key, _) in &keyed {
            *seen.entry(base_name(key).to_string()).or_default() += 1;
        }
        let files = keyed
            .into_iter()
            .map(|(key, content)| {
                let base = base_name(&key).to_string();
                let name = if seen[&base] > 1 { key } else { base };
                (name, content)
            })
            .collect();
        Self { files }
    }
}

fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

impl RenderOutput for ChartOutput {
    fn list_files(&self) -> Vec<String> {
        self.files.iter().map(|(name, _)| name.clone()).collect()
    }

    fn file_content(&self, name: &str) -> Result<String> {
        self.files
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| Error::FileNotFound(name.to_string()))
    }
}
