use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dynamic::Document;
use crate::resources::sfplans::TemplateSpec;
use crate::{Error, Result};

pub mod chart;
pub mod functions;
pub mod template;

pub use chart::{ChartCache, ChartRenderer};
pub use template::TemplateRenderer;

/// What a renderer works on. Each renderer accepts one variant.
#[derive(Clone, Debug)]
pub enum RenderInput {
    /// Inline template text rendered against a flat map of named contexts
    Template {
        name: String,
        content: String,
        values: Document,
    },
    /// A chart locator plus the template rendered into override values
    Chart {
        locator: String,
        release_name: String,
        namespace: String,
        values_template: Option<String>,
        values: Document,
    },
}

/// Rendered files
pub trait RenderOutput: Send + Sync + fmt::Debug {
    /// Names of all rendered files
    fn list_files(&self) -> Vec<String>;

    /// Content of a rendered file, `Error::FileNotFound` for unknown names
    fn file_content(&self, name: &str) -> Result<String>;
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Builds the input for `template` against the named contexts in `values`
    fn input(
        &self,
        template: &TemplateSpec,
        name: &str,
        namespace: &str,
        values: Document,
    ) -> Result<RenderInput>;

    async fn render(&self, input: RenderInput) -> Result<Box<dyn RenderOutput>>;
}

type Constructor = Arc<dyn Fn() -> Arc<dyn Renderer> + Send + Sync>;

/// Maps a template type (`gotemplate`, `helm`) to the renderer that handles it
#[derive(Clone)]
pub struct Registry {
    constructors: HashMap<String, Constructor>,
}

impl Default for Registry {
    fn default() -> Self {
        let charts = ChartCache::default();
        Self::empty()
            .register(template::TYPE, || Arc::new(TemplateRenderer))
            .register(chart::TYPE, move || {
                Arc::new(ChartRenderer::new(charts.clone()))
            })
    }
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register<F>(mut self, kind: &str, constructor: F) -> Self
    where
        F: Fn() -> Arc<dyn Renderer> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.to_string(), Arc::new(constructor));
        self
    }

    pub fn renderer(&self, kind: &str) -> Result<Arc<dyn Renderer>> {
        self.constructors
            .get(kind)
            .map(|constructor| constructor())
            .ok_or_else(|| Error::renderer(kind, "no renderer registered for this template type"))
    }

    /// Renders `template` with the renderer registered for its type
    pub async fn render(
        &self,
        template: &TemplateSpec,
        name: &str,
        namespace: &str,
        values: Document,
    ) -> Result<Box<dyn RenderOutput>> {
        let renderer = self.renderer(&template.type_)?;
        let input = renderer.input(template, name, namespace, values)?;
        renderer.render(input).await
    }
}

/// The file to read from `output`: `preferred` when rendered, otherwise the first file
pub fn select_file(output: &dyn RenderOutput, preferred: &str) -> Result<String> {
    let files = output.list_files();
    let name = files
        .iter()
        .find(|f| f.as_str() == preferred)
        .or_else(|| files.first())
        .ok_or_else(|| Error::FileNotFound(preferred.to_string()))?;
    output.file_content(name)
}
