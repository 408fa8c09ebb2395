use async_trait::async_trait;

use super::{functions, RenderInput, RenderOutput, Renderer};
use crate::dynamic::Document;
use crate::resources::sfplans::TemplateSpec;
use crate::{Error, Result};

/// Template type handled by [`TemplateRenderer`]
pub const TYPE: &str = "gotemplate";

/// The single file produced by a text template
pub const MAIN_FILE: &str = "main";

/// Renders inline template text with the helper functions from [`functions`]
pub struct TemplateRenderer;

impl TemplateRenderer {
    /// Renders `content` synchronously
    pub fn render_text(name: &str, content: &str, values: &Document) -> Result<String> {
        functions::environment()
            .render_named_str(name, content, values)
            .map_err(|e| Error::renderer(TYPE, format!("{e:#}")))
    }
}

#[async_trait]
impl Renderer for TemplateRenderer {
    fn input(
        &self,
        template: &TemplateSpec,
        name: &str,
        _namespace: &str,
        values: Document,
    ) -> Result<RenderInput> {
        let content = template.text()?.ok_or_else(|| {
            Error::InvalidInput(format!("{} template has no content", template.action))
        })?;
        Ok(RenderInput::Template {
            name: name.to_string(),
            content,
            values,
        })
    }

    async fn render(&self, input: RenderInput) -> Result<Box<dyn RenderOutput>> {
        match input {
            RenderInput::Template {
                name,
                content,
                values,
            } => Ok(Box::new(TemplateOutput::new(Self::render_text(
                &name, &content, &values,
            )?))),
            RenderInput::Chart { .. } => Err(Error::InvalidInput(format!(
                "{TYPE} renderer cannot render a chart"
            ))),
        }
    }
}

#[derive(Debug)]
pub struct TemplateOutput {
    content: String,
}

impl TemplateOutput {
    pub fn new(content: String) -> Self {
        Self { content }
    }
}

impl RenderOutput for TemplateOutput {
    fn list_files(&self) -> Vec<String> {
        vec![MAIN_FILE.to_string()]
    }

    fn file_content(&self, name: &str) -> Result<String> {
        if name == MAIN_FILE {
            Ok(self.content.clone())
        } else {
            Err(Error::FileNotFound(name.to_string()))
        }
    }
}
