//! Rendering of ObjectTemplate templates against matrix contexts
//!
//! Every context is rendered on its own blocking task. All contexts are
//! always rendered to completion; failures are aggregated afterwards and
//! fail the whole render so that a partially rendered matrix is never
//! applied.

use crate::crd::{ObjectTemplate, Template, TemplateSource};
use crate::error::{AggregateError, Error, RenderError, Result};
use crate::matrix::MatrixContext;
use futures::{StreamExt, stream};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

mod engine;

pub use engine::HandlebarsEngine;

/// Renders strings and structured documents against a variable context
pub trait TemplateEngine: Send + Sync {
    fn render_string(&self, text: &str, variables: &Value) -> Result<String, RenderError>;

    /// Render every string scalar and map key of `document` in place
    fn render_structured(&self, document: &mut Value, variables: &Value) -> Result<(), RenderError> {
        match document {
            Value::String(s) => *s = self.render_string(s, variables)?,
            Value::Array(items) => {
                for item in items {
                    self.render_structured(item, variables)?;
                }
            }
            Value::Object(map) => {
                for (key, mut value) in std::mem::take(map) {
                    let key = self.render_string(&key, variables)?;
                    self.render_structured(&mut value, variables)?;
                    map.insert(key, value);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Variables shared by every context of a pass: the template itself,
/// available as `objectTemplate`
pub fn base_variables(template: &ObjectTemplate) -> Result<Value> {
    let this = serde_json::to_value(template).map_err(Error::decode)?;
    Ok(json!({ "objectTemplate": this }))
}

/// Render all `templates` for one context
pub fn render_context(
    engine: &dyn TemplateEngine,
    templates: &[Template],
    context: &MatrixContext,
    base: &Value,
) -> Result<Vec<Value>> {
    let mut variables = base.clone();
    if let Value::Object(map) = &mut variables {
        map.insert("matrix".to_string(), Value::Object(context.clone()));
    }

    let mut documents = Vec::new();
    for (index, template) in templates.iter().enumerate() {
        match template.source(index)? {
            TemplateSource::Object(object) => {
                let mut document = object.clone();
                engine.render_structured(&mut document, &variables)?;
                documents.push(document);
            }
            TemplateSource::Raw(raw) => {
                let rendered = engine.render_string(raw, &variables)?;
                documents.extend(parse_documents(&rendered)?);
            }
        }
    }
    Ok(documents)
}

/// Parse a multi-document YAML stream. Empty documents are skipped.
pub fn parse_documents(text: &str) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        match Value::deserialize(document).map_err(Error::decode)? {
            Value::Null => continue,
            value @ Value::Object(_) => documents.push(value),
            other => {
                return Err(Error::Decode(format!(
                    "rendered document is not a mapping: {}",
                    other
                )));
            }
        }
    }
    Ok(documents)
}

/// Fans rendering out over matrix contexts
#[derive(Clone)]
pub struct Renderer {
    engine: Arc<dyn TemplateEngine>,
    max_parallelism: usize,
}

impl Renderer {
    pub fn new(engine: Arc<dyn TemplateEngine>, max_parallelism: usize) -> Self {
        Self {
            engine,
            max_parallelism: max_parallelism.max(1),
        }
    }

    /// Render every context of `template`. Output order follows the
    /// context order, then template declaration order.
    pub async fn render_all(
        &self,
        template: &ObjectTemplate,
        contexts: Vec<MatrixContext>,
    ) -> Result<Vec<Value>> {
        let mut invalid = AggregateError::new();
        for (index, t) in template.spec.templates.iter().enumerate() {
            if let Err(e) = t.source(index) {
                invalid.push(e);
            }
        }
        invalid.into_result()?;

        let base = Arc::new(base_variables(template)?);
        let templates = Arc::new(template.spec.templates.clone());
        debug!(contexts = contexts.len(), "Rendering templates");

        let results: Vec<Result<Vec<Value>>> = stream::iter(contexts)
            .map(|context| {
                let engine = Arc::clone(&self.engine);
                let base = Arc::clone(&base);
                let templates = Arc::clone(&templates);
                tokio::task::spawn_blocking(move || {
                    render_context(engine.as_ref(), &templates, &context, &base)
                })
            })
            .buffered(self.max_parallelism)
            .map(|joined| joined.map_err(Error::from).and_then(|rendered| rendered))
            .collect()
            .await;

        let mut errors = AggregateError::new();
        let mut documents = Vec::new();
        for result in results {
            match result {
                Ok(rendered) => documents.extend(rendered),
                Err(e) => errors.push(e),
            }
        }
        errors.into_result()?;
        Ok(documents)
    }
}
