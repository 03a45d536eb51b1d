//! Handlebars-backed template engine

use super::TemplateEngine;
use crate::error::RenderError;
use handlebars::{
    Context, Handlebars, Helper, HelperResult, Output, RenderContext, RenderErrorReason,
};
use serde_json::Value;

/// Renders `{{ ... }}` expressions with Handlebars.
///
/// Strict mode is on, so a reference to a missing variable is an error
/// rather than an empty string. Output is never HTML-escaped.
pub struct HandlebarsEngine {
    registry: Handlebars<'static>,
}

impl HandlebarsEngine {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);

        registry.register_helper("json", Box::new(json_helper));
        registry.register_helper("upper", Box::new(upper_helper));
        registry.register_helper("lower", Box::new(lower_helper));

        Self { registry }
    }
}

impl Default for HandlebarsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine for HandlebarsEngine {
    fn render_string(&self, text: &str, variables: &Value) -> Result<String, RenderError> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }
        Ok(self.registry.render_template(text, variables)?)
    }
}

fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if let Some(v) = h.param(0) {
        let encoded = serde_json::to_string(v.value())
            .map_err(|e| RenderErrorReason::Other(e.to_string()))?;
        out.write(&encoded)?;
    }
    Ok(())
}

fn upper_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&param.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&param.to_lowercase())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> Value {
        json!({
            "matrix": {"env": "Prod", "replicas": 3, "labels": {"team": "a"}},
            "objectTemplate": {"metadata": {"name": "ot"}},
        })
    }

    #[test]
    fn test_render_variables() {
        let engine = HandlebarsEngine::new();
        let out = engine
            .render_string("{{objectTemplate.metadata.name}}-{{matrix.env}}", &vars())
            .unwrap();
        assert_eq!(out, "ot-Prod");
    }

    #[test]
    fn test_helpers() {
        let engine = HandlebarsEngine::new();
        assert_eq!(
            engine.render_string("{{lower matrix.env}}", &vars()).unwrap(),
            "prod"
        );
        assert_eq!(
            engine.render_string("{{upper matrix.env}}", &vars()).unwrap(),
            "PROD"
        );
        assert_eq!(
            engine.render_string("{{json matrix.labels}}", &vars()).unwrap(),
            r#"{"team":"a"}"#
        );
    }

    #[test]
    fn test_no_html_escaping() {
        let engine = HandlebarsEngine::new();
        let out = engine
            .render_string("{{x}}", &json!({"x": "a<b>&\"c\""}))
            .unwrap();
        assert_eq!(out, "a<b>&\"c\"");
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        let engine = HandlebarsEngine::new();
        assert!(engine.render_string("{{matrix.missing}}", &vars()).is_err());
    }

    #[test]
    fn test_syntax_error() {
        let engine = HandlebarsEngine::new();
        assert!(engine.render_string("{{#if}}", &vars()).is_err());
    }

    #[test]
    fn test_plain_text_passes_through() {
        let engine = HandlebarsEngine::new();
        assert_eq!(engine.render_string("plain", &vars()).unwrap(), "plain");
    }
}
