//! Path queries over untyped documents

use crate::error::{Error, Result};
use serde_json::Value;
use serde_json_path::JsonPath;

/// Extracts the values matched by a path expression
pub trait PathQuery: Send + Sync {
    fn evaluate(&self, expression: &str, document: &Value) -> Result<Vec<Value>>;
}

/// JSONPath (RFC 9535) evaluator.
///
/// Expressions not starting with `$` are taken relative to the root, so
/// `data` and `$.data` are equivalent.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPathQuery;

impl JsonPathQuery {
    fn normalize(expression: &str) -> String {
        let trimmed = expression.trim();
        if trimmed.starts_with('$') {
            trimmed.to_string()
        } else if trimmed.starts_with('[') {
            format!("${}", trimmed)
        } else {
            format!("$.{}", trimmed)
        }
    }
}

impl PathQuery for JsonPathQuery {
    fn evaluate(&self, expression: &str, document: &Value) -> Result<Vec<Value>> {
        let path = JsonPath::parse(&Self::normalize(expression)).map_err(|e| Error::InvalidPath {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(path.query(document).all().into_iter().cloned().collect())
    }
}
