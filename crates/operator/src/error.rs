//! Error types for the template operator
//!
//! [`Error`] is the pass-level taxonomy surfaced through the `Ready`
//! condition; [`StoreError`] is what the external-store adapters return.

use std::fmt;

/// Errors returned by [`crate::store::ObjectStore`] and [`crate::store::WatchSource`]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("kind {0} is not served by the cluster")]
    UnknownKind(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// True for "does not exist" outcomes, including a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

/// Errors produced by a reconciliation pass
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid matrix entry {name:?}: {reason}")]
    InvalidMatrixEntry { name: String, reason: String },

    #[error("invalid template at index {index}: {reason}")]
    InvalidTemplate { index: usize, reason: String },

    #[error("invalid object reference: {0}")]
    InvalidReference(String),

    #[error("invalid path expression {expression:?}: {reason}")]
    InvalidPath { expression: String, reason: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to apply {reference}: {source}")]
    Apply {
        reference: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to delete {reference}: {source}")]
    Delete {
        reference: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to watch {kind}: {source}")]
    Watch {
        kind: String,
        #[source]
        source: StoreError,
    },

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl Error {
    pub fn decode(err: impl fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Templating failure for a single expression or document
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct RenderError(pub String);

impl From<handlebars::RenderError> for RenderError {
    fn from(err: handlebars::RenderError) -> Self {
        Self(err.to_string())
    }
}

/// Several independent failures collected from one fan-out
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when nothing was collected, the lone cause when there is
    /// exactly one, otherwise the whole aggregate
    pub fn into_result(mut self) -> Result<(), Error> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Aggregate(self)),
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl Extend<Error> for AggregateError {
    fn extend<T: IntoIterator<Item = Error>>(&mut self, iter: T) {
        self.errors.extend(iter);
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_aggregate_is_ok() {
        assert!(AggregateError::new().into_result().is_ok());
    }

    #[test]
    fn test_single_cause_is_unwrapped() {
        let mut agg = AggregateError::new();
        agg.push(Error::Decode("bad yaml".to_string()));

        let err = agg.into_result().unwrap_err();
        assert_eq!(err.to_string(), "decode error: bad yaml");
    }

    #[test]
    fn test_aggregate_lists_every_cause() {
        let mut agg = AggregateError::new();
        agg.push(Error::Render(RenderError("missing variable a".to_string())));
        agg.push(Error::Render(RenderError("missing variable b".to_string())));

        let msg = agg.into_result().unwrap_err().to_string();
        assert!(msg.starts_with("2 errors occurred:"));
        assert!(msg.contains("missing variable a"));
        assert!(msg.contains("missing variable b"));
    }

    #[test]
    fn test_store_not_found_detection() {
        assert!(StoreError::not_found("ConfigMap", "default", "cm").is_not_found());
        assert!(!StoreError::Other("boom".to_string()).is_not_found());
    }
}
