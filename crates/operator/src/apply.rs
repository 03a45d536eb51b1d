//! Apply and prune of rendered objects
//!
//! The previous pass's `appliedResources` is the only record of what this
//! controller owns. Anything recorded there but no longer rendered is
//! deleted; identities are compared without the API version.

use crate::crd::{AppliedResourceInfo, ObjectRef, ObjectTemplate, ResourceRef};
use crate::error::{AggregateError, Error, Result};
use crate::store::ObjectStore;
use futures::{StreamExt, stream};
use kube::ResourceExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Result of an apply/prune run that got past validation
#[derive(Debug)]
pub struct ApplyReport {
    /// One entry per desired object, in desired order, failed or not
    pub applied_resources: Vec<AppliedResourceInfo>,
    pub deleted: usize,
    /// Aggregated apply and delete failures
    pub error: Option<Error>,
}

pub struct Applier<'a> {
    store: &'a dyn ObjectStore,
    field_manager: &'a str,
    max_parallelism: usize,
}

impl<'a> Applier<'a> {
    pub fn new(store: &'a dyn ObjectStore, field_manager: &'a str, max_parallelism: usize) -> Self {
        Self {
            store,
            field_manager,
            max_parallelism: max_parallelism.max(1),
        }
    }

    /// Apply `desired` and delete what the previous pass applied but is no
    /// longer desired.
    ///
    /// Returns `Err` only when the input is invalid, before anything has
    /// been touched. Individual apply/delete failures never stop the
    /// others and are reported through [`ApplyReport`].
    pub async fn reconcile_resources(
        &self,
        template: &ObjectTemplate,
        mut desired: Vec<Value>,
    ) -> Result<ApplyReport> {
        let namespace = template.namespace().unwrap_or_default();

        let mut references = Vec::with_capacity(desired.len());
        for document in &mut desired {
            default_namespace(document, &namespace)?;
            let reference = ObjectRef::from_document(document)?;
            let identity = reference.identity()?;
            references.push((reference, identity));
        }

        let mut stale: BTreeMap<ResourceRef, ObjectRef> = BTreeMap::new();
        for previous in template.applied_resources() {
            stale.insert(previous.reference.identity()?, previous.reference.clone());
        }
        for (_, identity) in &references {
            stale.remove(identity);
        }

        let apply_futures: Vec<_> = desired
            .iter()
            .zip(references)
            .map(|(document, (reference, _))| self.apply_one(document, reference))
            .collect();
        let applied_resources: Vec<(AppliedResourceInfo, Option<Error>)> =
            stream::iter(apply_futures)
                .buffered(self.max_parallelism)
                .collect()
                .await;

        let deleted = stale.len();
        let delete_errors: Vec<Error> = stream::iter(stale.into_values())
            .map(|reference| self.delete_one(reference))
            .buffer_unordered(self.max_parallelism)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;

        let mut errors = AggregateError::new();
        let applied_resources = applied_resources
            .into_iter()
            .map(|(info, error)| {
                errors.extend(error);
                info
            })
            .collect();
        errors.extend(delete_errors);

        Ok(ApplyReport {
            applied_resources,
            deleted,
            error: errors.into_result().err(),
        })
    }

    async fn apply_one(
        &self,
        document: &Value,
        reference: ObjectRef,
    ) -> (AppliedResourceInfo, Option<Error>) {
        match self.store.apply(document, self.field_manager).await {
            Ok(_) => {
                debug!(resource = %reference, "Applied");
                (AppliedResourceInfo::applied(reference), None)
            }
            Err(e) => {
                warn!(resource = %reference, error = %e, "Apply failed");
                let info = AppliedResourceInfo::failed(reference.clone(), e.to_string());
                let error = Error::Apply {
                    reference: reference.to_string(),
                    source: e,
                };
                (info, Some(error))
            }
        }
    }

    async fn delete_one(&self, reference: ObjectRef) -> Result<()> {
        let kind = reference.group_version_kind()?;
        let namespace = reference.namespace.as_deref().unwrap_or_default();
        match self.store.delete(&kind, namespace, &reference.name).await {
            Ok(()) => {
                debug!(resource = %reference, "Deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(resource = %reference, error = %e, "Delete failed");
                Err(Error::Delete {
                    reference: reference.to_string(),
                    source: e,
                })
            }
        }
    }
}

/// Give `document` the template's namespace unless it names one itself
pub fn default_namespace(document: &mut Value, namespace: &str) -> Result<()> {
    let object = document
        .as_object_mut()
        .ok_or_else(|| Error::Decode("rendered document is not an object".to_string()))?;
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| Error::Decode("metadata is not an object".to_string()))?;

    let has_namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .is_some_and(|ns| !ns.is_empty());
    if !has_namespace {
        metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
    }
    Ok(())
}
