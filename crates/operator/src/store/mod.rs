//! External store ports
//!
//! The reconciler never talks to the API server directly. It goes through
//! [`ObjectStore`] for reads and writes and through [`WatchSource`] for
//! registering watches on kinds discovered at runtime.

use crate::crd::{ObjectTemplate, ObjectTemplateStatus, ResourceRef};
use crate::error::StoreError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use kube::ResourceExt;
use kube::core::GroupVersionKind;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

mod index;
pub mod kube_store;
pub mod memory;

pub use index::TemplateIndex;
pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Field index mapping a referenced matrix object to the templates using it
pub const MATRIX_OBJECT_INDEX: &str = "spec.matrix.object.ref";

/// Namespace and name of an ObjectTemplate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateKey {
    pub namespace: String,
    pub name: String,
}

impl TemplateKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<&ObjectTemplate> for TemplateKey {
    fn from(template: &ObjectTemplate) -> Self {
        Self::new(template.namespace().unwrap_or_default(), template.name_any())
    }
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of an object that changed on a watched kind
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ChangeEvent {
    pub fn identity(&self) -> ResourceRef {
        ResourceRef {
            group: self.kind.group.clone(),
            kind: self.kind.kind.clone(),
            namespace: self.namespace.clone().unwrap_or_default(),
            name: self.name.clone(),
        }
    }
}

/// Callback invoked for every event of a registered watch
pub type EventHandler = Arc<dyn Fn(ChangeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Reads and writes against the cluster
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Current state of an ObjectTemplate, `None` once it is gone
    async fn get_template(&self, key: &TemplateKey) -> Result<Option<ObjectTemplate>, StoreError>;

    /// Fetch an arbitrary object as an untyped document
    async fn get(
        &self,
        kind: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, StoreError>;

    /// ObjectTemplates whose `index` field contains `value`
    async fn list_templates_by_index(
        &self,
        index: &str,
        value: &str,
    ) -> Result<Vec<TemplateKey>, StoreError>;

    /// Server-side apply: create if absent, otherwise merge the fields
    /// owned by `field_owner`
    async fn apply(&self, document: &Value, field_owner: &str) -> Result<Value, StoreError>;

    async fn delete(
        &self,
        kind: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError>;

    /// Merge `status` into the status subresource of `template`
    async fn patch_status(
        &self,
        template: &ObjectTemplate,
        status: &ObjectTemplateStatus,
    ) -> Result<(), StoreError>;
}

/// Capability to start an event stream for a kind
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn register(
        &self,
        kind: &GroupVersionKind,
        on_event: EventHandler,
    ) -> Result<(), StoreError>;
}
