//! CRD Definitions for the Template Operator
//!
//! The `ObjectTemplate` custom resource plus the reference types shared by
//! its spec and status.

use crate::error::{Error, Result};
use kube::core::GroupVersionKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

mod condition;
mod interval;
mod object_template;

pub use condition::{READY_CONDITION, ready_condition, set_condition};
pub use interval::parse_interval;
pub use object_template::{
    AppliedResourceInfo, MatrixEntry, MatrixObject, MatrixSource, ObjectTemplate,
    ObjectTemplateSpec, ObjectTemplateStatus, Template, TemplateSource,
};

/// Reference to an arbitrary object, as persisted in spec and status
#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    /// Reference of a rendered document, read from `apiVersion`, `kind`
    /// and `metadata`
    pub fn from_document(doc: &Value) -> Result<Self> {
        let field = |pointer: &str| doc.pointer(pointer).and_then(Value::as_str);

        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::InvalidReference("document has no apiVersion".to_string()))?;
        let kind = field("/kind")
            .ok_or_else(|| Error::InvalidReference("document has no kind".to_string()))?;
        let name = field("/metadata/name").ok_or_else(|| {
            Error::InvalidReference(format!("{} document has no metadata.name", kind))
        })?;
        let namespace = field("/metadata/namespace")
            .filter(|ns| !ns.is_empty())
            .map(str::to_string);

        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace,
            name: name.to_string(),
        })
    }

    pub fn group_version_kind(&self) -> Result<GroupVersionKind> {
        let (group, version) = split_api_version(&self.api_version)?;
        if self.kind.is_empty() {
            return Err(Error::InvalidReference(format!(
                "missing kind for apiVersion {}",
                self.api_version
            )));
        }
        Ok(GroupVersionKind::gvk(group, version, &self.kind))
    }

    /// Version-insensitive identity
    pub fn identity(&self) -> Result<ResourceRef> {
        let (group, _) = split_api_version(&self.api_version)?;
        Ok(ResourceRef {
            group: group.to_string(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone().unwrap_or_default(),
            name: self.name.clone(),
        })
    }

    /// Namespace of the reference, falling back to `default_namespace`
    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// Normalized identity of a managed object: group, kind, namespace, name.
/// Two API versions of the same object compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    /// Value stored in the matrix-object field index
    pub fn index_value(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.namespace, self.group, self.kind, self.name
        )
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        } else {
            write!(
                f,
                "{}.{} {}/{}",
                self.kind, self.group, self.namespace, self.name
            )
        }
    }
}

/// Splits `apiVersion` into group and version; the core group is empty
pub fn split_api_version(api_version: &str) -> Result<(&str, &str)> {
    let parts: Vec<&str> = api_version.split('/').collect();
    match parts.as_slice() {
        [version] if !version.is_empty() => Ok(("", version)),
        [group, version] if !group.is_empty() && !version.is_empty() => Ok((group, version)),
        _ => Err(Error::InvalidReference(format!(
            "invalid apiVersion {:?}",
            api_version
        ))),
    }
}

/// Readable `group/version/kind` for logs and error messages
pub fn display_gvk(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}
