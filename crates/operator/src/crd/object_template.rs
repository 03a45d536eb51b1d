//! ObjectTemplate CRD - Renders a matrix of templates into managed objects

use super::{ObjectRef, ResourceRef, parse_interval};
use crate::error::{AggregateError, Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// ObjectTemplate CRD
#[derive(CustomResource, Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "templates.kluctl.io",
    version = "v1alpha1",
    kind = "ObjectTemplate",
    namespaced,
    status = "ObjectTemplateStatus",
    shortname = "ot",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTemplateSpec {
    /// Time between reconciliation passes
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Dimensions multiplied into the rendering contexts, in order
    #[serde(default)]
    pub matrix: Vec<MatrixEntry>,

    /// Templates rendered once per matrix context, in order
    #[serde(default)]
    pub templates: Vec<Template>,
}

fn default_interval() -> String {
    "5m".to_string()
}

/// One matrix dimension. Exactly one of `object` and `list` must be set.
#[derive(Debug, Clone, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatrixEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<MatrixObject>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "any_value_list")]
    pub list: Option<Vec<Value>>,
}

/// Values taken from another object in the cluster
#[derive(Debug, Clone, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatrixObject {
    #[serde(rename = "ref")]
    pub reference: ObjectRef,

    pub json_path: String,

    /// Spread matched lists into individual values
    #[serde(default)]
    pub expand_lists: bool,
}

/// Where a matrix dimension gets its values from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatrixSource<'a> {
    Object(&'a MatrixObject),
    List(&'a [Value]),
}

impl MatrixEntry {
    pub fn source(&self) -> Result<MatrixSource<'_>> {
        match (&self.object, &self.list) {
            (Some(object), None) => Ok(MatrixSource::Object(object)),
            (None, Some(list)) => Ok(MatrixSource::List(list)),
            (None, None) => Err(Error::InvalidMatrixEntry {
                name: self.name.clone(),
                reason: "missing matrix value".to_string(),
            }),
            (Some(_), Some(_)) => Err(Error::InvalidMatrixEntry {
                name: self.name.clone(),
                reason: "only one of object and list may be set".to_string(),
            }),
        }
    }
}

/// One output template. Exactly one of `object` and `raw` must be set.
#[derive(Debug, Clone, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserved_object")]
    pub object: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TemplateSource<'a> {
    Object(&'a Value),
    Raw(&'a str),
}

impl Template {
    pub fn source(&self, index: usize) -> Result<TemplateSource<'_>> {
        match (&self.object, &self.raw) {
            (Some(object), None) => Ok(TemplateSource::Object(object)),
            (None, Some(raw)) => Ok(TemplateSource::Raw(raw)),
            (None, None) => Err(Error::InvalidTemplate {
                index,
                reason: "no template specified".to_string(),
            }),
            (Some(_), Some(_)) => Err(Error::InvalidTemplate {
                index,
                reason: "only one of object and raw may be set".to_string(),
            }),
        }
    }
}

/// ObjectTemplateStatus defines the observed state of ObjectTemplate
#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTemplateStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub applied_resources: Vec<AppliedResourceInfo>,
}

/// Outcome of applying one rendered object
#[derive(Debug, Clone, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedResourceInfo {
    #[serde(rename = "ref")]
    pub reference: ObjectRef,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppliedResourceInfo {
    pub fn applied(reference: ObjectRef) -> Self {
        Self {
            reference,
            success: true,
            error: None,
        }
    }

    pub fn failed(reference: ObjectRef, error: impl Into<String>) -> Self {
        Self {
            reference,
            success: false,
            error: Some(error.into()),
        }
    }
}

impl ObjectTemplate {
    pub fn interval(&self) -> Result<Duration> {
        parse_interval(&self.spec.interval)
    }

    /// Check that every matrix entry and template sets exactly one variant.
    /// All offending entries are reported together.
    pub fn validate(&self) -> Result<()> {
        let mut errors = AggregateError::new();
        for entry in &self.spec.matrix {
            if let Err(e) = entry.source() {
                errors.push(e);
            }
        }
        for (index, template) in self.spec.templates.iter().enumerate() {
            if let Err(e) = template.source(index) {
                errors.push(e);
            }
        }
        errors.into_result()
    }

    pub fn applied_resources(&self) -> &[AppliedResourceInfo] {
        self.status
            .as_ref()
            .map(|s| s.applied_resources.as_slice())
            .unwrap_or_default()
    }

    /// Identities of the objects referenced by `object` matrix entries, with
    /// the namespace defaulted to this template's namespace
    pub fn matrix_object_refs(&self) -> Vec<ResourceRef> {
        let namespace = self.namespace().unwrap_or_default();
        self.spec
            .matrix
            .iter()
            .filter_map(|entry| entry.object.as_ref())
            .filter_map(|object| {
                let mut identity = object.reference.identity().ok()?;
                identity.namespace = object.reference.namespace_or(&namespace).to_string();
                Some(identity)
            })
            .collect()
    }
}

fn preserved_object(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        Value::Bool(true),
    );
    Schema::Object(schema)
}

fn any_value_list(_: &mut SchemaGenerator) -> Schema {
    let mut item = SchemaObject::default();
    item.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        Value::Bool(true),
    );
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        ..Default::default()
    };
    schema.array().items = Some(Schema::Object(item).into());
    Schema::Object(schema)
}
