//! Matrix expansion
//!
//! Each matrix entry yields a list of candidate values. The contexts are
//! the cartesian product of all candidate lists, iterated with the
//! previously accumulated contexts as the outer loop.

use crate::crd::{MatrixObject, MatrixSource, ObjectTemplate};
use crate::error::Result;
use crate::path::PathQuery;
use crate::store::ObjectStore;
use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::debug;

/// One combination of matrix values, keyed by entry name
pub type MatrixContext = Map<String, Value>;

/// Expands the matrix of an ObjectTemplate into contexts
pub struct MatrixBuilder<'a> {
    store: &'a dyn ObjectStore,
    paths: &'a dyn PathQuery,
}

impl<'a> MatrixBuilder<'a> {
    pub fn new(store: &'a dyn ObjectStore, paths: &'a dyn PathQuery) -> Self {
        Self { store, paths }
    }

    /// Build all contexts. Any failing entry aborts the whole build.
    pub async fn build(&self, template: &ObjectTemplate) -> Result<Vec<MatrixContext>> {
        let sources = template
            .spec
            .matrix
            .iter()
            .map(|entry| -> Result<_> { Ok((entry.name.as_str(), entry.source()?)) })
            .collect::<Result<Vec<_>>>()?;
        let namespace = template.namespace().unwrap_or_default();

        let mut contexts = vec![MatrixContext::new()];
        for (name, source) in sources {
            let candidates = match source {
                MatrixSource::Object(object) => self.object_candidates(&namespace, object).await?,
                MatrixSource::List(list) => list.to_vec(),
            };
            debug!(entry = name, candidates = candidates.len(), "Matrix entry resolved");
            contexts = multiply(contexts, name, &candidates);
        }
        Ok(contexts)
    }

    async fn object_candidates(
        &self,
        default_namespace: &str,
        object: &MatrixObject,
    ) -> Result<Vec<Value>> {
        let kind = object.reference.group_version_kind()?;
        let namespace = object.reference.namespace_or(default_namespace);
        let document = self
            .store
            .get(&kind, namespace, &object.reference.name)
            .await?;
        let matches = self.paths.evaluate(&object.json_path, &document)?;
        Ok(expand(matches, object.expand_lists))
    }
}

/// Spread list matches into their elements when `expand_lists` is set
pub fn expand(matches: Vec<Value>, expand_lists: bool) -> Vec<Value> {
    if !expand_lists {
        return matches;
    }
    matches
        .into_iter()
        .flat_map(|m| match m {
            Value::Array(items) => items,
            other => vec![other],
        })
        .collect()
}

/// `contexts × candidates`, outer loop over `contexts`
pub fn multiply(contexts: Vec<MatrixContext>, name: &str, candidates: &[Value]) -> Vec<MatrixContext> {
    let mut product = Vec::with_capacity(contexts.len() * candidates.len());
    for context in &contexts {
        for candidate in candidates {
            let mut extended = context.clone();
            extended.insert(name.to_string(), candidate.clone());
            product.push(extended);
        }
    }
    product
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::path::JsonPathQuery;
    use crate::store::MemoryStore;
    use rstest::rstest;
    use serde_json::json;

    fn template(matrix: Value) -> ObjectTemplate {
        serde_json::from_value(json!({
            "apiVersion": "templates.kluctl.io/v1alpha1",
            "kind": "ObjectTemplate",
            "metadata": {"name": "ot", "namespace": "ns"},
            "spec": {"matrix": matrix},
        }))
        .unwrap()
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_object(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm", "namespace": "ns"},
                "data": {"envs": ["dev", "prod"], "region": "eu"},
            }))
            .unwrap();
        store
            .insert_object(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm", "namespace": "other"},
                "data": {"region": "us"},
            }))
            .unwrap();
        store
    }

    async fn build(store: &MemoryStore, matrix: Value) -> Result<Vec<MatrixContext>> {
        MatrixBuilder::new(store, &JsonPathQuery)
            .build(&template(matrix))
            .await
    }

    fn lists(sizes: &[usize]) -> Value {
        Value::Array(
            sizes
                .iter()
                .enumerate()
                .map(|(i, n)| json!({"name": format!("d{}", i), "list": (0..*n).collect::<Vec<_>>()}))
                .collect(),
        )
    }

    #[rstest]
    #[case(&[], 1)]
    #[case(&[3], 3)]
    #[case(&[2, 3], 6)]
    #[case(&[2, 3, 4], 24)]
    #[case(&[2, 0, 4], 0)]
    #[tokio::test]
    async fn test_product_size(#[case] sizes: &[usize], #[case] expected: usize) {
        let contexts = build(&MemoryStore::new(), lists(sizes)).await.unwrap();
        assert_eq!(contexts.len(), expected);
        for context in &contexts {
            assert_eq!(context.len(), sizes.len());
        }
    }

    #[tokio::test]
    async fn test_cartesian_order() {
        let contexts = build(
            &MemoryStore::new(),
            json!([
                {"name": "A", "list": ["a1", "a2"]},
                {"name": "B", "list": ["b1", "b2"]},
            ]),
        )
        .await
        .unwrap();

        let pairs: Vec<(&str, &str)> = contexts
            .iter()
            .map(|c| (c["A"].as_str().unwrap(), c["B"].as_str().unwrap()))
            .collect();
        assert_eq!(
            pairs,
            vec![("a1", "b1"), ("a1", "b2"), ("a2", "b1"), ("a2", "b2")]
        );
    }

    #[tokio::test]
    async fn test_list_values_keep_structure() {
        let contexts = build(
            &MemoryStore::new(),
            json!([{"name": "app", "list": [{"name": "web", "port": 80}, [1, 2]]}]),
        )
        .await
        .unwrap();
        assert_eq!(contexts[0]["app"], json!({"name": "web", "port": 80}));
        assert_eq!(contexts[1]["app"], json!([1, 2]));
    }

    #[test]
    fn test_expand_lists_flag() {
        let matches = vec![json!([1, 2, 3])];
        assert_eq!(expand(matches.clone(), true), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(expand(matches, false), vec![json!([1, 2, 3])]);
        assert_eq!(expand(vec![json!("x")], true), vec![json!("x")]);
    }

    #[tokio::test]
    async fn test_object_entry_with_expand_lists() {
        let store = store();
        let object = |expand: bool| {
            json!([{"name": "env", "object": {
                "ref": {"apiVersion": "v1", "kind": "ConfigMap", "name": "cm"},
                "jsonPath": "$.data.envs",
                "expandLists": expand,
            }}])
        };

        let expanded = build(&store, object(true)).await.unwrap();
        let envs: Vec<&Value> = expanded.iter().map(|c| &c["env"]).collect();
        assert_eq!(envs, vec![&json!("dev"), &json!("prod")]);

        let compound = build(&store, object(false)).await.unwrap();
        assert_eq!(compound.len(), 1);
        assert_eq!(compound[0]["env"], json!(["dev", "prod"]));
    }

    #[tokio::test]
    async fn test_object_entry_namespace_override() {
        let contexts = build(
            &store(),
            json!([{"name": "region", "object": {
                "ref": {"apiVersion": "v1", "kind": "ConfigMap", "namespace": "other", "name": "cm"},
                "jsonPath": "data.region",
            }}]),
        )
        .await
        .unwrap();
        assert_eq!(contexts[0]["region"], json!("us"));
    }

    #[tokio::test]
    async fn test_missing_object_aborts_build() {
        let err = build(
            &store(),
            json!([
                {"name": "a", "list": [1]},
                {"name": "b", "object": {
                    "ref": {"apiVersion": "v1", "kind": "ConfigMap", "name": "absent"},
                    "jsonPath": "$.data",
                }},
            ]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Store(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_invalid_path_aborts_build() {
        let err = build(
            &store(),
            json!([{"name": "b", "object": {
                "ref": {"apiVersion": "v1", "kind": "ConfigMap", "name": "cm"},
                "jsonPath": "$.[",
            }}]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_entry_without_value_aborts_build() {
        let err = build(
            &MemoryStore::new(),
            json!([{"name": "a", "list": [1]}, {"name": "b"}]),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidMatrixEntry { ref name, .. } if name == "b"));
    }

    #[tokio::test]
    async fn test_path_without_matches_yields_no_contexts() {
        let contexts = build(
            &store(),
            json!([{"name": "b", "object": {
                "ref": {"apiVersion": "v1", "kind": "ConfigMap", "name": "cm"},
                "jsonPath": "$.data.nothing",
            }}]),
        )
        .await
        .unwrap();
        assert!(contexts.is_empty());
    }
}
