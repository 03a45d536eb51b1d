//! In-memory field index over ObjectTemplates

use super::TemplateKey;
use crate::crd::{ObjectTemplate, ResourceRef};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// Maps the index value of every referenced matrix object to the templates
/// referencing it.
///
/// Lookups are O(1) in the number of templates. The index is rebuilt from
/// the template stream, never from reconciliation passes.
#[derive(Debug, Default)]
pub struct TemplateIndex {
    state: RwLock<IndexState>,
    synced: AtomicBool,
}

#[derive(Debug, Default)]
struct IndexState {
    by_value: HashMap<String, BTreeSet<TemplateKey>>,
    by_template: HashMap<TemplateKey, Vec<String>>,
}

impl IndexState {
    fn remove(&mut self, key: &TemplateKey) {
        let Some(values) = self.by_template.remove(key) else {
            return;
        };
        for value in values {
            if let Some(keys) = self.by_value.get_mut(&value) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_value.remove(&value);
                }
            }
        }
    }

    fn insert(&mut self, template: &ObjectTemplate) {
        let key = TemplateKey::from(template);
        self.remove(&key);

        let values: Vec<String> = template
            .matrix_object_refs()
            .iter()
            .map(ResourceRef::index_value)
            .collect();
        for value in &values {
            self.by_value
                .entry(value.clone())
                .or_default()
                .insert(key.clone());
        }
        self.by_template.insert(key, values);
    }
}

impl TemplateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, template: &ObjectTemplate) {
        self.state.write().insert(template);
    }

    pub fn remove(&self, key: &TemplateKey) {
        self.state.write().remove(key);
    }

    /// Replace the whole index, e.g. after a relist
    pub fn replace_all<'a>(&self, templates: impl IntoIterator<Item = &'a ObjectTemplate>) {
        let mut fresh = IndexState::default();
        for template in templates {
            fresh.insert(template);
        }
        *self.state.write() = fresh;
    }

    pub fn lookup(&self, value: &str) -> Vec<TemplateKey> {
        self.state
            .read()
            .by_value
            .get(value)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.read().by_template.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// True once the initial template list has been indexed
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(name: &str, cm_names: &[&str]) -> ObjectTemplate {
        let matrix: Vec<_> = cm_names
            .iter()
            .map(|cm| {
                json!({"name": cm, "object": {
                    "ref": {"apiVersion": "v1", "kind": "ConfigMap", "name": cm},
                    "jsonPath": "$.data",
                }})
            })
            .collect();
        serde_json::from_value(json!({
            "apiVersion": "templates.kluctl.io/v1alpha1",
            "kind": "ObjectTemplate",
            "metadata": {"name": name, "namespace": "ns"},
            "spec": {"matrix": matrix},
        }))
        .unwrap()
    }

    #[test]
    fn test_lookup_returns_all_dependents() {
        let index = TemplateIndex::new();
        index.upsert(&template("a", &["shared", "only-a"]));
        index.upsert(&template("b", &["shared"]));

        assert_eq!(
            index.lookup("ns//ConfigMap/shared"),
            vec![TemplateKey::new("ns", "a"), TemplateKey::new("ns", "b")]
        );
        assert_eq!(
            index.lookup("ns//ConfigMap/only-a"),
            vec![TemplateKey::new("ns", "a")]
        );
        assert!(index.lookup("ns//ConfigMap/unknown").is_empty());
    }

    #[test]
    fn test_upsert_replaces_previous_references() {
        let index = TemplateIndex::new();
        index.upsert(&template("a", &["old"]));
        index.upsert(&template("a", &["new"]));

        assert!(index.lookup("ns//ConfigMap/old").is_empty());
        assert_eq!(index.lookup("ns//ConfigMap/new").len(), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_and_replace_all() {
        let index = TemplateIndex::new();
        index.upsert(&template("a", &["cm"]));
        index.remove(&TemplateKey::new("ns", "a"));
        assert!(index.is_empty());

        let b = template("b", &["cm"]);
        index.replace_all([&b]);
        assert_eq!(index.lookup("ns//ConfigMap/cm"), vec![TemplateKey::new("ns", "b")]);
        assert!(!index.is_synced());
        index.mark_synced();
        assert!(index.is_synced());
    }
}
