//! In-memory implementation of the store ports
//!
//! Thread-safe and API-server free: used by the test suites and for dry
//! local runs. Objects are keyed by their version-insensitive identity, so
//! applying `v1beta1` and `v1` of the same object touches one entry.
//! Every mutating call is recorded for later inspection, and individual
//! applies, deletes and watch registrations can be made to fail.

use super::{
    ChangeEvent, EventHandler, MATRIX_OBJECT_INDEX, ObjectStore, TemplateIndex, TemplateKey,
    WatchSource,
};
use crate::crd::{ObjectRef, ObjectTemplate, ObjectTemplateStatus, ResourceRef, display_gvk};
use crate::error::StoreError;
use async_trait::async_trait;
use kube::core::GroupVersionKind;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ResourceRef, Value>>,
    templates: RwLock<HashMap<TemplateKey, ObjectTemplate>>,
    index: TemplateIndex,

    apply_failures: RwLock<HashMap<String, String>>,
    delete_failures: RwLock<HashMap<String, String>>,
    failing_kinds: RwLock<HashSet<GroupVersionKind>>,
    registration_delay: RwLock<Option<Duration>>,

    applied: Mutex<Vec<ObjectRef>>,
    deleted: Mutex<Vec<ResourceRef>>,
    status_patches: Mutex<Vec<ObjectTemplateStatus>>,
    registrations: Mutex<Vec<GroupVersionKind>>,
    handlers: RwLock<HashMap<GroupVersionKind, Vec<EventHandler>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as if it already existed in the cluster
    pub fn insert_object(&self, document: Value) -> Result<(), StoreError> {
        let identity = identity_of(&document)?;
        self.objects.write().insert(identity, document);
        Ok(())
    }

    /// Store an ObjectTemplate and index it
    pub fn insert_template(&self, template: ObjectTemplate) {
        self.index.upsert(&template);
        self.templates
            .write()
            .insert(TemplateKey::from(&template), template);
    }

    pub fn remove_template(&self, key: &TemplateKey) {
        self.index.remove(key);
        self.templates.write().remove(key);
    }

    pub fn template(&self, key: &TemplateKey) -> Option<ObjectTemplate> {
        self.templates.read().get(key).cloned()
    }

    pub fn object(&self, identity: &ResourceRef) -> Option<Value> {
        self.objects.read().get(identity).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Make every apply of an object with this name fail with `message`
    pub fn fail_apply(&self, name: impl Into<String>, message: impl Into<String>) {
        self.apply_failures.write().insert(name.into(), message.into());
    }

    /// Make every delete of an object with this name fail with `message`
    pub fn fail_delete(&self, name: impl Into<String>, message: impl Into<String>) {
        self.delete_failures
            .write()
            .insert(name.into(), message.into());
    }

    /// Make watch registration for `kind` fail until [`Self::heal_kind`]
    pub fn fail_registration(&self, kind: GroupVersionKind) {
        self.failing_kinds.write().insert(kind);
    }

    pub fn heal_kind(&self, kind: &GroupVersionKind) {
        self.failing_kinds.write().remove(kind);
    }

    /// Slow down registrations so concurrent callers overlap
    pub fn set_registration_delay(&self, delay: Duration) {
        *self.registration_delay.write() = Some(delay);
    }

    pub fn applied(&self) -> Vec<ObjectRef> {
        self.applied.lock().clone()
    }

    pub fn deleted(&self) -> Vec<ResourceRef> {
        self.deleted.lock().clone()
    }

    pub fn status_patches(&self) -> Vec<ObjectTemplateStatus> {
        self.status_patches.lock().clone()
    }

    pub fn registrations(&self) -> Vec<GroupVersionKind> {
        self.registrations.lock().clone()
    }

    /// Forget recorded calls, keeping objects and templates
    pub fn clear_calls(&self) {
        self.applied.lock().clear();
        self.deleted.lock().clear();
        self.status_patches.lock().clear();
    }

    /// Deliver `event` to every handler registered for its kind
    pub async fn emit(&self, event: ChangeEvent) {
        let handlers = self
            .handlers
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(event.clone()).await;
        }
    }
}

fn identity_of(document: &Value) -> Result<ResourceRef, StoreError> {
    ObjectRef::from_document(document)
        .and_then(|r| r.identity())
        .map_err(|e| StoreError::Other(e.to_string()))
}

fn identity_for(kind: &GroupVersionKind, namespace: &str, name: &str) -> ResourceRef {
    ResourceRef {
        group: kind.group.clone(),
        kind: kind.kind.clone(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_template(&self, key: &TemplateKey) -> Result<Option<ObjectTemplate>, StoreError> {
        Ok(self.template(key))
    }

    async fn get(
        &self,
        kind: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, StoreError> {
        self.objects
            .read()
            .get(&identity_for(kind, namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found(display_gvk(kind), namespace, name))
    }

    async fn list_templates_by_index(
        &self,
        index: &str,
        value: &str,
    ) -> Result<Vec<TemplateKey>, StoreError> {
        if index != MATRIX_OBJECT_INDEX {
            return Err(StoreError::Other(format!("unknown index {:?}", index)));
        }
        Ok(self.index.lookup(value))
    }

    async fn apply(&self, document: &Value, _field_owner: &str) -> Result<Value, StoreError> {
        let reference =
            ObjectRef::from_document(document).map_err(|e| StoreError::Other(e.to_string()))?;
        self.applied.lock().push(reference.clone());

        if let Some(message) = self.apply_failures.read().get(&reference.name) {
            return Err(StoreError::Other(message.clone()));
        }

        let identity = identity_of(document)?;
        self.objects.write().insert(identity, document.clone());
        Ok(document.clone())
    }

    async fn delete(
        &self,
        kind: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let identity = identity_for(kind, namespace, name);
        self.deleted.lock().push(identity.clone());

        if let Some(message) = self.delete_failures.read().get(name) {
            return Err(StoreError::Other(message.clone()));
        }

        match self.objects.write().remove(&identity) {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found(display_gvk(kind), namespace, name)),
        }
    }

    async fn patch_status(
        &self,
        template: &ObjectTemplate,
        status: &ObjectTemplateStatus,
    ) -> Result<(), StoreError> {
        let key = TemplateKey::from(template);
        self.status_patches.lock().push(status.clone());

        let mut templates = self.templates.write();
        let stored = templates
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found("ObjectTemplate", &key.namespace, &key.name))?;
        stored.status = Some(status.clone());
        Ok(())
    }
}

#[async_trait]
impl WatchSource for MemoryStore {
    async fn register(
        &self,
        kind: &GroupVersionKind,
        on_event: EventHandler,
    ) -> Result<(), StoreError> {
        let delay = *self.registration_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing_kinds.read().contains(kind) {
            return Err(StoreError::UnknownKind(display_gvk(kind)));
        }

        self.registrations.lock().push(kind.clone());
        self.handlers
            .write()
            .entry(kind.clone())
            .or_default()
            .push(on_event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_map(api_version: &str, name: &str) -> Value {
        json!({
            "apiVersion": api_version,
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"},
            "data": {"key": "value"},
        })
    }

    #[tokio::test]
    async fn test_get_and_delete_roundtrip() {
        let store = MemoryStore::new();
        store.insert_object(config_map("v1", "cm")).unwrap();

        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let doc = store.get(&gvk, "default", "cm").await.unwrap();
        assert_eq!(doc["data"]["key"], "value");

        store.delete(&gvk, "default", "cm").await.unwrap();
        let err = store.get(&gvk, "default", "cm").await.unwrap_err();
        assert!(err.is_not_found());

        let err = store.delete(&gvk, "default", "cm").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_apply_is_version_insensitive() {
        let store = MemoryStore::new();
        store
            .apply(&config_map("example.com/v1beta1", "cm"), "test")
            .await
            .unwrap();
        store
            .apply(&config_map("example.com/v1", "cm"), "test")
            .await
            .unwrap();

        assert_eq!(store.object_count(), 1);
        assert_eq!(store.applied().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_apply_failure() {
        let store = MemoryStore::new();
        store.fail_apply("cm", "admission denied");

        let err = store.apply(&config_map("v1", "cm"), "test").await.unwrap_err();
        assert_eq!(err.to_string(), "admission denied");
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_index_is_rejected() {
        let store = MemoryStore::new();
        assert!(store.list_templates_by_index("metadata.name", "x").await.is_err());
        assert!(
            store
                .list_templates_by_index(MATRIX_OBJECT_INDEX, "x")
                .await
                .unwrap()
                .is_empty()
        );
    }
}
