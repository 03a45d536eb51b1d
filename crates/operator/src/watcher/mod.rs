//! Watch registrar for kinds referenced by matrix entries
//!
//! The kinds to watch are only known once ObjectTemplates are read, so
//! watches are registered lazily, once per kind. Events on a watched kind
//! are mapped back to the ObjectTemplates referencing the changed object
//! through the matrix-object field index.

use crate::crd::display_gvk;
use crate::error::{Error, Result};
use crate::store::{
    ChangeEvent, EventHandler, MATRIX_OBJECT_INDEX, ObjectStore, TemplateKey, WatchSource,
};
use futures::FutureExt;
use kube::core::GroupVersionKind;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument, warn};

/// Registers one watch per kind and turns watch events into
/// reconciliation requests
pub struct WatchRegistrar {
    source: Arc<dyn WatchSource>,
    store: Arc<dyn ObjectStore>,
    trigger: mpsc::UnboundedSender<TemplateKey>,
    watched: Mutex<HashMap<GroupVersionKind, bool>>,
}

impl WatchRegistrar {
    pub fn new(
        source: Arc<dyn WatchSource>,
        store: Arc<dyn ObjectStore>,
        trigger: mpsc::UnboundedSender<TemplateKey>,
    ) -> Self {
        Self {
            source,
            store,
            trigger,
            watched: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure a watch is running for `kind`.
    ///
    /// The lock is held across registration, so concurrent callers for
    /// the same kind register exactly once. A failed registration is not
    /// remembered and is retried by the next call.
    #[instrument(skip(self, kind), fields(kind = %display_gvk(kind)))]
    pub async fn ensure_watch(&self, kind: &GroupVersionKind) -> Result<()> {
        let mut watched = self.watched.lock().await;
        if watched.get(kind).copied().unwrap_or(false) {
            return Ok(());
        }

        self.source
            .register(kind, self.event_handler())
            .await
            .map_err(|source| Error::Watch {
                kind: display_gvk(kind),
                source,
            })?;

        watched.insert(kind.clone(), true);
        info!("Watch registered");
        Ok(())
    }

    pub async fn is_watching(&self, kind: &GroupVersionKind) -> bool {
        self.watched.lock().await.get(kind).copied().unwrap_or(false)
    }

    pub async fn watched_kinds(&self) -> usize {
        self.watched.lock().await.values().filter(|active| **active).count()
    }

    fn event_handler(&self) -> EventHandler {
        let store = Arc::clone(&self.store);
        let trigger = self.trigger.clone();
        Arc::new(move |event: ChangeEvent| {
            let store = Arc::clone(&store);
            let trigger = trigger.clone();
            async move {
                match dependents(store.as_ref(), &event).await {
                    Ok(keys) => {
                        for key in keys {
                            debug!(template = %key, object = %event.identity(), "Matrix object changed");
                            if trigger.send(key).is_err() {
                                warn!("Reconcile trigger channel closed");
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to resolve dependent ObjectTemplates"),
                }
            }
            .boxed()
        })
    }
}

/// ObjectTemplates whose matrix references the object of `event`
pub async fn dependents(store: &dyn ObjectStore, event: &ChangeEvent) -> Result<Vec<TemplateKey>> {
    let value = event.identity().index_value();
    Ok(store
        .list_templates_by_index(MATRIX_OBJECT_INDEX, &value)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ObjectTemplate;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn config_maps() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "ConfigMap")
    }

    fn template(name: &str, cm: &str) -> ObjectTemplate {
        serde_json::from_value(json!({
            "apiVersion": "templates.kluctl.io/v1alpha1",
            "kind": "ObjectTemplate",
            "metadata": {"name": name, "namespace": "ns"},
            "spec": {"matrix": [{"name": "cm", "object": {
                "ref": {"apiVersion": "v1", "kind": "ConfigMap", "name": cm},
                "jsonPath": "$.data",
            }}]},
        }))
        .unwrap()
    }

    fn registrar(store: &Arc<MemoryStore>) -> (Arc<WatchRegistrar>, mpsc::UnboundedReceiver<TemplateKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registrar = WatchRegistrar::new(store.clone(), store.clone(), tx);
        (Arc::new(registrar), rx)
    }

    #[tokio::test]
    async fn test_concurrent_calls_register_once() {
        let store = Arc::new(MemoryStore::new());
        store.set_registration_delay(Duration::from_millis(20));
        let (registrar, _rx) = registrar(&store);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registrar = Arc::clone(&registrar);
                tokio::spawn(async move { registrar.ensure_watch(&config_maps()).await })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            result.unwrap().unwrap();
        }

        assert_eq!(store.registrations(), vec![config_maps()]);
        assert!(registrar.is_watching(&config_maps()).await);
    }

    #[tokio::test]
    async fn test_distinct_kinds_register_separately() {
        let store = Arc::new(MemoryStore::new());
        let (registrar, _rx) = registrar(&store);
        let secrets = GroupVersionKind::gvk("", "v1", "Secret");

        registrar.ensure_watch(&config_maps()).await.unwrap();
        registrar.ensure_watch(&secrets).await.unwrap();
        registrar.ensure_watch(&config_maps()).await.unwrap();

        assert_eq!(store.registrations().len(), 2);
        assert_eq!(registrar.watched_kinds().await, 2);
    }

    #[tokio::test]
    async fn test_failed_registration_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_registration(config_maps());
        let (registrar, _rx) = registrar(&store);

        let err = registrar.ensure_watch(&config_maps()).await.unwrap_err();
        assert!(matches!(err, Error::Watch { .. }));
        assert!(!registrar.is_watching(&config_maps()).await);

        store.heal_kind(&config_maps());
        registrar.ensure_watch(&config_maps()).await.unwrap();
        assert_eq!(store.registrations().len(), 1);
        assert!(registrar.is_watching(&config_maps()).await);
    }

    #[tokio::test]
    async fn test_events_trigger_dependent_templates() {
        let store = Arc::new(MemoryStore::new());
        store.insert_template(template("a", "shared"));
        store.insert_template(template("b", "shared"));
        store.insert_template(template("c", "unrelated"));
        let (registrar, mut rx) = registrar(&store);
        registrar.ensure_watch(&config_maps()).await.unwrap();

        store
            .emit(ChangeEvent {
                kind: config_maps(),
                namespace: Some("ns".to_string()),
                name: "shared".to_string(),
            })
            .await;

        let mut triggered = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        triggered.sort();
        assert_eq!(
            triggered,
            vec![TemplateKey::new("ns", "a"), TemplateKey::new("ns", "b")]
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_for_unreferenced_objects_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.insert_template(template("a", "shared"));
        let (registrar, mut rx) = registrar(&store);
        registrar.ensure_watch(&config_maps()).await.unwrap();

        store
            .emit(ChangeEvent {
                kind: config_maps(),
                namespace: Some("other-ns".to_string()),
                name: "shared".to_string(),
            })
            .await;

        assert!(rx.try_recv().is_err());
    }
}
