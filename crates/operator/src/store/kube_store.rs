//! Kubernetes implementation of the store ports
//!
//! Uses kube-rs dynamic APIs: kinds referenced by templates are resolved
//! through API discovery at runtime and cached per GroupVersionKind.

use super::{
    ChangeEvent, EventHandler, MATRIX_OBJECT_INDEX, ObjectStore, TemplateIndex, TemplateKey,
    WatchSource,
};
use crate::config::ControllerConfig;
use crate::crd::{ObjectRef, ObjectTemplate, ObjectTemplateStatus, display_gvk};
use crate::error::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Config, ResourceExt};
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    index: Arc<TemplateIndex>,
    resources: Arc<RwLock<HashMap<GroupVersionKind, (ApiResource, ApiCapabilities)>>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            index: Arc::new(TemplateIndex::new()),
            resources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a client from kubeconfig path/context, or infer it
    pub async fn create_client(config: &ControllerConfig) -> Result<Client, StoreError> {
        let options = kube::config::KubeConfigOptions {
            context: config.context.clone(),
            cluster: None,
            user: None,
        };
        let kube_config = match &config.kubeconfig_path {
            Some(path) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path).map_err(|e| {
                    StoreError::Other(format!("failed to read kubeconfig from {}: {}", path, e))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| {
                        StoreError::Other(format!("failed to create kubernetes config: {}", e))
                    })?
            }
            None if config.context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| {
                    StoreError::Other(format!("failed to create kubernetes config: {}", e))
                })?,
            None => Config::infer().await.map_err(|e| {
                StoreError::Other(format!("failed to infer kubernetes config: {}", e))
            })?,
        };

        Ok(Client::try_from(kube_config)?)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn index(&self) -> Arc<TemplateIndex> {
        Arc::clone(&self.index)
    }

    /// Keep the matrix-object index in sync with the ObjectTemplates in
    /// `namespace` (all namespaces when `None`). Runs until the stream ends.
    pub async fn maintain_index(&self, namespace: Option<&str>) {
        let api: Api<ObjectTemplate> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut initial: Vec<ObjectTemplate> = Vec::new();
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(event) = events.next().await {
            match event {
                Ok(watcher::Event::Apply(template)) => self.index.upsert(&template),
                Ok(watcher::Event::Delete(template)) => {
                    self.index.remove(&TemplateKey::from(&template))
                }
                Ok(watcher::Event::Init) => initial.clear(),
                Ok(watcher::Event::InitApply(template)) => initial.push(template),
                Ok(watcher::Event::InitDone) => {
                    self.index.replace_all(initial.iter());
                    initial.clear();
                    if !self.index.is_synced() {
                        info!(templates = self.index.len(), "Template index synced");
                    }
                    self.index.mark_synced();
                }
                Err(e) => warn!(error = %e, "ObjectTemplate index watch failed"),
            }
        }
    }

    async fn resolve(
        &self,
        kind: &GroupVersionKind,
    ) -> Result<(ApiResource, ApiCapabilities), StoreError> {
        if let Some(found) = self.resources.read().get(kind).cloned() {
            return Ok(found);
        }

        let resolved = discovery::pinned_kind(&self.client, kind)
            .await
            .map_err(|e| match e {
                kube::Error::Discovery(_) => StoreError::UnknownKind(display_gvk(kind)),
                other => StoreError::Kube(other),
            })?;
        debug!(kind = %display_gvk(kind), "Resolved API resource");
        self.resources.write().insert(kind.clone(), resolved.clone());
        Ok(resolved)
    }

    async fn dynamic_api(
        &self,
        kind: &GroupVersionKind,
        namespace: &str,
    ) -> Result<(Api<DynamicObject>, bool), StoreError> {
        let (resource, capabilities) = self.resolve(kind).await?;
        let namespaced = capabilities.scope == Scope::Namespaced;
        let api = if namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };
        Ok((api, namespaced))
    }
}

fn map_not_found(
    err: kube::Error,
    kind: &GroupVersionKind,
    namespace: &str,
    name: &str,
) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => {
            StoreError::not_found(display_gvk(kind), namespace, name)
        }
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_template(&self, key: &TemplateKey) -> Result<Option<ObjectTemplate>, StoreError> {
        let api: Api<ObjectTemplate> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn get(
        &self,
        kind: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, StoreError> {
        let (api, _) = self.dynamic_api(kind, namespace).await?;
        let object = api
            .get(name)
            .await
            .map_err(|e| map_not_found(e, kind, namespace, name))?;
        Ok(serde_json::to_value(object)?)
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

    async fn apply(&self, document: &Value, field_owner: &str) -> Result<Value, StoreError> {
        let reference =
            ObjectRef::from_document(document).map_err(|e| StoreError::Other(e.to_string()))?;
        let kind = reference
            .group_version_kind()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let namespace = reference.namespace.clone().unwrap_or_default();

        let (api, namespaced) = self.dynamic_api(&kind, &namespace).await?;
        let mut body = document.clone();
        if !namespaced {
            if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
                metadata.remove("namespace");
            }
        }

        let applied = api
            .patch(
                &reference.name,
                &PatchParams::apply(field_owner),
                &Patch::Apply(&body),
            )
            .await?;
        Ok(serde_json::to_value(applied)?)
    }

    async fn delete(
        &self,
        kind: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let (api, _) = self.dynamic_api(kind, namespace).await?;
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_not_found(e, kind, namespace, name))?;
        Ok(())
    }

    async fn patch_status(
        &self,
        template: &ObjectTemplate,
        status: &ObjectTemplateStatus,
    ) -> Result<(), StoreError> {
        let namespace = template.namespace().unwrap_or_default();
        let api: Api<ObjectTemplate> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({ "status": status });
        api.patch_status(
            &template.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WatchSource for KubeStore {
    async fn register(
        &self,
        kind: &GroupVersionKind,
        on_event: EventHandler,
    ) -> Result<(), StoreError> {
        let (resource, _) = self.resolve(kind).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let kind = kind.clone();

        let mut objects = watcher(api, watcher::Config::default())
            .default_backoff()
            .touched_objects()
            .boxed();

        tokio::spawn(async move {
            while let Some(object) = objects.next().await {
                match object {
                    Ok(object) => {
                        let event = ChangeEvent {
                            kind: kind.clone(),
                            namespace: object.namespace(),
                            name: object.name_any(),
                        };
                        on_event(event).await;
                    }
                    Err(e) => {
                        warn!(kind = %display_gvk(&kind), error = %e, "Watch stream error")
                    }
                }
            }
            warn!(kind = %display_gvk(&kind), "Watch stream ended");
        });

        Ok(())
    }
}
