//! Reconciliation pass for a single ObjectTemplate
//!
//! fetch → ensure watches → build matrix → render → apply/prune → status.
//! Whatever happens in between, the pass ends with one status patch
//! carrying the `Ready` condition.

use crate::apply::Applier;
use crate::config::ControllerConfig;
use crate::crd::{
    MatrixSource, ObjectTemplate, ObjectTemplateStatus, ready_condition, set_condition,
};
use crate::error::Result;
use crate::matrix::MatrixBuilder;
use crate::path::PathQuery;
use crate::store::{ObjectStore, TemplateKey};
use crate::template::{Renderer, TemplateEngine};
use crate::watcher::WatchRegistrar;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What a completed pass wrote and when the next one is due
#[derive(Debug, Clone)]
pub struct PassReport {
    pub status: ObjectTemplateStatus,
    /// `None` when the template asks for no periodic requeue
    pub requeue_after: Option<Duration>,
    pub error: Option<String>,
}

impl PassReport {
    pub fn is_ready(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    registrar: Arc<WatchRegistrar>,
    paths: Arc<dyn PathQuery>,
    renderer: Renderer,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registrar: Arc<WatchRegistrar>,
        paths: Arc<dyn PathQuery>,
        engine: Arc<dyn TemplateEngine>,
        config: ControllerConfig,
    ) -> Self {
        let renderer = Renderer::new(engine, config.max_parallelism);
        Self {
            store,
            registrar,
            paths,
            renderer,
            config,
        }
    }

    /// Run one pass. `Ok(None)` means the template no longer exists.
    ///
    /// Errors inside the pass end up in the `Ready` condition; only a
    /// failure to read the template or to persist its status is returned.
    #[instrument(skip(self), fields(template = %key))]
    pub async fn reconcile(&self, key: &TemplateKey) -> Result<Option<PassReport>> {
        let Some(template) = self.store.get_template(key).await? else {
            debug!("ObjectTemplate is gone");
            return Ok(None);
        };

        let mut status = template.status.clone().unwrap_or_default();
        let (requeue_after, outcome) = match template.interval() {
            Ok(interval) => {
                let outcome = self.run_pass(&template, &mut status).await;
                (Some(interval).filter(|i| !i.is_zero()), outcome)
            }
            Err(e) => (Some(self.config.error_requeue), Err(e)),
        };

        let error = outcome.err().map(|e| e.to_string());
        match &error {
            None => info!(
                resources = status.applied_resources.len(),
                "ObjectTemplate reconciled"
            ),
            Some(message) => warn!(error = %message, "ObjectTemplate reconciliation failed"),
        }

        set_condition(
            &mut status.conditions,
            ready_condition(
                error.clone().map_or(Ok(()), Err),
                template.metadata.generation,
            ),
        );
        self.store.patch_status(&template, &status).await?;

        Ok(Some(PassReport {
            status,
            requeue_after,
            error,
        }))
    }

    /// Everything between fetching the template and writing its status.
    /// `status.applied_resources` is replaced only once apply/prune ran.
    async fn run_pass(
        &self,
        template: &ObjectTemplate,
        status: &mut ObjectTemplateStatus,
    ) -> Result<()> {
        template.validate()?;
        for entry in &template.spec.matrix {
            if let MatrixSource::Object(object) = entry.source()? {
                let kind = object.reference.group_version_kind()?;
                self.registrar.ensure_watch(&kind).await?;
            }
        }

        let contexts = MatrixBuilder::new(self.store.as_ref(), self.paths.as_ref())
            .build(template)
            .await?;
        let desired = self.renderer.render_all(template, contexts).await?;

        let report = Applier::new(
            self.store.as_ref(),
            &self.config.field_manager,
            self.config.max_parallelism,
        )
        .reconcile_resources(template, desired)
        .await?;
        debug!(
            applied = report.applied_resources.len(),
            deleted = report.deleted,
            "Apply/prune finished"
        );

        status.applied_resources = report.applied_resources;
        match report.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
