//! ObjectTemplate controller wiring
//!
//! Connects the kube-runtime [`Controller`] to the [`Reconciler`]. Besides
//! changes to ObjectTemplates themselves, passes are triggered by the
//! dynamic watches of [`WatchRegistrar`] through an mpsc channel.

use crate::config::ControllerConfig;
use crate::crd::ObjectTemplate;
use crate::error::Error;
use crate::path::JsonPathQuery;
use crate::reconciler::Reconciler;
use crate::store::{KubeStore, TemplateKey};
use crate::template::HandlebarsEngine;
use crate::watcher::WatchRegistrar;
use futures::{Stream, StreamExt, stream};
use kube::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared state handed to every reconcile call
pub struct Context {
    pub reconciler: Reconciler,
    pub error_requeue: Duration,
}

/// Run the controller until SIGTERM or Ctrl+C
pub async fn run(store: Arc<KubeStore>, config: ControllerConfig) {
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let registrar = Arc::new(WatchRegistrar::new(store.clone(), store.clone(), trigger_tx));
    let context = Arc::new(Context {
        reconciler: Reconciler::new(
            store.clone(),
            registrar,
            Arc::new(JsonPathQuery),
            Arc::new(HandlebarsEngine::new()),
            config.clone(),
        ),
        error_requeue: config.error_requeue,
    });

    let index_store = Arc::clone(&store);
    let namespace = config.namespace.clone();
    let index_task =
        tokio::spawn(async move { index_store.maintain_index(namespace.as_deref()).await });

    let templates: Api<ObjectTemplate> = match &config.namespace {
        Some(ns) => Api::namespaced(store.client().clone(), ns),
        None => Api::all(store.client().clone()),
    };
    let concurrency = u16::try_from(config.max_concurrent_reconciles).unwrap_or(u16::MAX);
    info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        concurrency, "ObjectTemplate controller starting"
    );

    Controller::new(templates, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .reconcile_on(triggers(trigger_rx))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(template = %object, "Reconcile finished"),
                Err(e) => warn!(error = %e, "Reconcile failed"),
            }
        })
        .await;

    index_task.abort();
    info!("ObjectTemplate controller stopped");
}

/// Reconcile requests coming from dynamic watches
fn triggers(
    receiver: mpsc::UnboundedReceiver<TemplateKey>,
) -> impl Stream<Item = ObjectRef<ObjectTemplate>> + Send + 'static {
    stream::unfold(receiver, |mut receiver| async move {
        let key = receiver.recv().await?;
        let object = ObjectRef::new(&key.name).within(&key.namespace);
        Some((object, receiver))
    })
}

async fn reconcile(template: Arc<ObjectTemplate>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = TemplateKey::from(template.as_ref());
    let report = ctx.reconciler.reconcile(&key).await?;
    Ok(next_action(report.and_then(|r| r.requeue_after)))
}

fn next_action(requeue_after: Option<Duration>) -> Action {
    match requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

fn error_policy(template: Arc<ObjectTemplate>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        template = %TemplateKey::from(template.as_ref()),
        error = %error,
        "Reconcile error, requeueing"
    );
    Action::requeue(ctx.error_requeue)
}
