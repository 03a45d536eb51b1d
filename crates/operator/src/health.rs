//! Liveness and readiness probes
//!
//! `/healthz` answers as long as the process serves HTTP. `/readyz` waits
//! for the first full listing of ObjectTemplates to land in the index, so
//! watch events are never mapped against an empty index.

use crate::store::TemplateIndex;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Probe response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

impl HealthResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            service: "template-operator".to_string(),
        }
    }
}

pub fn router(index: Arc<TemplateIndex>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { Json(HealthResponse::new("healthy")) }))
        .route("/readyz", get(readyz))
        .with_state(index)
}

async fn readyz(State(index): State<Arc<TemplateIndex>>) -> (StatusCode, Json<HealthResponse>) {
    if index.is_synced() {
        (StatusCode::OK, Json(HealthResponse::new("ready")))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse::new("template index not synced")),
        )
    }
}

/// Serve the probes on `addr` until the listener fails
pub async fn serve(addr: SocketAddr, index: Arc<TemplateIndex>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Health probes listening");
    axum::serve(listener, router(index)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status_of(index: &Arc<TemplateIndex>, path: &str) -> StatusCode {
        router(Arc::clone(index))
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_healthz_is_always_ok() {
        let index = Arc::new(TemplateIndex::new());
        assert_eq!(status_of(&index, "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_follows_index_sync() {
        let index = Arc::new(TemplateIndex::new());
        assert_eq!(
            status_of(&index, "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        index.mark_synced();
        assert_eq!(status_of(&index, "/readyz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let index = Arc::new(TemplateIndex::new());
        assert_eq!(status_of(&index, "/metrics").await, StatusCode::NOT_FOUND);
    }
}
