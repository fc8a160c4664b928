//! Operator HTTP routes: GitHub webhook, status API and health probe.

pub mod api;
pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::controller::QueueHandle;
use crate::models::{Environment, Instance};
use crate::services::identity_service::IdentityProvider;
use crate::store::Api;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct RouterState {
    pub environments: Api<Environment>,
    pub instances: Api<Instance>,
    pub identity: Option<Arc<dyn IdentityProvider>>,
    pub environment_queue: QueueHandle,
    pub instance_queue: QueueHandle,
    /// Empty disables signature checks.
    pub webhook_secret: String,
}

pub fn router(state: RouterState) -> Router {
    Router::new()
        .route("/webhook/github", post(webhook_handler))
        .route("/api/environments", get(list_environments))
        .route("/api/environments/{name}/instances", get(list_instances))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state, &headers, body).await
}

// ── Status API ──

#[derive(Debug, Deserialize)]
struct ListParams {
    owner: Option<String>,
}

async fn list_environments(
    State(state): State<RouterState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<api::EnvironmentJson>>, StatusCode> {
    api::list_environments(&state.environments, params.owner.as_deref())
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("List environments error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn list_instances(
    State(state): State<RouterState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<api::InstanceJson>>, StatusCode> {
    match api::list_instances(&state.environments, &state.instances, &name).await {
        Ok(Some(instances)) => Ok(Json(instances)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("List instances error: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}
