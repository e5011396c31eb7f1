mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use errors::ErrorResponse;

use crate::cli::config::StorageBackend;
use crate::engine::WorkflowEngine;
use crate::storage::WorkflowStore;
use crate::storage::cloud::CloudKvStore;
use crate::storage::local::LocalFileStore;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub store: Arc<dyn WorkflowStore>,
    pub engine: WorkflowEngine,
}

/// Rejects requests with no `Authorization: Bearer <token>` header. Applied
/// only to the `complete`/`fail` agent routes — `claim` accepts a missing
/// token by design (unscoped claim fan-out across runs).
pub async fn require_bearer_token(headers: HeaderMap, request: Request, next: Next) -> Response {
    let has_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| !token.trim().is_empty());

    if !has_token {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "missing bearer token".to_string(),
            }),
        )
            .into_response();
    }

    next.run(request).await
}

/// Start the REST API server.
pub async fn serve(
    host: &str,
    port: u16,
    store_dir: PathBuf,
    backend: StorageBackend,
    max_body: usize,
) -> Result<()> {
    let store: Arc<dyn WorkflowStore> = match backend {
        StorageBackend::Local => Arc::new(LocalFileStore::new(store_dir)),
        StorageBackend::Cloud => Arc::new(CloudKvStore::new()),
    };
    let engine = WorkflowEngine::new(store.clone());

    let state = Arc::new(AppState { store, engine });

    let token_protected = Router::new()
        .route("/complete/{stepId}", post(handlers::complete_step))
        .route("/fail/{stepId}", post(handlers::fail_step))
        .layer(middleware::from_fn(require_bearer_token));

    let app = Router::new()
        .route("/definitions", get(handlers::list_definitions))
        .route("/definitions", post(handlers::save_definition))
        .route("/definitions/{id}", get(handlers::get_definition))
        .route("/definitions/{id}", delete(handlers::delete_definition))
        .route("/runs", get(handlers::list_runs))
        .route("/runs", post(handlers::create_run))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}", delete(handlers::cancel_run))
        .route("/runs/{id}/pause", post(handlers::pause_run))
        .route("/runs/{id}/resume", post(handlers::resume_run))
        .route("/claim/{agentId}", post(handlers::claim_step))
        .merge(token_protected)
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("workflow engine API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
