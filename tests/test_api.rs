//! Router-level tests for the REST API: handlers and AppState are public,
//! so we build the same route table `api::serve` wires up and drive it
//! in-process via `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::middleware;
use axum::routing::{delete, get, post};
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt;

use crewflow::api::AppState;
use crewflow::api::handlers;
use crewflow::engine::WorkflowEngine;
use crewflow::engine::types::*;
use crewflow::storage::local::LocalFileStore;

// Mirrors `api::serve`'s route table, including the bearer-token middleware
// gating `/complete` and `/fail` (but not `/claim`, which accepts an absent
// token by design).
fn router(state: Arc<AppState>) -> Router {
    let token_protected = Router::new()
        .route("/complete/{stepId}", post(handlers::complete_step))
        .route("/fail/{stepId}", post(handlers::fail_step))
        .layer(middleware::from_fn(crewflow::api::require_bearer_token));

    Router::new()
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
        .with_state(state)
}

async fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn crewflow::storage::WorkflowStore> = Arc::new(LocalFileStore::new(dir.path()));
    let engine = WorkflowEngine::new(store.clone());
    (Arc::new(AppState { store, engine }), dir)
}

fn single_step_def(id: &str, agent_id: &str) -> StepDef {
    StepDef {
        id: id.to_string(),
        agent_id: agent_id.to_string(),
        input_template: "{{task}}".to_string(),
        expects: None,
        kind: StepKind::Single,
        max_retries: 2,
    }
}

fn demo_def() -> WorkflowDef {
    let now = Utc::now();
    WorkflowDef {
        id: "wf-api".into(),
        name: "api-demo".into(),
        description: None,
        steps: vec![single_step_def("plan", "planner"), single_step_def("build", "builder")],
        created_at: now,
        updated_at: now,
    }
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn save_and_list_definitions() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let def = serde_json::to_value(demo_def()).unwrap();
    let response = app
        .clone()
        .oneshot(json_request("POST", "/definitions", def))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/definitions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn get_missing_definition_is_404() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/definitions/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_run_then_claim_complete_advances() {
    let (state, _dir) = test_state().await;
    state.store.save_def(&demo_def()).await.unwrap();
    let app = router(state);

    let create = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/runs",
            serde_json::json!({ "workflow_id": "wf-api", "task": "ship it" }),
        ))
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::OK);
    let created = json_body(create).await;
    let run_id = created["id"].as_str().unwrap().to_string();
    let run_token = created["run_token"].as_str().unwrap().to_string();

    let claim = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/claim/planner")
                .header(header::AUTHORIZATION, format!("Bearer {run_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(claim.status(), StatusCode::OK);
    let claimed = json_body(claim).await;
    assert_eq!(claimed["found"], true);
    let step_id = claimed["step_id"].as_str().unwrap().to_string();

    let complete = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/complete/{step_id}"))
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {run_token}"))
                .body(Body::from(serde_json::json!({ "output": "STATUS: done" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(complete.status(), StatusCode::OK);
    let result = json_body(complete).await;
    assert_eq!(result["advanced"], true);
    assert_eq!(result["run_completed"], false);

    let fetched = app
        .oneshot(
            Request::builder()
                .uri(format!("/runs/{run_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);
    let run = json_body(fetched).await;
    assert_eq!(run["steps"][1]["status"], "pending");
}

#[tokio::test]
async fn complete_step_with_wrong_token_is_unauthorized() {
    let (state, _dir) = test_state().await;
    state.store.save_def(&demo_def()).await.unwrap();
    let app = router(state);

    let create = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/runs",
            serde_json::json!({ "workflow_id": "wf-api", "task": "t" }),
        ))
        .await
        .unwrap();
    let created = json_body(create).await;
    let _run_id = created["id"].as_str().unwrap().to_string();

    let claim = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/claim/planner")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let claimed = json_body(claim).await;
    let step_id = claimed["step_id"].as_str().unwrap();

    let complete = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/complete/{step_id}"))
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, "Bearer wrong-token")
                .body(Body::from(serde_json::json!({ "output": "ok" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(complete.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn complete_step_without_any_token_is_unauthorized() {
    let (state, _dir) = test_state().await;
    state.store.save_def(&demo_def()).await.unwrap();
    let app = router(state);

    app.clone()
        .oneshot(json_request(
            "POST",
            "/runs",
            serde_json::json!({ "workflow_id": "wf-api", "task": "t" }),
        ))
        .await
        .unwrap();

    let claim = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/claim/planner")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let claimed = json_body(claim).await;
    let step_id = claimed["step_id"].as_str().unwrap();

    let complete = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/complete/{step_id}"),
            serde_json::json!({ "output": "ok" }),
        ))
        .await
        .unwrap();
    assert_eq!(complete.status(), StatusCode::UNAUTHORIZED);

    let fail = app
        .oneshot(json_request(
            "POST",
            &format!("/fail/{step_id}"),
            serde_json::json!({ "error": "boom" }),
        ))
        .await
        .unwrap();
    assert_eq!(fail.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn pause_resume_and_cancel_run() {
    let (state, _dir) = test_state().await;
    state.store.save_def(&demo_def()).await.unwrap();
    let app = router(state);

    let create = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/runs",
            serde_json::json!({ "workflow_id": "wf-api", "task": "t" }),
        ))
        .await
        .unwrap();
    let created = json_body(create).await;
    let run_id = created["id"].as_str().unwrap().to_string();

    let paused = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/runs/{run_id}/pause"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(paused.status(), StatusCode::OK);
    assert_eq!(json_body(paused).await["status"], "paused");

    let resumed = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/runs/{run_id}/resume"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resumed.status(), StatusCode::OK);
    assert_eq!(json_body(resumed).await["status"], "running");

    let cancelled = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/runs/{run_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status(), StatusCode::OK);
    assert_eq!(json_body(cancelled).await["status"], "cancelled");
}

#[tokio::test]
async fn list_runs_filters_by_status() {
    let (state, _dir) = test_state().await;
    state.store.save_def(&demo_def()).await.unwrap();
    let app = router(state);

    for _ in 0..2 {
        app.clone()
            .oneshot(json_request(
                "POST",
                "/runs",
                serde_json::json!({ "workflow_id": "wf-api", "task": "t" }),
            ))
            .await
            .unwrap();
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri("/runs?status=running")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["runs"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn create_run_for_unknown_workflow_is_404() {
    let (state, _dir) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(json_request(
            "POST",
            "/runs",
            serde_json::json!({ "workflow_id": "missing", "task": "t" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
