//! `relay serve`: the HTTP front door.
//!
//! `POST /` runs one turn and streams its events as server-sent events.
//! Only one run streams at a time; a second `POST /` while one is in flight
//! gets `409 Conflict`.
//! The remaining routes interrupt the active run or edit the workspace
//! layout used by the next run.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use relay_core::workspace::{WorkflowConfig, is_valid_repo_name};
use relay_core::{RunController, normalize_run_request};

use crate::config::repo_entry;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkflowRequest {
    git_url: String,
    branch: Option<String>,
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddRepoRequest {
    url: String,
    branch: Option<String>,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RemoveRepoRequest {
    name: String,
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::bad_request(format!("invalid JSON body: {e}")))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(controller: Arc<RunController>) -> Router {
    Router::new()
        .route("/", post(run))
        .route("/interrupt", post(interrupt))
        .route("/workflow", post(change_workflow))
        .route("/repos/add", post(add_repo))
        .route("/repos/remove", post(remove_repo))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(controller)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(controller: Arc<RunController>, bind: &str) -> Result<()> {
    let app = build_router(controller);
    let addr: SocketAddr = bind.parse()?;
    info!("relay serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("relay serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn run(State(controller): State<Arc<RunController>>, body: Bytes) -> Result<Response, AppError> {
    let value: Value = parse_body(&body)?;
    let request = normalize_run_request(value, &controller.settings().session_id)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    info!(thread_id = %request.thread_id, run_id = %request.run_id, "processing run");

    let events = controller.try_process_run(request).map_err(|e| {
        warn!(error = %e, "rejecting overlapping run");
        AppError::conflict("A run is already in progress")
    })?;
    let events = events.map(|event| {
        Ok::<_, Infallible>(match Event::default().json_data(&event) {
            Ok(sse) => sse,
            Err(e) => {
                warn!(error = %e, "failed to encode event");
                Event::default().comment("encode error")
            }
        })
    });

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response())
}

async fn interrupt(State(controller): State<Arc<RunController>>) -> Result<Json<Value>, AppError> {
    controller.interrupt().await.map_err(AppError::internal)?;
    Ok(Json(json!({ "message": "Interrupt signal sent to Claude SDK" })))
}

async fn change_workflow(
    State(controller): State<Arc<RunController>>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let req: WorkflowRequest = parse_body(&body)?;
    let branch = req
        .branch
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| "main".to_string());
    info!(git_url = %req.git_url, branch = %branch, path = %req.path, "workflow change request");

    let mut layout = controller.workspace();
    layout.active_workflow = (!req.git_url.trim().is_empty()).then(|| WorkflowConfig {
        git_url: req.git_url.clone(),
        branch: branch.clone(),
        path: Some(req.path.clone()).filter(|p| !p.trim().is_empty()),
    });
    controller.set_workspace(layout);
    controller.reset_conversation();

    Ok(Json(json!({
        "message": "Workflow updated",
        "gitUrl": req.git_url,
        "branch": branch,
        "path": req.path,
    })))
}

async fn add_repo(
    State(controller): State<Arc<RunController>>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let req: AddRepoRequest = parse_body(&body)?;
    if req.url.trim().is_empty() {
        return Err(AppError::bad_request("Repository URL is required"));
    }
    let branch = req
        .branch
        .filter(|b| !b.trim().is_empty())
        .unwrap_or_else(|| "main".to_string());
    let repo = repo_entry(req.url.trim(), Some(&branch), Some(&req.name)).ok_or_else(|| {
        AppError::bad_request(format!("cannot derive a repository name from {}", req.url))
    })?;
    if !is_valid_repo_name(&repo.name) {
        return Err(AppError::bad_request(format!("Invalid repository name: {}", repo.name)));
    }
    info!(name = %repo.name, url = %repo.url, branch = %branch, "adding repository");

    let mut layout = controller.workspace();
    let name = repo.name.clone();
    let path = layout.repo_dir(&name);
    layout.upsert_repo(repo);
    controller.set_workspace(layout);
    controller.reset_conversation();

    Ok(Json(json!({
        "message": "Repository added",
        "name": name,
        "path": path.to_string_lossy(),
    })))
}

async fn remove_repo(
    State(controller): State<Arc<RunController>>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let req: RemoveRepoRequest = parse_body(&body)?;
    let mut layout = controller.workspace();
    if !layout.remove_repo(&req.name) {
        warn!(name = %req.name, "remove requested for unknown repository");
    }
    controller.set_workspace(layout);
    controller.reset_conversation();
    info!(name = %req.name, "repository removed");
    Ok(Json(json!({ "message": "Repository removed" })))
}

async fn health(State(controller): State<Arc<RunController>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "session_id": controller.settings().session_id,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
