//! HTTP server implementation using Axum.

use crate::error::SandboxError;
use crate::orchestrator::{KillOutcome, Orchestrator, SessionInfo};
use crate::sandbox::container_name;
use crate::types::{ExecutionRequest, ExecutionResult, Language, SessionKey};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

// Request/Response types
#[derive(Deserialize)]
struct SetupRequest {
    #[serde(flatten)]
    key: SessionKey,
    #[serde(default)]
    packages: Vec<String>,
    language: Language,
}

#[derive(Serialize)]
struct ResultResponse {
    container_name: String,
    #[serde(flatten)]
    result: ExecutionResult,
}

#[derive(Serialize)]
struct RemoveSessionResponse {
    container_name: String,
    session_id: String,
    removed: bool,
}

#[derive(Serialize)]
struct KeepAliveResponse {
    container_name: String,
    idle_secs: u64,
}

type ApiError = (StatusCode, String);

fn api_error(err: SandboxError) -> ApiError {
    (err.status_code(), err.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/setup", post(setup))
        .route("/execute", post(execute))
        .route("/remove_session", post(remove_session))
        .route("/kill", post(kill))
        .route("/keep_alive", post(keep_alive))
        .route("/sessions", get(list_sessions))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `port` until `shutdown` resolves, then stop every sandbox.
pub async fn run_server(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let orchestrator = state.orchestrator.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn setup(
    State(state): State<AppState>,
    Json(req): Json<SetupRequest>,
) -> Result<Json<ResultResponse>, ApiError> {
    let session_id = req.key.sandbox_id().map_err(api_error)?;
    info!("POST /setup - session: {}, packages: {:?}", session_id, req.packages);
    let result = state
        .orchestrator
        .setup(session_id, &req.packages, &req.language)
        .await
        .map_err(api_error)?;
    Ok(Json(ResultResponse {
        container_name: container_name(session_id),
        result,
    }))
}

async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecutionRequest>,
) -> Result<Json<ResultResponse>, ApiError> {
    let session_id = req.key.sandbox_id().map_err(api_error)?;
    info!("POST /execute - session: {}, blocks: {}", session_id, req.code_blocks.len());
    let result = state.orchestrator.handle(&req).await.map_err(api_error)?;
    Ok(Json(ResultResponse {
        container_name: container_name(session_id),
        result,
    }))
}

async fn remove_session(
    State(state): State<AppState>,
    Json(key): Json<SessionKey>,
) -> Result<Json<RemoveSessionResponse>, ApiError> {
    let session_id = key.sandbox_id().map_err(api_error)?;
    let folder_id = key.folder_id().map_err(api_error)?;
    info!("POST /remove_session - session: {}, folder: {}", session_id, folder_id);
    let removed = state
        .orchestrator
        .remove_session(session_id, folder_id)
        .await
        .map_err(api_error)?;
    Ok(Json(RemoveSessionResponse {
        container_name: container_name(session_id),
        session_id: folder_id.to_string(),
        removed,
    }))
}

async fn kill(
    State(state): State<AppState>,
    Json(key): Json<SessionKey>,
) -> Result<Json<KillOutcome>, ApiError> {
    let session_id = key.sandbox_id().map_err(api_error)?;
    info!("POST /kill - session: {}", session_id);
    let outcome = state.orchestrator.kill(session_id).await.map_err(api_error)?;
    Ok(Json(outcome))
}

async fn keep_alive(
    State(state): State<AppState>,
    Json(key): Json<SessionKey>,
) -> Result<Json<KeepAliveResponse>, ApiError> {
    let session_id = key.sandbox_id().map_err(api_error)?;
    let sandbox = state
        .orchestrator
        .keep_alive(session_id)
        .await
        .map_err(api_error)?;
    Ok(Json(KeepAliveResponse {
        container_name: sandbox.container_name().to_string(),
        idle_secs: sandbox.idle_for().as_secs(),
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.orchestrator.sessions().await)
}
