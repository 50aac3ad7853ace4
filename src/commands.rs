//! HTTP control surface.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::Result;
use crate::instance::{
    InstanceStatus, KillAllReport, KillOutcome, ManagedProcess, Orchestrator, PoolStatus,
    ReconcileReport, StartOutcome, StopOutcome,
};
use crate::registry::Repository;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRepositoryRequest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub path: PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(pool_status))
        .route("/api/instances", get(list_instances))
        .route("/api/kill-all", post(kill_all))
        .route("/api/instances/{repo_id}", get(instance_status))
        .route("/api/instances/{repo_id}/start", post(start_instance))
        .route("/api/instances/{repo_id}/stop", post(stop_instance))
        .route("/api/processes", get(list_processes))
        .route("/api/processes/{pid}/kill", post(kill_process))
        .route("/api/reconcile", post(reconcile))
        .route(
            "/api/repositories",
            get(list_repositories).post(register_repository),
        )
        .route(
            "/api/repositories/{repo_id}",
            axum::routing::delete(remove_repository),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn pool_status(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.orchestrator.pool_status())
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceStatus>> {
    Json(state.orchestrator.list_instances())
}

async fn instance_status(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<InstanceStatus>> {
    state.orchestrator.instance_status(&repo_id).map(Json)
}

async fn start_instance(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<StartOutcome>> {
    state.orchestrator.start(&repo_id).await.map(Json)
}

async fn stop_instance(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<StopOutcome>> {
    state.orchestrator.stop(&repo_id).await.map(Json)
}

async fn kill_all(State(state): State<AppState>) -> Json<KillAllReport> {
    Json(state.orchestrator.kill_all().await)
}

async fn list_processes(State(state): State<AppState>) -> Result<Json<Vec<ManagedProcess>>> {
    state.orchestrator.list_os_processes().map(Json)
}

async fn kill_process(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> Result<Json<KillOutcome>> {
    state.orchestrator.kill_by_pid(pid).await.map(Json)
}

async fn reconcile(State(state): State<AppState>) -> Json<ReconcileReport> {
    Json(state.orchestrator.reconcile().await)
}

async fn list_repositories(State(state): State<AppState>) -> Json<Vec<Repository>> {
    Json(state.orchestrator.list_repositories())
}

async fn register_repository(
    State(state): State<AppState>,
    Json(request): Json<RegisterRepositoryRequest>,
) -> Result<Json<Repository>> {
    let name = request.name.unwrap_or_default();
    state
        .orchestrator
        .register_repository(Repository::new(request.id, name, request.path))
        .map(Json)
}

async fn remove_repository(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<Repository>> {
    state.orchestrator.remove_repository(&repo_id).await.map(Json)
}
