use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use conductor_core::{ConductorError, Task};
use conductor_hub::EndpointInfo;
use conductor_orchestrator::{Command, CommandSpec, CommandStrategy, ControllerSnapshot};
use conductor_reporting::{DashboardData, MetricsSample, ProgressReport, ReportQuery};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "conductor",
        "agents_online": state.hub.online_count(),
        "tasks_in_flight": state.commands.controller().in_flight(),
    }))
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub command_id: Uuid,
}

pub async fn submit_command(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<CommandSpec>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let command_id = state.commands.execute_command(spec)?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { command_id })))
}

pub async fn list_commands(State(state): State<Arc<AppState>>) -> Json<Vec<Command>> {
    Json(state.commands.list_commands())
}

/// A command with its generated tasks.
#[derive(Debug, Serialize)]
pub struct CommandDetail {
    #[serde(flatten)]
    pub command: Command,
    pub tasks: Vec<Task>,
}

pub async fn get_command(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<CommandDetail>> {
    let command = state
        .commands
        .get_command(id)
        .ok_or_else(|| ApiError(ConductorError::NotFound(format!("command {id}"))))?;
    let tasks = state.commands.command_tasks(id).unwrap_or_default();
    Ok(Json(CommandDetail { command, tasks }))
}

pub async fn cancel_command(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Command>> {
    Ok(Json(state.commands.cancel_command(id).await?))
}

pub async fn strategies(State(state): State<Arc<AppState>>) -> Json<Vec<CommandStrategy>> {
    Json(state.commands.strategies())
}

pub async fn dashboard(State(state): State<Arc<AppState>>) -> Json<DashboardData> {
    Json(state.reporting.get_dashboard_data())
}

pub async fn reports(State(state): State<Arc<AppState>>, Query(query): Query<ReportQuery>) -> Json<Vec<ProgressReport>> {
    Json(state.reporting.get_report_history(&query))
}

#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    #[serde(default = "default_metrics_limit")]
    pub limit: usize,
}

fn default_metrics_limit() -> usize {
    100
}

pub async fn metrics(State(state): State<Arc<AppState>>, Query(params): Query<MetricsParams>) -> Json<Vec<MetricsSample>> {
    Json(state.reporting.get_metrics_history(params.limit))
}

pub async fn agents(State(state): State<Arc<AppState>>) -> Json<Vec<EndpointInfo>> {
    Json(state.hub.endpoints())
}

pub async fn pools(State(state): State<Arc<AppState>>) -> Json<ControllerSnapshot> {
    Json(state.commands.controller().snapshot())
}
