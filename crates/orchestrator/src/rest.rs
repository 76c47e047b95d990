//! C7: the client-facing REST surface — sandbox CRUD, command
//! submit/status/logs/terminate, plus `/health`. JSON in, JSON out,
//! camelCase field names, built on `axum` the way this codebase's other
//! services expose their HTTP surfaces.

use crate::cloud_provider::SandboxConfiguration;
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::metrics::Metrics;
use crate::state::{CommandOutcome, OrchestratorState, ProcessRecord, SandboxRecord, SandboxStatus};
use crate::{process, sandbox};
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

pub struct AppState {
    pub state: Arc<OrchestratorState>,
    pub metrics: Arc<Metrics>,
    pub config: Config,
    pub started_at: Instant,
}

pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sandboxes", post(create_sandbox_handler).get(list_sandboxes_handler))
        .route("/api/sandboxes/:id", get(get_sandbox_handler).delete(delete_sandbox_handler))
        .route("/api/sandboxes/:id/commands", post(submit_command_handler))
        .route("/api/sandboxes/:id/commands/:pid/status", get(get_status_handler))
        .route("/api/sandboxes/:id/commands/:pid/logs", get(get_logs_handler))
        .route("/api/sandboxes/:id/commands/:pid", delete(terminate_handler))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

// ===== request/response bodies =====

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest {
    #[serde(default)]
    configuration: Option<SandboxConfiguration>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SandboxSummary {
    id: String,
    status: SandboxStatus,
    public_ip: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SandboxDetail {
    id: String,
    status: SandboxStatus,
    public_ip: Option<String>,
    configuration: SandboxConfiguration,
}

impl From<&Arc<SandboxRecord>> for SandboxSummary {
    fn from(r: &Arc<SandboxRecord>) -> Self {
        Self { id: r.sandbox_id.clone(), status: r.status(), public_ip: r.public_ip(), created_at: r.created_at }
    }
}

impl From<&Arc<SandboxRecord>> for SandboxDetail {
    fn from(r: &Arc<SandboxRecord>) -> Self {
        Self { id: r.sandbox_id.clone(), status: r.status(), public_ip: r.public_ip(), configuration: r.configuration.clone() }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListSandboxesResponse {
    sandboxes: Vec<SandboxSummary>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitCommandRequest {
    sandbox_id: String,
    command: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitCommandResponse {
    process_id: String,
    command: String,
    is_running: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandResultBody {
    exit_code: i32,
    standard_output: String,
    standard_error: String,
    duration_ms: u64,
}

impl From<CommandOutcome> for CommandResultBody {
    fn from(o: CommandOutcome) -> Self {
        Self { exit_code: o.exit_code, standard_output: o.stdout, standard_error: o.stderr, duration_ms: o.duration_ms }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    process_id: String,
    is_running: bool,
    result: Option<CommandResultBody>,
}

impl From<&Arc<ProcessRecord>> for StatusResponse {
    fn from(r: &Arc<ProcessRecord>) -> Self {
        Self { process_id: r.process_id.clone(), is_running: r.is_running(), result: r.result().map(Into::into) }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogsResponse {
    log_lines: Vec<String>,
}

// ===== handlers =====

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

async fn health_handler(State(app): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy", uptime_seconds: app.started_at.elapsed().as_secs() })
}

async fn create_sandbox_handler(State(app): State<Arc<AppState>>, body: Option<Json<CreateSandboxRequest>>) -> Result<Json<SandboxSummary>, OrchestratorError> {
    app.metrics.rest_requests_total.inc();
    let configuration = body.and_then(|b| b.0.configuration).unwrap_or_default();
    let record = sandbox::create_sandbox(&app.state, configuration, &app.config.orchestrator_public_endpoint).await?;
    let active = app.state.sandboxes.iter().filter(|e| e.value().status() != SandboxStatus::Deleted).count();
    app.metrics.update_active_sandboxes(active as i64);
    Ok(Json((&record).into()))
}

async fn get_sandbox_handler(State(app): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<SandboxDetail>, OrchestratorError> {
    app.metrics.rest_requests_total.inc();
    let record = sandbox::get_sandbox(&app.state, &id)?;
    Ok(Json((&record).into()))
}

async fn list_sandboxes_handler(State(app): State<Arc<AppState>>) -> Json<ListSandboxesResponse> {
    app.metrics.rest_requests_total.inc();
    let sandboxes = sandbox::list_sandboxes(&app.state).iter().map(Into::into).collect();
    Json(ListSandboxesResponse { sandboxes })
}

async fn delete_sandbox_handler(State(app): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<MessageResponse>, OrchestratorError> {
    app.metrics.rest_requests_total.inc();
    sandbox::delete_sandbox(&app.state, &app.metrics, &id)?;
    Ok(Json(MessageResponse { message: "sandbox deletion accepted".to_string() }))
}

async fn submit_command_handler(
    State(app): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SubmitCommandRequest>,
) -> Result<Json<SubmitCommandResponse>, OrchestratorError> {
    app.metrics.rest_requests_total.inc();
    if body.sandbox_id != id {
        return Err(OrchestratorError::BadRequest(format!("url sandbox id {id} does not match body sandbox id {}", body.sandbox_id)));
    }

    let record = process::submit_command(&app.state, &app.metrics, &id, body.command.clone(), app.config.default_command_timeout, app.config.stale_threshold).await?;
    app.metrics.commands_dispatched_total.inc();

    Ok(Json(SubmitCommandResponse { process_id: record.process_id.clone(), command: body.command, is_running: true }))
}

async fn get_status_handler(State(app): State<Arc<AppState>>, Path((id, pid)): Path<(String, String)>) -> Result<Json<StatusResponse>, OrchestratorError> {
    app.metrics.rest_requests_total.inc();
    let record = process::get_status(&app.state, &id, &pid)?;
    Ok(Json((&record).into()))
}

async fn get_logs_handler(State(app): State<Arc<AppState>>, Path((id, pid)): Path<(String, String)>) -> Result<Json<LogsResponse>, OrchestratorError> {
    app.metrics.rest_requests_total.inc();
    let log_lines = process::get_logs(&app.state, &id, &pid)?;
    Ok(Json(LogsResponse { log_lines }))
}

async fn terminate_handler(State(app): State<Arc<AppState>>, Path((id, pid)): Path<(String, String)>) -> Result<Json<MessageResponse>, OrchestratorError> {
    app.metrics.rest_requests_total.inc();
    process::terminate(&app.state, &id, &pid, app.config.stale_threshold).await?;
    Ok(Json(MessageResponse { message: "terminate signal sent".to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_provider::FakeCloudProvider;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let state = OrchestratorState::new(FakeCloudProvider::new());
        let app_state = Arc::new(AppState {
            state,
            metrics: Arc::new(Metrics::new()),
            config: Config {
                rest_listen_addr: "0.0.0.0:0".parse().unwrap(),
                grpc_listen_addr: "0.0.0.0:0".parse().unwrap(),
                metrics_listen_addr: "0.0.0.0:0".parse().unwrap(),
                orchestrator_public_endpoint: "http://127.0.0.1:50051".to_string(),
                heartbeat_interval: Duration::from_secs(30),
                stale_threshold: Duration::from_secs(120),
                default_command_timeout: Duration::from_secs(300),
                sweep_interval: Duration::from_secs(30),
            },
            started_at: Instant::now(),
        });
        router(app_state)
    }

    #[tokio::test]
    async fn create_sandbox_returns_creating_status() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().method("POST").uri("/api/sandboxes").header("content-type", "application/json").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "Creating");
    }

    #[tokio::test]
    async fn get_unknown_sandbox_is_404() {
        let app = test_app();
        let resp = app.oneshot(Request::builder().uri("/api/sandboxes/ghost").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn submit_command_mismatched_ids_is_400() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sandboxes/s1/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sandboxId":"s2","command":"echo hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_command_with_no_agent_is_500() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/sandboxes/s1/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sandboxId":"s1","command":"echo hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "NoReadyAgent");
    }
}
