//! The error taxonomy the core emits (§7 of the design), expressed as one
//! `thiserror`-derived enum with conversions to both surfaces it crosses:
//! `axum::response::IntoResponse` for REST and `tonic::Status` for RPC.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("sandbox or process not found")]
    NotFound,
    #[error("request body/url ids do not match: {0}")]
    BadRequest(String),
    #[error("no ready agent for sandbox")]
    NoReadyAgent,
    #[error("agent stream disconnected before the command could be written")]
    AgentDisconnected,
    #[error("failed to write command to agent stream: {0}")]
    AgentWriteFailed(String),
    #[error("command timed out")]
    Timeout,
    #[error("command cancelled by caller")]
    Cancelled,
    #[error("cloud provider failed to provision sandbox: {0}")]
    ProvisioningFailed(String),
    #[error("orchestrator is shutting down")]
    Shutdown,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    detail: String,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::NotFound => StatusCode::NOT_FOUND,
            OrchestratorError::BadRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NoReadyAgent
            | OrchestratorError::AgentDisconnected
            | OrchestratorError::AgentWriteFailed(_)
            | OrchestratorError::ProvisioningFailed(_)
            | OrchestratorError::Shutdown => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Timeout | OrchestratorError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.kind_name().to_string(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl OrchestratorError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OrchestratorError::NotFound => "NotFound",
            OrchestratorError::BadRequest(_) => "BadRequest",
            OrchestratorError::NoReadyAgent => "NoReadyAgent",
            OrchestratorError::AgentDisconnected => "AgentDisconnected",
            OrchestratorError::AgentWriteFailed(_) => "AgentWriteFailed",
            OrchestratorError::Timeout => "Timeout",
            OrchestratorError::Cancelled => "Cancelled",
            OrchestratorError::ProvisioningFailed(_) => "ProvisioningFailed",
            OrchestratorError::Shutdown => "Shutdown",
        }
    }
}

impl From<OrchestratorError> for tonic::Status {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound => tonic::Status::not_found(err.to_string()),
            OrchestratorError::BadRequest(_) => tonic::Status::invalid_argument(err.to_string()),
            OrchestratorError::NoReadyAgent
            | OrchestratorError::AgentDisconnected
            | OrchestratorError::AgentWriteFailed(_) => tonic::Status::unavailable(err.to_string()),
            OrchestratorError::Timeout => tonic::Status::deadline_exceeded(err.to_string()),
            OrchestratorError::Cancelled => tonic::Status::cancelled(err.to_string()),
            OrchestratorError::ProvisioningFailed(_) => tonic::Status::internal(err.to_string()),
            OrchestratorError::Shutdown => tonic::Status::unavailable(err.to_string()),
        }
    }
}
