mod auth;
mod endpoint;
mod servers;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::error::ControllerError;
use crate::metrics;
use crate::state::AppState;

pub use auth::{HostAccess, SessionToken};
pub use endpoint::*;
pub use servers::*;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/sessions/endpoint", post(register_endpoint))
        .route(
            "/users/:user/server",
            post(start_default).get(poll_default).delete(stop_default),
        )
        .route(
            "/users/:user/servers/:name",
            post(start_named).get(poll_named).delete(stop_named),
        )
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn render_metrics() -> Result<Response, ApiError> {
    let body = metrics::encode().map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Conflict(String),
    BadRequest(String),
    Upstream(String),
    Timeout(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg)),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream", Some(msg)),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "timeout", Some(msg)),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", Some(msg)),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

pub fn map_controller_err(err: ControllerError) -> ApiError {
    match err {
        ControllerError::Configuration(_) => ApiError::BadRequest(err.to_string()),
        ControllerError::AlreadyActive { .. } | ControllerError::Stopped { .. } => {
            ApiError::Conflict(err.to_string())
        }
        ControllerError::Submission { .. }
        | ControllerError::StartupFailure { .. }
        | ControllerError::StatusQuery { .. }
        | ControllerError::Kill { .. } => ApiError::Upstream(err.to_string()),
        ControllerError::Store(_) => {
            error!(error = %err, "session state store failed");
            ApiError::Internal(err.to_string())
        }
    }
}
