use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::{map_controller_err, ApiError, HostAccess};
use crate::controller::{PollStatus, SessionEndpoint, StartRequest};
use crate::session::SessionKey;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub state: &'static str,
    pub app_id: Option<String>,
    pub exit_code: Option<i32>,
}

/// `?remove=true` also deletes the session's durable record, as when the
/// host deletes the server.
#[derive(Debug, Default, Deserialize)]
pub struct StopParams {
    #[serde(default)]
    pub remove: bool,
}

pub async fn start_default(
    State(state): State<AppState>,
    Path(user): Path<String>,
    _access: HostAccess,
    Json(body): Json<StartRequest>,
) -> Result<(StatusCode, Json<SessionEndpoint>), ApiError> {
    start_session(state, SessionKey::default_server(user), body).await
}

pub async fn start_named(
    State(state): State<AppState>,
    Path((user, name)): Path<(String, String)>,
    _access: HostAccess,
    Json(body): Json<StartRequest>,
) -> Result<(StatusCode, Json<SessionEndpoint>), ApiError> {
    start_session(state, SessionKey::new(user, name), body).await
}

pub async fn poll_default(
    State(state): State<AppState>,
    Path(user): Path<String>,
    _access: HostAccess,
) -> Result<Json<PollResponse>, ApiError> {
    poll_session(state, SessionKey::default_server(user)).await
}

pub async fn poll_named(
    State(state): State<AppState>,
    Path((user, name)): Path<(String, String)>,
    _access: HostAccess,
) -> Result<Json<PollResponse>, ApiError> {
    poll_session(state, SessionKey::new(user, name)).await
}

pub async fn stop_default(
    State(state): State<AppState>,
    Path(user): Path<String>,
    _access: HostAccess,
    Query(params): Query<StopParams>,
) -> Result<StatusCode, ApiError> {
    stop_session(state, SessionKey::default_server(user), params).await
}

pub async fn stop_named(
    State(state): State<AppState>,
    Path((user, name)): Path<(String, String)>,
    _access: HostAccess,
    Query(params): Query<StopParams>,
) -> Result<StatusCode, ApiError> {
    stop_session(state, SessionKey::new(user, name), params).await
}

async fn start_session(
    state: AppState,
    key: SessionKey,
    body: StartRequest,
) -> Result<(StatusCode, Json<SessionEndpoint>), ApiError> {
    if body.token.trim().is_empty() {
        return Err(ApiError::BadRequest("token must not be empty".into()));
    }
    let controller = state.controller(&key).await.map_err(map_controller_err)?;
    // Detached so a dropped request cannot cancel a submission half way.
    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(body).await })
    };
    match tokio::time::timeout(state.start_timeout(), task).await {
        Ok(Ok(Ok(endpoint))) => Ok((StatusCode::CREATED, Json(endpoint))),
        Ok(Ok(Err(err))) => Err(map_controller_err(err)),
        Ok(Err(join_err)) => {
            error!(session = %key, error = %join_err, "start task failed");
            Err(ApiError::Internal("start task failed".into()))
        }
        Err(_) => {
            warn!(
                session = %key,
                timeout_secs = state.start_timeout().as_secs(),
                "session did not start in time; stopping it"
            );
            if let Err(err) = controller.stop().await {
                warn!(session = %key, error = %err, "stop after start timeout failed");
            }
            Err(ApiError::Timeout(format!(
                "session {key} did not start within {}s",
                state.start_timeout().as_secs()
            )))
        }
    }
}

async fn poll_session(state: AppState, key: SessionKey) -> Result<Json<PollResponse>, ApiError> {
    let controller = state.controller(&key).await.map_err(map_controller_err)?;
    let status = controller.poll().await.map_err(map_controller_err)?;
    let app_id = controller
        .session()
        .submission()
        .app_id()
        .map(|id| id.to_string());
    let response = match status {
        PollStatus::Exited(code) => PollResponse {
            state: "stopped",
            app_id,
            exit_code: Some(code),
        },
        PollStatus::Running => PollResponse {
            state: "running",
            app_id,
            exit_code: None,
        },
        PollStatus::Unknown => PollResponse {
            state: "pending",
            app_id,
            exit_code: None,
        },
    };
    Ok(Json(response))
}

async fn stop_session(
    state: AppState,
    key: SessionKey,
    params: StopParams,
) -> Result<StatusCode, ApiError> {
    let controller = state.controller(&key).await.map_err(map_controller_err)?;
    if params.remove {
        controller.forget().await.map_err(map_controller_err)?;
        state.remove(&key);
    } else {
        controller.stop().await.map_err(map_controller_err)?;
    }
    Ok(StatusCode::NO_CONTENT)
}
