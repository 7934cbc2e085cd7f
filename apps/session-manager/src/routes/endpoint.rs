use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ApiError, SessionToken};
use crate::metrics::REGISTRATIONS;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterEndpointRequest {
    pub port: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterEndpointResponse {
    pub message: String,
}

/// Called by a freshly launched workload to report the port it listens on.
pub async fn register_endpoint(
    State(state): State<AppState>,
    token: SessionToken,
    payload: Result<Json<RegisterEndpointRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterEndpointResponse>), ApiError> {
    let Json(body) = payload.map_err(|err| {
        REGISTRATIONS.with_label_values(&["malformed"]).inc();
        ApiError::BadRequest(err.body_text())
    })?;
    let port = u16::try_from(body.port)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| {
            REGISTRATIONS.with_label_values(&["malformed"]).inc();
            ApiError::BadRequest(format!("port {} is outside 1-65535", body.port))
        })?;
    let name = body.name.as_deref().filter(|name| !name.is_empty());

    let Some(controller) = state.find_by_token(token.as_str(), name) else {
        REGISTRATIONS.with_label_values(&["no_match"]).inc();
        warn!(name = ?name, port, "endpoint registration matched no session");
        let message = match name {
            Some(name) => format!("no session found for named server {name}"),
            None => "no session found for this token".to_string(),
        };
        return Err(ApiError::BadRequest(message));
    };

    controller.session().register_port(port);
    REGISTRATIONS.with_label_values(&["ok"]).inc();
    info!(session = %controller.session().key(), port, "endpoint registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterEndpointResponse {
            message: "session port configured".into(),
        }),
    ))
}
