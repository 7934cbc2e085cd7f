use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use super::ApiError;
use crate::state::AppState;

/// Bearer token a launched workload presents when it registers its port.
#[derive(Clone, Debug)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        bearer(parts)
            .map(|token| SessionToken(token.to_owned()))
            .ok_or(ApiError::Unauthorized)
    }
}

/// Admits a host control request. Open when no api token is configured;
/// otherwise the bearer must equal it.
#[derive(Clone, Copy, Debug)]
pub struct HostAccess;

#[async_trait]
impl FromRequestParts<AppState> for HostAccess {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match state.api_token() {
            None => Ok(HostAccess),
            Some(expected) if bearer(parts) == Some(expected) => Ok(HostAccess),
            Some(_) => Err(ApiError::Unauthorized),
        }
    }
}

/// The credential of an `Authorization: Bearer` header. The scheme is
/// case-insensitive; a blank credential counts as absent.
fn bearer(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credential) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(credential.trim()).filter(|credential| !credential.is_empty())
}
