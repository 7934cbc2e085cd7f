use resource_manager::{ApplicationId, ApplicationState, ResourceManagerError};

use crate::pool::PoolError;
use crate::spec::ConfigError;
use crate::store::StoreError;

/// Failure of a single trip to the resource manager.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("could not connect to resource manager: {0}")]
    Connect(#[source] ResourceManagerError),
    #[error(transparent)]
    Call(#[from] ResourceManagerError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl RemoteError {
    pub fn is_auth_failure(&self) -> bool {
        match self {
            RemoteError::Connect(err) | RemoteError::Call(err) => err.is_auth_failure(),
            RemoteError::Pool(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid session configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("session already has an active submission ({state})")]
    AlreadyActive { state: String },
    #[error("submission for {user} failed: {source}")]
    Submission {
        user: String,
        #[source]
        source: RemoteError,
    },
    #[error("application {app_id} stopped during start-up ({state})")]
    StartupFailure {
        app_id: ApplicationId,
        state: ApplicationState,
    },
    #[error("status query for {app_id} failed: {source}")]
    StatusQuery {
        app_id: ApplicationId,
        #[source]
        source: RemoteError,
    },
    #[error("session was stopped while {app_id} was starting")]
    Stopped { app_id: ApplicationId },
    #[error("kill of {app_id} failed: {source}")]
    Kill {
        app_id: ApplicationId,
        #[source]
        source: RemoteError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
