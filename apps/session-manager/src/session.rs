use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use resource_manager::ApplicationId;

use crate::store::PersistedState;

const PENDING_MARKER: &str = "PENDING";

/// Identifies one session: a user's default server (`name` empty) or one of
/// their named servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user: String,
    pub name: String,
}

impl SessionKey {
    pub fn new(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            name: name.into(),
        }
    }

    pub fn default_server(user: impl Into<String>) -> Self {
        Self::new(user, "")
    }

    pub fn storage_key(&self) -> String {
        if self.name.is_empty() {
            self.user.clone()
        } else {
            format!("{}/{}", self.user, self.name)
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str(&self.user)
        } else {
            write!(f, "{}:{}", self.user, self.name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubmissionState {
    #[default]
    Unsubmitted,
    /// A submission is in flight; its id is not known yet. The number names
    /// the `start()` attempt that owns it, zero for one restored from the
    /// store.
    Pending(u64),
    Submitted(ApplicationId),
}

impl SubmissionState {
    pub fn label(&self) -> &'static str {
        match self {
            SubmissionState::Unsubmitted => "unsubmitted",
            SubmissionState::Pending(_) => "pending",
            SubmissionState::Submitted(_) => "submitted",
        }
    }

    pub fn app_id(&self) -> Option<&ApplicationId> {
        match self {
            SubmissionState::Submitted(id) => Some(id),
            _ => None,
        }
    }

    pub fn to_persisted(&self) -> PersistedState {
        let app_id = match self {
            SubmissionState::Unsubmitted => String::new(),
            SubmissionState::Pending(_) => PENDING_MARKER.to_string(),
            SubmissionState::Submitted(id) => id.to_string(),
        };
        PersistedState { app_id }
    }

    pub fn from_persisted(state: &PersistedState) -> Self {
        match state.app_id.trim() {
            "" => SubmissionState::Unsubmitted,
            PENDING_MARKER => SubmissionState::Pending(0),
            id => SubmissionState::Submitted(ApplicationId::new(id)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub host: Option<String>,
    /// Zero until the workload registers.
    pub port: u16,
}

/// Shared record of one session. Locks are held only for field access.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    token: RwLock<Option<String>>,
    submission: Mutex<SubmissionState>,
    endpoint: Mutex<Endpoint>,
    attempts: AtomicU64,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            token: RwLock::new(None),
            submission: Mutex::new(SubmissionState::Unsubmitted),
            endpoint: Mutex::new(Endpoint::default()),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    pub fn token_matches(&self, candidate: &str) -> bool {
        match self.token.read().as_deref() {
            Some(token) => !token.is_empty() && token == candidate,
            None => false,
        }
    }

    pub fn submission(&self) -> SubmissionState {
        self.submission.lock().clone()
    }

    pub fn set_submission(&self, next: SubmissionState) {
        *self.submission.lock() = next;
    }

    /// Hands out a fresh, non-zero attempt number for a `Pending` state.
    pub fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Moves to `next` only if the current state is still `expected`.
    pub fn transition(&self, expected: &SubmissionState, next: SubmissionState) -> bool {
        let mut current = self.submission.lock();
        if *current == *expected {
            *current = next;
            true
        } else {
            false
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.lock().clone()
    }

    pub fn set_host(&self, host: String) {
        self.endpoint.lock().host = Some(host);
    }

    pub fn register_port(&self, port: u16) {
        self.endpoint.lock().port = port;
    }

    pub fn reset_endpoint(&self) {
        *self.endpoint.lock() = Endpoint::default();
    }
}
