//! Session lifecycle: submit, wait for the workload, poll, stop.
//!
//! The submission state moves `Unsubmitted -> Pending -> Submitted(id) ->
//! Unsubmitted` and is written to the [`SessionStore`] on every transition,
//! `Pending` before any network call. Every resource-manager call runs on the
//! [`BlockingPool`] through a connection from the [`ClientCache`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use resource_manager::{
    ApplicationId, ApplicationReport, ApplicationState, Credentials, FinalStatus, ResourceManager,
    ResourceManagerError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clients::ClientCache;
use crate::config::SessionSettings;
use crate::error::{ControllerError, RemoteError};
use crate::metrics::{
    ACTIVE_SUBMISSIONS, KILLS, SESSIONS_STARTED, START_DURATION, STARTUP_FAILURES, SUBMISSIONS,
};
use crate::pool::BlockingPool;
use crate::session::{Session, SessionKey, SubmissionState};
use crate::sleeper::Sleeper;
use crate::spec::{build_specification, LaunchContext};
use crate::store::SessionStore;

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const PENDING_RECHECK_INTERVAL: Duration = Duration::from_millis(100);
pub const PENDING_RECHECK_ATTEMPTS: usize = 20;

pub const TOKEN_ENV: &str = "SESSION_MANAGER_API_TOKEN";
pub const SESSION_NAME_ENV: &str = "SESSION_MANAGER_SESSION_NAME";
pub const USER_ENV: &str = "SESSION_MANAGER_USER";
pub const CALLBACK_URL_ENV: &str = "SESSION_MANAGER_CALLBACK_URL";

/// Everything a controller shares with its siblings.
#[derive(Clone)]
pub struct ControllerDeps {
    pub settings: Arc<SessionSettings>,
    pub credentials: Credentials,
    pub clients: Arc<ClientCache>,
    pub pool: BlockingPool,
    pub store: Arc<dyn SessionStore>,
    pub sleeper: Arc<dyn Sleeper>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    /// Secret the workload presents when it registers its port.
    pub token: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Exited(i32),
    /// Submitted and not yet in a terminal state.
    Running,
    /// A submission is in flight; nothing can be said yet.
    Unknown,
}

pub struct SessionController {
    session: Session,
    deps: ControllerDeps,
}

impl SessionController {
    pub fn new(key: SessionKey, deps: ControllerDeps) -> Self {
        Self {
            session: Session::new(key),
            deps,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Loads the persisted submission state, if any.
    pub async fn restore(&self) -> Result<(), ControllerError> {
        let key = self.session.key();
        let Some(persisted) = self.deps.store.load(&key.storage_key()).await? else {
            return Ok(());
        };
        let state = SubmissionState::from_persisted(&persisted);
        match &state {
            SubmissionState::Unsubmitted => {}
            SubmissionState::Pending(_) => {
                warn!(session = %key, "restored a submission that was in flight at shutdown")
            }
            SubmissionState::Submitted(id) => {
                ACTIVE_SUBMISSIONS.inc();
                info!(session = %key, app_id = %id, "restored submitted application");
            }
        }
        self.session.set_submission(state);
        Ok(())
    }

    pub async fn start(&self, request: StartRequest) -> Result<SessionEndpoint, ControllerError> {
        let started = Instant::now();
        let key = self.session.key();

        let current = self.session.submission();
        if current != SubmissionState::Unsubmitted {
            return Err(ControllerError::AlreadyActive {
                state: current.label().to_string(),
            });
        }
        let spec = build_specification(&self.deps.settings, &self.launch_context(&request))?;

        let pending = SubmissionState::Pending(self.session.next_attempt());
        if !self
            .session
            .transition(&SubmissionState::Unsubmitted, pending.clone())
        {
            return Err(ControllerError::AlreadyActive {
                state: self.session.submission().label().to_string(),
            });
        }
        self.session.set_token(Some(request.token));
        self.session.reset_endpoint();
        if let Err(err) = self.persist(&pending).await {
            self.session
                .transition(&pending, SubmissionState::Unsubmitted);
            return Err(err);
        }

        info!(session = %key, queue = %spec.queue, "submitting application");
        let app_id = match self.call(move |rm| rm.submit(&spec)).await {
            Ok(id) => id,
            Err(source) => {
                SUBMISSIONS.with_label_values(&["failed"]).inc();
                warn!(session = %key, error = %source, "submission failed");
                if self
                    .session
                    .transition(&pending, SubmissionState::Unsubmitted)
                {
                    if let Err(err) = self.persist(&SubmissionState::Unsubmitted).await {
                        warn!(session = %key, error = %err, "failed to record reset after submission failure");
                    }
                }
                return Err(ControllerError::Submission {
                    user: key.user.clone(),
                    source,
                });
            }
        };
        SUBMISSIONS.with_label_values(&["ok"]).inc();

        let submitted = SubmissionState::Submitted(app_id.clone());
        if !self.session.transition(&pending, submitted.clone()) {
            // stop() gave up waiting on this submission, and the session may
            // already belong to a newer attempt; nobody owns the app now.
            warn!(session = %key, app_id = %app_id, "session stopped during submission; killing application");
            let orphan = app_id.clone();
            if let Err(err) = self.call(move |rm| rm.kill_application(&orphan)).await {
                warn!(session = %key, app_id = %app_id, error = %err, "failed to kill orphaned application");
            }
            return Err(ControllerError::Stopped { app_id });
        }
        ACTIVE_SUBMISSIONS.inc();
        // Keep Submitted in memory even if this fails so stop() can still kill it.
        self.persist(&submitted).await?;
        if let Err(err) = self.ensure_current(&app_id) {
            // stop() released the session while the record was being written
            // and its own write may have landed first.
            if let Err(store_err) = self.persist(&SubmissionState::Unsubmitted).await {
                warn!(session = %key, error = %store_err, "failed to record reset after stop");
            }
            return Err(err);
        }
        info!(session = %key, app_id = %app_id, "application submitted");

        let host = self.wait_for_running(&app_id).await?;
        let endpoint = self.wait_for_endpoint(&app_id, host).await?;

        SESSIONS_STARTED.inc();
        START_DURATION.observe(started.elapsed().as_secs_f64());
        info!(
            session = %key,
            app_id = %app_id,
            host = %endpoint.host,
            port = endpoint.port,
            "session started"
        );
        Ok(endpoint)
    }

    async fn wait_for_running(&self, app_id: &ApplicationId) -> Result<String, ControllerError> {
        loop {
            self.ensure_current(app_id)?;
            let report = self.report(app_id).await?;
            self.ensure_current(app_id)?;
            self.check_not_stopped(&report)?;
            if report.state == ApplicationState::Running {
                if let Some(host) = report.host {
                    debug!(session = %self.session.key(), app_id = %app_id, host = %host, "application running");
                    self.session.set_host(host.clone());
                    return Ok(host);
                }
                debug!(app_id = %app_id, "application running without a host yet");
            }
            self.deps.sleeper.sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_endpoint(
        &self,
        app_id: &ApplicationId,
        host: String,
    ) -> Result<SessionEndpoint, ControllerError> {
        loop {
            self.ensure_current(app_id)?;
            let port = self.session.endpoint().port;
            if port != 0 {
                return Ok(SessionEndpoint { host, port });
            }
            self.deps.sleeper.sleep(POLL_INTERVAL).await;
            let report = self.report(app_id).await?;
            self.ensure_current(app_id)?;
            self.check_not_stopped(&report)?;
        }
    }

    fn check_not_stopped(&self, report: &ApplicationReport) -> Result<(), ControllerError> {
        if report.state.is_terminal() {
            STARTUP_FAILURES.inc();
            warn!(
                session = %self.session.key(),
                app_id = %report.id,
                state = %report.state,
                "application stopped before the session came up"
            );
            return Err(ControllerError::StartupFailure {
                app_id: report.id.clone(),
                state: report.state,
            });
        }
        Ok(())
    }

    fn ensure_current(&self, app_id: &ApplicationId) -> Result<(), ControllerError> {
        match self.session.submission() {
            SubmissionState::Submitted(id) if id == *app_id => Ok(()),
            _ => Err(ControllerError::Stopped {
                app_id: app_id.clone(),
            }),
        }
    }

    /// Reports the session's exit code, or that it is still running. Never
    /// changes the submission state.
    pub async fn poll(&self) -> Result<PollStatus, ControllerError> {
        let app_id = match self.session.submission() {
            SubmissionState::Unsubmitted => return Ok(PollStatus::Exited(0)),
            SubmissionState::Pending(_) => return Ok(PollStatus::Unknown),
            SubmissionState::Submitted(id) => id,
        };
        let report = self.report(&app_id).await?;
        Ok(exit_status(&report))
    }

    pub async fn stop(&self) -> Result<(), ControllerError> {
        let key = self.session.key();
        let mut current = self.session.submission();
        if matches!(current, SubmissionState::Pending(_)) {
            for _ in 0..PENDING_RECHECK_ATTEMPTS {
                self.deps.sleeper.sleep(PENDING_RECHECK_INTERVAL).await;
                current = self.session.submission();
                if !matches!(current, SubmissionState::Pending(_)) {
                    break;
                }
            }
        }

        match current {
            SubmissionState::Unsubmitted => {
                debug!(session = %key, "nothing to stop");
                self.session.reset_endpoint();
                Ok(())
            }
            SubmissionState::Pending(attempt) => {
                warn!(
                    session = %key,
                    attempt,
                    "submission has been pending for an unreasonable amount of time; abandoning it"
                );
                if self
                    .session
                    .transition(&SubmissionState::Pending(attempt), SubmissionState::Unsubmitted)
                {
                    self.persist(&SubmissionState::Unsubmitted).await?;
                }
                self.session.reset_endpoint();
                Ok(())
            }
            SubmissionState::Submitted(app_id) => {
                let submitted = SubmissionState::Submitted(app_id.clone());
                // Released before the kill so a concurrent start() stops
                // polling instead of reporting the kill as a startup failure.
                if !self
                    .session
                    .transition(&submitted, SubmissionState::Unsubmitted)
                {
                    debug!(session = %key, app_id = %app_id, "already stopped");
                    return Ok(());
                }
                info!(session = %key, app_id = %app_id, "killing application");
                let target = app_id.clone();
                match self.call(move |rm| rm.kill_application(&target)).await {
                    Ok(()) => KILLS.with_label_values(&["ok"]).inc(),
                    Err(RemoteError::Call(ResourceManagerError::NotFound(_))) => {
                        KILLS.with_label_values(&["not_found"]).inc();
                        warn!(session = %key, app_id = %app_id, "application already gone");
                    }
                    Err(source) => {
                        KILLS.with_label_values(&["failed"]).inc();
                        warn!(session = %key, app_id = %app_id, error = %source, "kill failed");
                        if self
                            .session
                            .transition(&SubmissionState::Unsubmitted, submitted.clone())
                        {
                            if let Err(err) = self.persist(&submitted).await {
                                warn!(session = %key, app_id = %app_id, error = %err, "failed to record kept submission");
                            }
                        }
                        return Err(ControllerError::Kill { app_id, source });
                    }
                }
                ACTIVE_SUBMISSIONS.dec();
                self.session.reset_endpoint();
                self.persist(&SubmissionState::Unsubmitted).await
            }
        }
    }

    /// Stops the session and deletes its durable record, for a session the
    /// host no longer knows about.
    pub async fn forget(&self) -> Result<(), ControllerError> {
        self.stop().await?;
        self.deps
            .store
            .clear(&self.session.key().storage_key())
            .await?;
        self.session.set_token(None);
        info!(session = %self.session.key(), "session record removed");
        Ok(())
    }

    async fn report(&self, app_id: &ApplicationId) -> Result<ApplicationReport, ControllerError> {
        let id = app_id.clone();
        self.call(move |rm| rm.application_report(&id))
            .await
            .map_err(|source| ControllerError::StatusQuery {
                app_id: app_id.clone(),
                source,
            })
    }

    /// Runs `op` on the blocking pool against the cached connection. A
    /// rejected credential drops the connection so the next call reconnects.
    async fn call<T, F>(&self, op: F) -> Result<T, RemoteError>
    where
        F: FnOnce(&dyn ResourceManager) -> resource_manager::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let credentials = &self.deps.credentials;
        let client = self.deps.clients.get_client(credentials).await?;
        let worker = Arc::clone(&client);
        let result = self.deps.pool.run(move || op(worker.as_ref())).await?;
        if let Err(err) = &result {
            if err.is_auth_failure() {
                self.deps.clients.invalidate(credentials, &client);
            }
        }
        Ok(result?)
    }

    async fn persist(&self, state: &SubmissionState) -> Result<(), ControllerError> {
        self.deps
            .store
            .save(&self.session.key().storage_key(), &state.to_persisted())
            .await?;
        Ok(())
    }

    fn launch_context(&self, request: &StartRequest) -> LaunchContext {
        let key = self.session.key();
        let mut env = request.env.clone();
        env.insert(TOKEN_ENV.into(), request.token.clone());
        env.insert(SESSION_NAME_ENV.into(), key.name.clone());
        env.insert(USER_ENV.into(), key.user.clone());
        if let Some(url) = &self.deps.settings.callback_url {
            env.insert(CALLBACK_URL_ENV.into(), url.clone());
        }
        LaunchContext {
            user: key.user.clone(),
            args: request.args.clone(),
            env,
        }
    }
}

/// Final status decides the exit code; a terminal state with an undefined
/// final status falls back to the state.
pub fn exit_status(report: &ApplicationReport) -> PollStatus {
    match (report.final_status, report.state) {
        (FinalStatus::Succeeded, _) => PollStatus::Exited(0),
        (FinalStatus::Failed | FinalStatus::Killed, _) => PollStatus::Exited(1),
        (FinalStatus::Undefined, ApplicationState::Finished) => PollStatus::Exited(0),
        (FinalStatus::Undefined, ApplicationState::Failed | ApplicationState::Killed) => {
            PollStatus::Exited(1)
        }
        (FinalStatus::Undefined, _) => PollStatus::Running,
    }
}
