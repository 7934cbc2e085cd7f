//! In-memory resource manager for tests and local wiring.
//!
//! An [`InMemoryCluster`] holds the applications; every
//! [`InMemoryConnector::connect`] returns a fresh client handle onto the same
//! cluster, so connection identity and cluster state can be observed
//! separately.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    ApplicationId, ApplicationReport, ApplicationSpec, ApplicationState, Connector, Credentials,
    FinalStatus, ResourceManager, ResourceManagerError, Result,
};

const CLUSTER_TIMESTAMP: u64 = 1_700_000_000_000;

/// One step of an application's scripted lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedReport {
    pub state: ApplicationState,
    pub final_status: FinalStatus,
    pub host: Option<String>,
}

impl ScriptedReport {
    pub fn new(state: ApplicationState, final_status: FinalStatus, host: Option<&str>) -> Self {
        Self {
            state,
            final_status,
            host: host.map(str::to_string),
        }
    }

    pub fn accepted() -> Self {
        Self::new(ApplicationState::Accepted, FinalStatus::Undefined, None)
    }

    pub fn running(host: &str) -> Self {
        Self::new(ApplicationState::Running, FinalStatus::Undefined, Some(host))
    }

    pub fn failed() -> Self {
        Self::new(ApplicationState::Failed, FinalStatus::Failed, None)
    }

    pub fn finished() -> Self {
        Self::new(ApplicationState::Finished, FinalStatus::Succeeded, None)
    }

    pub fn killed() -> Self {
        Self::new(ApplicationState::Killed, FinalStatus::Killed, None)
    }
}

struct Application {
    script: VecDeque<ScriptedReport>,
    killed: bool,
}

impl Application {
    fn next_report(&mut self) -> ScriptedReport {
        if self.killed {
            return ScriptedReport::killed();
        }
        // The last step is sticky: once the script runs out the application
        // stays where it ended up.
        if self.script.len() > 1 {
            if let Some(step) = self.script.pop_front() {
                return step;
            }
        }
        self.script
            .front()
            .cloned()
            .unwrap_or_else(|| ScriptedReport::running("localhost"))
    }
}

#[derive(Default)]
struct ClusterState {
    next_seq: u64,
    apps: HashMap<ApplicationId, Application>,
    pending_scripts: VecDeque<Vec<ScriptedReport>>,
    submit_failures: VecDeque<ResourceManagerError>,
    report_failures: VecDeque<ResourceManagerError>,
    kill_failures: VecDeque<ResourceManagerError>,
    submitted: Vec<ApplicationSpec>,
    killed: Vec<ApplicationId>,
}

/// Shared state behind every in-memory client.
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    submit_latency: Mutex<Duration>,
    submit_calls: AtomicUsize,
    report_calls: AtomicUsize,
    kill_calls: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lifecycle for the next submitted application. Without a script an
    /// application goes `ACCEPTED -> RUNNING` on `localhost`.
    pub fn script_next(&self, steps: Vec<ScriptedReport>) {
        self.state.lock().pending_scripts.push_back(steps);
    }

    /// Replace the lifecycle of an application that already exists (or plant
    /// one that was submitted before a restart).
    pub fn script(&self, id: &ApplicationId, steps: Vec<ScriptedReport>) {
        self.state.lock().apps.insert(
            id.clone(),
            Application {
                script: steps.into(),
                killed: false,
            },
        );
    }

    pub fn fail_next_submit(&self, err: ResourceManagerError) {
        self.state.lock().submit_failures.push_back(err);
    }

    pub fn fail_next_report(&self, err: ResourceManagerError) {
        self.state.lock().report_failures.push_back(err);
    }

    pub fn fail_next_kill(&self, err: ResourceManagerError) {
        self.state.lock().kill_failures.push_back(err);
    }

    /// Block every subsequent submission for `latency` on the calling thread.
    pub fn set_submit_latency(&self, latency: Duration) {
        *self.submit_latency.lock() = latency;
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn report_calls(&self) -> usize {
        self.report_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn submitted_specs(&self) -> Vec<ApplicationSpec> {
        self.state.lock().submitted.clone()
    }

    pub fn killed(&self) -> Vec<ApplicationId> {
        self.state.lock().killed.clone()
    }

    fn submit(&self, spec: &ApplicationSpec) -> Result<ApplicationId> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.submit_latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let mut state = self.state.lock();
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }
        state.next_seq += 1;
        let id = ApplicationId::new(format!(
            "application_{CLUSTER_TIMESTAMP}_{:04}",
            state.next_seq
        ));
        let script = state
            .pending_scripts
            .pop_front()
            .unwrap_or_else(|| vec![ScriptedReport::accepted(), ScriptedReport::running("localhost")]);
        state.apps.insert(
            id.clone(),
            Application {
                script: script.into(),
                killed: false,
            },
        );
        state.submitted.push(spec.clone());
        debug!(app_id = %id, queue = %spec.queue, user = %spec.user, "in-memory application submitted");
        Ok(id)
    }

    fn report(&self, id: &ApplicationId) -> Result<ApplicationReport> {
        self.report_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(err) = state.report_failures.pop_front() {
            return Err(err);
        }
        let app = state
            .apps
            .get_mut(id)
            .ok_or_else(|| ResourceManagerError::NotFound(id.clone()))?;
        let step = app.next_report();
        Ok(ApplicationReport {
            id: id.clone(),
            state: step.state,
            final_status: step.final_status,
            host: step.host,
        })
    }

    fn kill(&self, id: &ApplicationId) -> Result<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(err) = state.kill_failures.pop_front() {
            return Err(err);
        }
        let app = state
            .apps
            .get_mut(id)
            .ok_or_else(|| ResourceManagerError::NotFound(id.clone()))?;
        app.killed = true;
        state.killed.push(id.clone());
        Ok(())
    }
}

/// A connection handle onto an [`InMemoryCluster`].
pub struct InMemoryClient {
    cluster: Arc<InMemoryCluster>,
}

impl ResourceManager for InMemoryClient {
    fn submit(&self, spec: &ApplicationSpec) -> Result<ApplicationId> {
        self.cluster.submit(spec)
    }

    fn application_report(&self, id: &ApplicationId) -> Result<ApplicationReport> {
        self.cluster.report(id)
    }

    fn kill_application(&self, id: &ApplicationId) -> Result<()> {
        self.cluster.kill(id)
    }
}

pub struct InMemoryConnector {
    cluster: Arc<InMemoryCluster>,
    connect_latency: Duration,
    connections: AtomicUsize,
}

impl InMemoryConnector {
    pub fn new(cluster: Arc<InMemoryCluster>) -> Self {
        Self {
            cluster,
            connect_latency: Duration::ZERO,
            connections: AtomicUsize::new(0),
        }
    }

    /// Make every handshake block the calling thread for `latency`.
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Number of handshakes performed so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Connector for InMemoryConnector {
    fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn ResourceManager>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        if !self.connect_latency.is_zero() {
            std::thread::sleep(self.connect_latency);
        }
        Ok(Arc::new(InMemoryClient {
            cluster: Arc::clone(&self.cluster),
        }))
    }
}
