//! Client-side model of a cluster resource manager.
//!
//! The session manager only ever talks to a resource manager through the
//! [`ResourceManager`] trait: submit an application, read its report, kill it.
//! Every call is blocking (a network round-trip plus, for real clusters, a
//! credential exchange), so callers are expected to run them on a blocking
//! thread pool rather than on an async executor thread.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod memory;
pub mod rest;

pub use memory::{InMemoryCluster, InMemoryConnector, ScriptedReport};
pub use rest::{RestConnector, RestResourceManager};

/// Opaque handle the resource manager hands back for a submitted application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(String);

impl ApplicationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity used to authenticate against the resource manager.
///
/// Two equal `Credentials` values are interchangeable: a connection opened
/// with one may be reused for the other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub principal: Option<String>,
    pub keytab: Option<String>,
}

impl Credentials {
    pub fn new(principal: Option<String>, keytab: Option<String>) -> Self {
        Self { principal, keytab }
    }
}

/// Fully resolved submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub name: String,
    pub queue: String,
    pub user: String,
    pub master: MasterSpec,
}

/// The single container that hosts the session workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterSpec {
    pub resources: Resources,
    pub files: BTreeMap<String, LocalFile>,
    pub env: BTreeMap<String, String>,
    pub script: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub memory_bytes: u64,
    pub vcores: u32,
}

impl Resources {
    /// Memory in mebibytes, rounded up; the unit resource managers schedule in.
    pub fn memory_mib(&self) -> u64 {
        self.memory_bytes.div_ceil(1024 * 1024)
    }
}

/// A file or archive the resource manager distributes to the container
/// before the workload starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFile {
    pub source: FileSource,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum FileSource {
    /// Path on the machine running the session manager.
    Local(PathBuf),
    /// URL on a distributed filesystem, e.g. `hdfs:///envs/py.tar.gz`.
    Remote(String),
}

impl fmt::Display for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Local(path) => write!(f, "{}", path.display()),
            FileSource::Remote(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Archive,
}

impl FileType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            FileType::File => "FILE",
            FileType::Archive => "ARCHIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    Application,
}

impl Visibility {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Visibility::Public => "PUBLIC",
            Visibility::Private => "PRIVATE",
            Visibility::Application => "APPLICATION",
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            "application" => Ok(Visibility::Application),
            other => Err(format!("unknown visibility `{other}`")),
        }
    }
}

/// Scheduler-side lifecycle state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationState {
    New,
    NewSaving,
    Submitted,
    Accepted,
    Running,
    Finished,
    Failed,
    Killed,
}

impl ApplicationState {
    /// States the application never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationState::Finished | ApplicationState::Failed | ApplicationState::Killed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationState::New => "NEW",
            ApplicationState::NewSaving => "NEW_SAVING",
            ApplicationState::Submitted => "SUBMITTED",
            ApplicationState::Accepted => "ACCEPTED",
            ApplicationState::Running => "RUNNING",
            ApplicationState::Finished => "FINISHED",
            ApplicationState::Failed => "FAILED",
            ApplicationState::Killed => "KILLED",
        }
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationState {
    type Err = ResourceManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NEW" => ApplicationState::New,
            "NEW_SAVING" => ApplicationState::NewSaving,
            "SUBMITTED" => ApplicationState::Submitted,
            "ACCEPTED" => ApplicationState::Accepted,
            "RUNNING" => ApplicationState::Running,
            "FINISHED" => ApplicationState::Finished,
            "FAILED" => ApplicationState::Failed,
            "KILLED" => ApplicationState::Killed,
            other => {
                return Err(ResourceManagerError::Protocol(format!(
                    "unknown application state `{other}`"
                )))
            }
        })
    }
}

/// Outcome the application reported when it exited; `Undefined` while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    Undefined,
    Succeeded,
    Failed,
    Killed,
}

impl FromStr for FinalStatus {
    type Err = ResourceManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "UNDEFINED" => FinalStatus::Undefined,
            "SUCCEEDED" => FinalStatus::Succeeded,
            "FAILED" => FinalStatus::Failed,
            "KILLED" => FinalStatus::Killed,
            other => {
                return Err(ResourceManagerError::Protocol(format!(
                    "unknown final status `{other}`"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationReport {
    pub id: ApplicationId,
    pub state: ApplicationState,
    pub final_status: FinalStatus,
    /// Host running the application's container, once it has one.
    pub host: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceManagerError {
    #[error("resource manager unreachable: {0}")]
    Unreachable(String),
    #[error("resource manager rejected request: {0}")]
    Rejected(String),
    #[error("authentication failed: {0}")]
    Unauthorized(String),
    #[error("application {0} not found")]
    NotFound(ApplicationId),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("unsupported request: {0}")]
    Unsupported(String),
}

impl ResourceManagerError {
    /// Whether the failure means the connection's credentials are no longer
    /// accepted; a fresh connection might succeed where this one cannot.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ResourceManagerError::Unauthorized(_))
    }
}

pub type Result<T, E = ResourceManagerError> = std::result::Result<T, E>;

/// An established, authenticated connection to a resource manager.
pub trait ResourceManager: Send + Sync {
    fn submit(&self, spec: &ApplicationSpec) -> Result<ApplicationId>;
    fn application_report(&self, id: &ApplicationId) -> Result<ApplicationReport>;
    fn kill_application(&self, id: &ApplicationId) -> Result<()>;
}

/// Opens connections. Each call performs a full handshake.
pub trait Connector: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ResourceManager>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ApplicationState::Finished.is_terminal());
        assert!(ApplicationState::Failed.is_terminal());
        assert!(ApplicationState::Killed.is_terminal());
        assert!(!ApplicationState::Running.is_terminal());
        assert!(!ApplicationState::Accepted.is_terminal());
    }

    #[test]
    fn parses_wire_states() {
        assert_eq!(
            "NEW_SAVING".parse::<ApplicationState>().unwrap(),
            ApplicationState::NewSaving
        );
        assert_eq!(
            "SUCCEEDED".parse::<FinalStatus>().unwrap(),
            FinalStatus::Succeeded
        );
        assert!("running".parse::<ApplicationState>().is_err());
    }

    #[test]
    fn memory_rounds_up_to_mebibytes() {
        let r = Resources {
            memory_bytes: 512 * 1024 * 1024 + 1,
            vcores: 1,
        };
        assert_eq!(r.memory_mib(), 513);
    }
}
