//! YARN ResourceManager REST client.
//!
//! Uses the cluster-applications API (`/ws/v1/cluster/apps`). Authentication is
//! Hadoop "simple" auth: the principal travels as `user.name`, and the session
//! owner as `doAs` when it differs from the principal.

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    ApplicationId, ApplicationReport, ApplicationSpec, ApplicationState, Connector, Credentials,
    FileSource, FinalStatus, ResourceManager, ResourceManagerError, Result,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RestConnector {
    base_url: String,
    timeout: Duration,
}

impl RestConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Connector for RestConnector {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ResourceManager>> {
        if credentials.keytab.is_some() {
            warn!(
                principal = ?credentials.principal,
                "keytab configured but the REST backend only supports simple auth; ignoring keytab"
            );
        }
        let http = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| ResourceManagerError::Unreachable(err.to_string()))?;
        let client = RestResourceManager {
            http,
            base_url: self.base_url.clone(),
            principal: credentials.principal.clone(),
        };
        client.handshake()?;
        Ok(Arc::new(client))
    }
}

pub struct RestResourceManager {
    http: Client,
    base_url: String,
    principal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewApplication {
    #[serde(rename = "application-id")]
    application_id: String,
}

#[derive(Debug, Deserialize)]
struct AppEnvelope {
    app: AppBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppBody {
    id: String,
    state: String,
    final_status: String,
    #[serde(default)]
    am_host_http_address: Option<String>,
}

impl RestResourceManager {
    fn url(&self, path: &str) -> String {
        format!("{}/ws/v1/cluster{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder, do_as: Option<&str>) -> RequestBuilder {
        let mut query: Vec<(&str, &str)> = Vec::new();
        match (self.principal.as_deref(), do_as) {
            (Some(principal), Some(user)) if principal != user => {
                query.push(("user.name", principal));
                query.push(("doAs", user));
            }
            (Some(principal), _) => query.push(("user.name", principal)),
            (None, Some(user)) => query.push(("user.name", user)),
            (None, None) => {}
        }
        request.query(&query)
    }

    fn handshake(&self) -> Result<()> {
        let resp = self
            .authed(self.http.get(self.url("/info")), None)
            .send()
            .map_err(transport_err)?;
        check_status(resp)?;
        debug!(base_url = %self.base_url, "resource manager handshake complete");
        Ok(())
    }

    fn submission_body(&self, id: &str, spec: &ApplicationSpec) -> Result<Value> {
        let mut resources = Vec::with_capacity(spec.master.files.len());
        for (name, file) in &spec.master.files {
            let FileSource::Remote(url) = &file.source else {
                return Err(ResourceManagerError::Unsupported(format!(
                    "file `{name}` has local source {}; stage it on a distributed filesystem first",
                    file.source
                )));
            };
            let (Some(size), Some(timestamp)) = (file.size, file.timestamp) else {
                return Err(ResourceManagerError::Unsupported(format!(
                    "file `{name}` needs size and timestamp for localization"
                )));
            };
            resources.push(json!({
                "key": name,
                "value": {
                    "resource": url,
                    "type": file.file_type.as_wire(),
                    "visibility": file.visibility.as_wire(),
                    "size": size,
                    "timestamp": timestamp,
                }
            }));
        }
        let environment: Vec<Value> = spec
            .master
            .env
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        let command = format!(
            "/bin/bash -c {} 1><LOG_DIR>/stdout 2><LOG_DIR>/stderr",
            shell_quote(&spec.master.script)
        );
        Ok(json!({
            "application-id": id,
            "application-name": spec.name,
            "queue": spec.queue,
            "application-type": "YARN",
            "unmanaged-AM": false,
            "max-app-attempts": 1,
            "keep-containers-across-application-attempts": false,
            "resource": {
                "memory": spec.master.resources.memory_mib(),
                "vCores": spec.master.resources.vcores,
            },
            "am-container-spec": {
                "local-resources": { "entry": resources },
                "environment": { "entry": environment },
                "commands": { "command": command },
            },
        }))
    }
}

impl ResourceManager for RestResourceManager {
    fn submit(&self, spec: &ApplicationSpec) -> Result<ApplicationId> {
        let resp = self
            .authed(
                self.http.post(self.url("/apps/new-application")),
                Some(&spec.user),
            )
            .send()
            .map_err(transport_err)?;
        let created: NewApplication = check_status(resp)?.json().map_err(protocol_err)?;
        let body = self.submission_body(&created.application_id, spec)?;
        let resp = self
            .authed(self.http.post(self.url("/apps")), Some(&spec.user))
            .json(&body)
            .send()
            .map_err(transport_err)?;
        check_status(resp)?;
        Ok(ApplicationId::new(created.application_id))
    }

    fn application_report(&self, id: &ApplicationId) -> Result<ApplicationReport> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/apps/{id}"))), None)
            .send()
            .map_err(transport_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ResourceManagerError::NotFound(id.clone()));
        }
        let envelope: AppEnvelope = check_status(resp)?.json().map_err(protocol_err)?;
        let app = envelope.app;
        if app.id != id.as_str() {
            return Err(ResourceManagerError::Protocol(format!(
                "asked for {id}, got report for {}",
                app.id
            )));
        }
        Ok(ApplicationReport {
            id: id.clone(),
            state: app.state.parse::<ApplicationState>()?,
            final_status: app.final_status.parse::<FinalStatus>()?,
            host: app
                .am_host_http_address
                .as_deref()
                .and_then(host_part)
                .map(str::to_string),
        })
    }

    fn kill_application(&self, id: &ApplicationId) -> Result<()> {
        let resp = self
            .authed(self.http.put(self.url(&format!("/apps/{id}/state"))), None)
            .json(&json!({ "state": "KILLED" }))
            .send()
            .map_err(transport_err)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ResourceManagerError::NotFound(id.clone()));
        }
        check_status(resp)?;
        Ok(())
    }
}

fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ResourceManagerError::Unauthorized(format!("{status}: {body}"))
        }
        s if s.is_client_error() => ResourceManagerError::Rejected(format!("{status}: {body}")),
        _ => ResourceManagerError::Unreachable(format!("{status}: {body}")),
    })
}

fn transport_err(err: reqwest::Error) -> ResourceManagerError {
    ResourceManagerError::Unreachable(err.to_string())
}

fn protocol_err(err: reqwest::Error) -> ResourceManagerError {
    ResourceManagerError::Protocol(err.to_string())
}

fn host_part(address: &str) -> Option<&str> {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    };
    (!host.is_empty()).then_some(host)
}

fn shell_quote(script: &str) -> String {
    format!("'{}'", script.replace('\'', r"'\''"))
}
