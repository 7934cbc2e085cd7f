use std::collections::BTreeMap;

use serde::Deserialize;

use crate::spec::{ByteSpec, CpuSpec, FileSpec, LaunchCommand};

pub const CONFIG_FILE_ENV: &str = "SESSION_MANAGER_CONFIG";
const ENV_PREFIX: &str = "SESSION_MANAGER";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub log_filter: Option<String>,
    /// Bearer token the host orchestrator presents on the control API.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_blocking_threads")]
    pub blocking_threads: usize,
    #[serde(default)]
    pub state_backend: StateBackend,
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub resource_manager: ResourceManagerConfig,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Memory,
    File,
    Redis,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceManagerBackend {
    #[default]
    Memory,
    Rest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceManagerConfig {
    #[serde(default)]
    pub backend: ResourceManagerBackend,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            backend: ResourceManagerBackend::default(),
            url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Per-session submission settings shared by every session this process runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub application_name: String,
    pub queue: String,
    /// Kerberos principal the manager authenticates as.
    pub principal: Option<String>,
    pub keytab: Option<String>,
    /// Logical name in the container -> file or archive to distribute.
    pub localize_files: BTreeMap<String, FileSpec>,
    pub prologue: String,
    pub epilogue: String,
    pub cmd: LaunchCommand,
    pub mem_limit: ByteSpec,
    pub cpu_limit: CpuSpec,
    pub environment: BTreeMap<String, String>,
    /// URL the workload posts its port to; exported to the container.
    pub callback_url: Option<String>,
    /// Filled with `{prologue}`, `{command}` and `{epilogue}`.
    pub script_template: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            application_name: "interactive-session".into(),
            queue: "default".into(),
            principal: None,
            keytab: None,
            localize_files: BTreeMap::new(),
            prologue: String::new(),
            epilogue: String::new(),
            cmd: LaunchCommand::Args(vec!["jupyterhub-singleuser".into()]),
            mem_limit: ByteSpec::Text("2 G".into()),
            cpu_limit: CpuSpec::Cores(1),
            environment: BTreeMap::new(),
            callback_url: None,
            script_template: "{prologue}\n{command}\n{epilogue}".into(),
        }
    }
}

impl AppConfig {
    /// Reads the optional file named by `SESSION_MANAGER_CONFIG`, then
    /// `SESSION_MANAGER_*` environment variables (`__` separates nested keys,
    /// e.g. `SESSION_MANAGER_SESSION__QUEUE`).
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(path.trim()));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.log_filter = normalize_opt(self.log_filter.take());
        self.api_token = normalize_opt(self.api_token.take());
        self.state_dir = normalize_opt(self.state_dir.take());
        self.redis_url = normalize_opt(self.redis_url.take());
        self.resource_manager.url = normalize_opt(self.resource_manager.url.take());
        self.session.principal = normalize_opt(self.session.principal.take());
        self.session.keytab = normalize_opt(self.session.keytab.take());
        self.session.callback_url = normalize_opt(self.session.callback_url.take());
        self
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_start_timeout() -> u64 {
    300
}

fn default_blocking_threads() -> usize {
    16
}

fn default_request_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(text: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map(AppConfig::normalize)
            .unwrap()
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let cfg = from_toml("");
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.start_timeout_secs, 300);
        assert_eq!(cfg.state_backend, StateBackend::Memory);
        assert_eq!(cfg.resource_manager.backend, ResourceManagerBackend::Memory);
        assert_eq!(cfg.session.queue, "default");
        assert!(matches!(cfg.session.cpu_limit, CpuSpec::Cores(1)));
    }

    #[test]
    fn reads_session_block() {
        let cfg = from_toml(
            r#"
            api_token = "  "
            state_backend = "file"
            state_dir = "/var/lib/session-manager"

            [resource_manager]
            backend = "rest"
            url = "http://rm.example.com:8088"

            [session]
            queue = "interactive"
            principal = "hub"
            mem_limit = "512 M"
            cpu_limit = 2
            prologue = "source environment/bin/activate"
            cmd = "python -m notebook"

            [session.localize_files]
            environment = { source = "hdfs:///envs/py.tar.gz", visibility = "public" }
            data = "/srv/data.csv"
            "#,
        );
        assert_eq!(cfg.api_token, None);
        assert_eq!(cfg.state_backend, StateBackend::File);
        assert_eq!(cfg.resource_manager.backend, ResourceManagerBackend::Rest);
        assert_eq!(cfg.session.queue, "interactive");
        assert_eq!(cfg.session.principal.as_deref(), Some("hub"));
        assert!(matches!(cfg.session.mem_limit, ByteSpec::Text(ref s) if s == "512 M"));
        assert!(matches!(cfg.session.cpu_limit, CpuSpec::Cores(2)));
        assert!(matches!(cfg.session.cmd, LaunchCommand::Line(_)));
        assert!(matches!(
            cfg.session.localize_files.get("environment"),
            Some(FileSpec::Descriptor(_))
        ));
        assert!(matches!(
            cfg.session.localize_files.get("data"),
            Some(FileSpec::Path(_))
        ));
    }

    #[test]
    fn unknown_descriptor_fields_fail_to_load() {
        let result = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [session.localize_files]
                env = { source = "hdfs:///x.zip", owner = "root" }
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>());
        assert!(result.is_err());
    }
}
