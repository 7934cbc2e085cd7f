//! Translation of [`SessionSettings`] into an [`ApplicationSpec`].
//!
//! Everything here is pure: no I/O, no clock. Malformed settings surface as a
//! [`ConfigError`] before anything is sent to the resource manager.

use std::collections::BTreeMap;
use std::path::PathBuf;

use resource_manager::{
    ApplicationSpec, FileSource, FileType, LocalFile, MasterSpec, Resources, Visibility,
};
use serde::{Deserialize, Serialize};

use crate::config::{ResourceManagerBackend, SessionSettings};

const ARCHIVE_SUFFIXES: &[&str] = &[".zip", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid memory limit `{value}`: {reason}")]
    InvalidMemory { value: String, reason: &'static str },
    #[error("invalid cpu limit `{value}`: {reason}")]
    InvalidCpu { value: String, reason: &'static str },
    #[error("invalid localized file `{name}`: {reason}")]
    InvalidFile { name: String, reason: String },
    #[error("invalid script template: {0}")]
    InvalidTemplate(String),
    #[error("launch command is empty")]
    EmptyCommand,
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("setting `{setting}` is not supported by the {backend} backend: {reason}")]
    Unsupported {
        setting: String,
        backend: &'static str,
        reason: String,
    },
}

/// Memory limit as written in configuration: a byte count or shorthand like `"2 G"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ByteSpec {
    Count(i64),
    Text(String),
}

/// CPU limit as written in configuration. Only whole cores are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CpuSpec {
    Cores(i64),
    Fractional(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LaunchCommand {
    Line(String),
    Args(Vec<String>),
}

/// A file to localize: either a bare source or a structured descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileSpec {
    Path(String),
    Descriptor(FileDescriptor),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDescriptor {
    pub source: String,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default, rename = "type")]
    pub file_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Per-start inputs that are not part of the shared settings.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    pub user: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

pub fn build_specification(
    settings: &SessionSettings,
    launch: &LaunchContext,
) -> Result<ApplicationSpec, ConfigError> {
    if settings.queue.trim().is_empty() {
        return Err(ConfigError::Missing("queue"));
    }
    if launch.user.trim().is_empty() {
        return Err(ConfigError::Missing("user"));
    }

    let resources = Resources {
        memory_bytes: resolve_memory(&settings.mem_limit)?,
        vcores: resolve_cpu(&settings.cpu_limit)?,
    };

    let mut files = BTreeMap::new();
    for (name, spec) in &settings.localize_files {
        files.insert(name.clone(), normalize_file(name, spec)?);
    }

    let mut env = settings.environment.clone();
    env.extend(launch.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let command = launch_command(&settings.cmd, &launch.args)?;
    let script = render_script(
        &settings.script_template,
        &settings.prologue,
        &command,
        &settings.epilogue,
    )?;

    Ok(ApplicationSpec {
        name: settings.application_name.clone(),
        queue: settings.queue.clone(),
        user: launch.user.clone(),
        master: MasterSpec {
            resources,
            files,
            env,
            script,
        },
    })
}

/// Dry run used at startup so bad settings stop the process before it serves.
pub fn validate_settings(settings: &SessionSettings) -> Result<(), ConfigError> {
    let dry_run = LaunchContext {
        user: "settings-check".into(),
        ..LaunchContext::default()
    };
    build_specification(settings, &dry_run).map(|_| ())
}

/// Rejects settings the configured backend could never submit. The REST
/// backend speaks simple auth only and localizes files straight from a
/// distributed filesystem, so it needs remote sources with size and timestamp.
pub fn validate_for_backend(
    settings: &SessionSettings,
    backend: ResourceManagerBackend,
) -> Result<(), ConfigError> {
    if backend != ResourceManagerBackend::Rest {
        return Ok(());
    }
    let unsupported = |setting: String, reason: String| ConfigError::Unsupported {
        setting,
        backend: "rest",
        reason,
    };
    if settings.keytab.is_some() {
        return Err(unsupported(
            "keytab".into(),
            "only simple authentication is available".into(),
        ));
    }
    for (name, spec) in &settings.localize_files {
        let file = normalize_file(name, spec)?;
        let setting = format!("localize_files.{name}");
        if let FileSource::Local(path) = &file.source {
            return Err(unsupported(
                setting,
                format!(
                    "local source {} must be staged on a distributed filesystem",
                    path.display()
                ),
            ));
        }
        if file.size.is_none() || file.timestamp.is_none() {
            return Err(unsupported(
                setting,
                "remote sources need size and timestamp".into(),
            ));
        }
    }
    Ok(())
}

/// Parses `<number>[ ]<K|M|G|T>` (binary multiples) or a bare byte count.
pub fn parse_byte_size(text: &str) -> Result<u64, ConfigError> {
    let invalid = |reason| ConfigError::InvalidMemory {
        value: text.to_string(),
        reason,
    };
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(invalid("expected a positive number"));
    }
    let multiplier: u64 = match suffix.trim_start() {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => return Err(invalid("unknown suffix, expected K, M, G or T")),
    };
    let bytes = if number.contains('.') {
        let value: f64 = number.parse().map_err(|_| invalid("not a number"))?;
        let bytes = value * multiplier as f64;
        if !bytes.is_finite() || bytes >= u64::MAX as f64 {
            return Err(invalid("too large"));
        }
        bytes as u64
    } else {
        let value: u64 = number.parse().map_err(|_| invalid("not a number"))?;
        value
            .checked_mul(multiplier)
            .ok_or_else(|| invalid("too large"))?
    };
    if bytes == 0 {
        return Err(invalid("must be positive"));
    }
    Ok(bytes)
}

pub fn resolve_memory(spec: &ByteSpec) -> Result<u64, ConfigError> {
    match spec {
        ByteSpec::Count(n) if *n > 0 => Ok(*n as u64),
        ByteSpec::Count(n) => Err(ConfigError::InvalidMemory {
            value: n.to_string(),
            reason: "must be positive",
        }),
        ByteSpec::Text(text) => parse_byte_size(text),
    }
}

pub fn resolve_cpu(spec: &CpuSpec) -> Result<u32, ConfigError> {
    let cores = match spec {
        CpuSpec::Cores(n) => *n,
        CpuSpec::Fractional(f) if f.fract() == 0.0 && f.is_finite() => *f as i64,
        CpuSpec::Fractional(f) => {
            return Err(ConfigError::InvalidCpu {
                value: f.to_string(),
                reason: "fractional cores are not supported",
            })
        }
        CpuSpec::Text(text) => {
            let trimmed = text.trim();
            match trimmed.parse::<i64>() {
                Ok(n) => n,
                Err(_) if trimmed.parse::<f64>().is_ok() => {
                    return Err(ConfigError::InvalidCpu {
                        value: text.clone(),
                        reason: "fractional cores are not supported",
                    })
                }
                Err(_) => {
                    return Err(ConfigError::InvalidCpu {
                        value: text.clone(),
                        reason: "not an integer",
                    })
                }
            }
        }
    };
    if cores < 1 {
        return Err(ConfigError::InvalidCpu {
            value: cores.to_string(),
            reason: "must be at least 1",
        });
    }
    u32::try_from(cores).map_err(|_| ConfigError::InvalidCpu {
        value: cores.to_string(),
        reason: "too large",
    })
}

pub fn normalize_file(name: &str, spec: &FileSpec) -> Result<LocalFile, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidFile {
        name: name.to_string(),
        reason,
    };
    if name.trim().is_empty() {
        return Err(invalid("logical name is empty".into()));
    }
    let descriptor = match spec {
        FileSpec::Path(source) => FileDescriptor {
            source: source.clone(),
            visibility: None,
            file_type: None,
            size: None,
            timestamp: None,
        },
        FileSpec::Descriptor(descriptor) => descriptor.clone(),
    };

    let source = descriptor.source.trim();
    if source.is_empty() {
        return Err(invalid("source is empty".into()));
    }
    let source = match source.strip_prefix("file://") {
        Some(path) if !path.is_empty() => FileSource::Local(PathBuf::from(path)),
        Some(_) => return Err(invalid("source is empty".into())),
        None if source.contains("://") => FileSource::Remote(source.to_string()),
        None => FileSource::Local(PathBuf::from(source)),
    };

    let visibility = match descriptor.visibility.as_deref() {
        None => Visibility::Application,
        Some(v) => v.parse::<Visibility>().map_err(invalid)?,
    };

    let file_type = match descriptor.file_type.as_deref().map(str::to_ascii_lowercase) {
        None => infer_file_type(&descriptor.source),
        Some(t) if t == "file" => FileType::File,
        Some(t) if t == "archive" => FileType::Archive,
        Some(other) => return Err(invalid(format!("unknown type `{other}`"))),
    };

    Ok(LocalFile {
        source,
        file_type,
        visibility,
        size: descriptor.size,
        timestamp: descriptor.timestamp,
    })
}

fn infer_file_type(source: &str) -> FileType {
    let lower = source.to_ascii_lowercase();
    if ARCHIVE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
        FileType::Archive
    } else {
        FileType::File
    }
}

fn launch_command(cmd: &LaunchCommand, args: &[String]) -> Result<String, ConfigError> {
    let mut parts: Vec<&str> = match cmd {
        LaunchCommand::Line(line) => vec![line.as_str()],
        LaunchCommand::Args(args) => args.iter().map(String::as_str).collect(),
    };
    parts.retain(|part| !part.trim().is_empty());
    if parts.is_empty() {
        return Err(ConfigError::EmptyCommand);
    }
    parts.extend(args.iter().map(String::as_str));
    Ok(parts.join(" "))
}

/// Fills `{prologue}`, `{command}` and `{epilogue}`; `{{` and `}}` are literal braces.
pub fn render_script(
    template: &str,
    prologue: &str,
    command: &str,
    epilogue: &str,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len() + prologue.len() + command.len() + epilogue.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => {
                            return Err(ConfigError::InvalidTemplate(
                                "unterminated placeholder".into(),
                            ))
                        }
                    }
                }
                match name.as_str() {
                    "prologue" => out.push_str(prologue),
                    "command" => out.push_str(command),
                    "epilogue" => out.push_str(epilogue),
                    other => {
                        return Err(ConfigError::InvalidTemplate(format!(
                            "unknown placeholder `{{{other}}}`"
                        )))
                    }
                }
            }
            '}' => {
                return Err(ConfigError::InvalidTemplate(
                    "single `}` outside a placeholder".into(),
                ))
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(user: &str) -> LaunchContext {
        LaunchContext {
            user: user.into(),
            ..LaunchContext::default()
        }
    }

    #[test]
    fn suffixed_sizes_use_binary_multiples() {
        for (suffix, power) in [("K", 1u32), ("M", 2), ("G", 3), ("T", 4)] {
            for n in [1u64, 3, 512, 1000] {
                let parsed = parse_byte_size(&format!("{n}{suffix}")).unwrap();
                assert_eq!(parsed, n * 1024u64.pow(power), "{n}{suffix}");
                let spaced = parse_byte_size(&format!("{n} {suffix}")).unwrap();
                assert_eq!(spaced, parsed);
            }
        }
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size("1.5G").unwrap(), 3 * 512 * 1024 * 1024);
    }

    #[test]
    fn rejects_bad_sizes() {
        for bad in ["", "G", "12X", "12 KB", "-5G", "0", "0 M", "1..5G", "99999999999T"] {
            assert!(
                matches!(parse_byte_size(bad), Err(ConfigError::InvalidMemory { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(resolve_memory(&ByteSpec::Count(0)).is_err());
        assert!(resolve_memory(&ByteSpec::Count(-1024)).is_err());
        assert_eq!(resolve_memory(&ByteSpec::Count(2048)).unwrap(), 2048);
    }

    #[test]
    fn cpu_must_be_a_whole_positive_count() {
        assert_eq!(resolve_cpu(&CpuSpec::Cores(1)).unwrap(), 1);
        assert_eq!(resolve_cpu(&CpuSpec::Cores(16)).unwrap(), 16);
        assert_eq!(resolve_cpu(&CpuSpec::Text(" 4 ".into())).unwrap(), 4);
        assert_eq!(resolve_cpu(&CpuSpec::Fractional(2.0)).unwrap(), 2);
        for bad in [
            CpuSpec::Cores(0),
            CpuSpec::Cores(-2),
            CpuSpec::Fractional(1.5),
            CpuSpec::Text("0.5".into()),
            CpuSpec::Text("many".into()),
        ] {
            assert!(matches!(
                resolve_cpu(&bad),
                Err(ConfigError::InvalidCpu { .. })
            ));
        }
    }

    #[test]
    fn builds_resources_and_queue() {
        let settings = SessionSettings {
            mem_limit: ByteSpec::Text("512 M".into()),
            cpu_limit: CpuSpec::Cores(2),
            queue: "default".into(),
            ..SessionSettings::default()
        };
        let spec = build_specification(&settings, &launch("alice")).unwrap();
        assert_eq!(spec.master.resources.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(spec.master.resources.vcores, 2);
        assert_eq!(spec.queue, "default");
        assert_eq!(spec.user, "alice");
    }

    #[test]
    fn script_orders_prologue_command_epilogue() {
        let settings = SessionSettings {
            prologue: "source environment/bin/activate".into(),
            epilogue: "echo done".into(),
            cmd: LaunchCommand::Args(vec!["python".into(), "-m".into(), "notebook".into()]),
            ..SessionSettings::default()
        };
        let ctx = LaunchContext {
            user: "alice".into(),
            args: vec!["--port=0".into(), "--debug".into()],
            env: BTreeMap::new(),
        };
        let spec = build_specification(&settings, &ctx).unwrap();
        assert_eq!(
            spec.master.script,
            "source environment/bin/activate\npython -m notebook --port=0 --debug\necho done"
        );
    }

    #[test]
    fn template_escapes_and_rejects_unknown_placeholders() {
        assert_eq!(
            render_script("{{x}} {prologue};{command}", "p", "c", "e").unwrap(),
            "{x} p;c"
        );
        assert!(matches!(
            render_script("{prologue}\n{singleuser}", "", "", ""),
            Err(ConfigError::InvalidTemplate(_))
        ));
        assert!(render_script("{command", "", "", "").is_err());
        assert!(render_script("oops }", "", "", "").is_err());
    }

    #[test]
    fn launch_env_overrides_settings_env() {
        let mut settings = SessionSettings::default();
        settings.environment.insert("MODE".into(), "batch".into());
        settings.environment.insert("KEEP".into(), "1".into());
        let mut ctx = launch("alice");
        ctx.env.insert("MODE".into(), "interactive".into());
        let spec = build_specification(&settings, &ctx).unwrap();
        assert_eq!(spec.master.env["MODE"], "interactive");
        assert_eq!(spec.master.env["KEEP"], "1");
    }

    #[test]
    fn normalizes_both_file_forms() {
        let bare = normalize_file("data", &FileSpec::Path("/srv/data.csv".into())).unwrap();
        assert_eq!(bare.source, FileSource::Local(PathBuf::from("/srv/data.csv")));
        assert_eq!(bare.file_type, FileType::File);
        assert_eq!(bare.visibility, Visibility::Application);

        let archive = normalize_file(
            "environment",
            &FileSpec::Descriptor(FileDescriptor {
                source: "hdfs:///envs/py.tar.gz".into(),
                visibility: Some("public".into()),
                file_type: None,
                size: Some(10),
                timestamp: Some(20),
            }),
        )
        .unwrap();
        assert_eq!(
            archive.source,
            FileSource::Remote("hdfs:///envs/py.tar.gz".into())
        );
        assert_eq!(archive.file_type, FileType::Archive);
        assert_eq!(archive.visibility, Visibility::Public);
        assert_eq!(archive.size, Some(10));

        let explicit = normalize_file("blob", &FileSpec::Path("file:///tmp/blob.zip".into())).unwrap();
        assert_eq!(explicit.source, FileSource::Local(PathBuf::from("/tmp/blob.zip")));
        assert_eq!(explicit.file_type, FileType::Archive);
    }

    #[test]
    fn malformed_file_descriptors_fail_fast() {
        let descriptor = |source: &str, visibility: Option<&str>, kind: Option<&str>| {
            FileSpec::Descriptor(FileDescriptor {
                source: source.into(),
                visibility: visibility.map(str::to_string),
                file_type: kind.map(str::to_string),
                size: None,
                timestamp: None,
            })
        };
        assert!(normalize_file("x", &descriptor("", None, None)).is_err());
        assert!(normalize_file("x", &descriptor("hdfs:///a", Some("world"), None)).is_err());
        assert!(normalize_file("x", &descriptor("hdfs:///a", None, Some("directory"))).is_err());
        assert!(normalize_file("", &FileSpec::Path("/a".into())).is_err());

        let mut settings = SessionSettings::default();
        settings
            .localize_files
            .insert("x".into(), descriptor("  ", None, None));
        assert!(matches!(
            build_specification(&settings, &launch("alice")),
            Err(ConfigError::InvalidFile { .. })
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        let settings = SessionSettings {
            cmd: LaunchCommand::Args(vec![]),
            ..SessionSettings::default()
        };
        assert_eq!(
            validate_settings(&settings),
            Err(ConfigError::EmptyCommand)
        );
        assert!(validate_settings(&SessionSettings::default()).is_ok());
    }

    fn remote(source: &str, size: Option<u64>, timestamp: Option<i64>) -> FileSpec {
        FileSpec::Descriptor(FileDescriptor {
            source: source.into(),
            visibility: None,
            file_type: None,
            size,
            timestamp,
        })
    }

    #[test]
    fn rest_backend_rejects_what_it_cannot_submit() {
        let rest = ResourceManagerBackend::Rest;
        assert!(validate_for_backend(&SessionSettings::default(), rest).is_ok());

        let mut local = SessionSettings::default();
        local
            .localize_files
            .insert("data".into(), FileSpec::Path("/srv/data.csv".into()));
        assert!(validate_settings(&local).is_ok());
        assert!(validate_for_backend(&local, ResourceManagerBackend::Memory).is_ok());
        assert!(matches!(
            validate_for_backend(&local, rest),
            Err(ConfigError::Unsupported { ref setting, .. }) if setting == "localize_files.data"
        ));

        let mut no_size = SessionSettings::default();
        no_size.localize_files.insert(
            "env".into(),
            remote("hdfs:///envs/py.tar.gz", None, Some(1_700_000_000_000)),
        );
        assert!(matches!(
            validate_for_backend(&no_size, rest),
            Err(ConfigError::Unsupported { .. })
        ));

        let mut complete = SessionSettings::default();
        complete.localize_files.insert(
            "env".into(),
            remote("hdfs:///envs/py.tar.gz", Some(4096), Some(1_700_000_000_000)),
        );
        assert!(validate_for_backend(&complete, rest).is_ok());

        let keytab = SessionSettings {
            keytab: Some("/etc/hub.keytab".into()),
            ..SessionSettings::default()
        };
        assert!(matches!(
            validate_for_backend(&keytab, rest),
            Err(ConfigError::Unsupported { ref setting, backend: "rest", .. }) if setting == "keytab"
        ));
    }
}
