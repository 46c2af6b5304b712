use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::{StopPolicy, DEFAULT_GRACE};

/// Agent identity and where to dial out to (`agent.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    pub agent_id: String,
    pub command_server_addr: String,
}

/// Launch recipe keyed by name (`server-templates.yaml`). Command, args,
/// cwd and env entries may reference `{params}`; they are rendered when an
/// instance is resolved.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Template {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub stop: StopSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateCatalog {
    #[serde(default)]
    pub templates: HashMap<String, Template>,
}

/// YAML-facing stop block. All fields optional; defaults resolve to
/// SIGTERM with a 10s grace.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopSpec {
    /// "stdin" or "signal".
    #[serde(default, rename = "type")]
    pub stop_type: String,
    /// Line written for stdin stop (e.g. "stop\n").
    #[serde(default)]
    pub command: String,
    /// Signal name for signal stop (e.g. "SIGTERM" or "TERM").
    #[serde(default)]
    pub signal: String,
    /// Grace before SIGKILL, e.g. "15s".
    #[serde(default)]
    pub grace_period: String,
}

/// One named instance: a template reference plus its parameter map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub template: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StopConfigError {
    #[error("invalid stop.type {0:?} (expected stdin|signal)")]
    InvalidType(String),
    #[error("invalid stop.signal {0:?} (try TERM, INT, KILL, HUP, QUIT)")]
    InvalidSignal(String),
    #[error("invalid stop.grace_period {0:?}")]
    InvalidGracePeriod(String),
}

/// Resolve a YAML stop block to a concrete policy.
pub fn convert_stop(spec: &StopSpec) -> Result<StopPolicy, StopConfigError> {
    let grace = match spec.grace_period.trim() {
        "" => DEFAULT_GRACE,
        raw => parse_duration(raw)
            .ok_or_else(|| StopConfigError::InvalidGracePeriod(spec.grace_period.clone()))?,
    };

    match spec.stop_type.trim().to_ascii_lowercase().as_str() {
        "" | "signal" => {
            let signal = match spec.signal.trim() {
                "" => libc::SIGTERM,
                raw => parse_signal(raw)
                    .ok_or_else(|| StopConfigError::InvalidSignal(spec.signal.clone()))?,
            };
            Ok(StopPolicy::Signal { signal, grace })
        }
        "stdin" => {
            let line = if spec.command.trim().is_empty() {
                "stop\n".to_string()
            } else {
                spec.command.clone()
            };
            Ok(StopPolicy::Stdin { line, grace })
        }
        _ => Err(StopConfigError::InvalidType(spec.stop_type.clone())),
    }
}

fn parse_signal(raw: &str) -> Option<i32> {
    let mut upper = raw.trim().to_ascii_uppercase();
    if !upper.starts_with("SIG") {
        upper = format!("SIG{upper}");
    }
    match upper.as_str() {
        "SIGTERM" => Some(libc::SIGTERM),
        "SIGINT" => Some(libc::SIGINT),
        "SIGKILL" => Some(libc::SIGKILL),
        "SIGHUP" => Some(libc::SIGHUP),
        "SIGQUIT" => Some(libc::SIGQUIT),
        _ => None,
    }
}

/// Parse durations like "500ms", "10s", "2m", "1h30m". A bare number has
/// no unit and is rejected.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let unit_secs = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += Duration::try_from_secs_f64(value * unit_secs).ok()?;
    }
    Some(total)
}

pub fn load_agent_settings(path: &Path) -> anyhow::Result<AgentSettings> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read agent config {}", path.display()))?;
    let settings: AgentSettings = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse agent config {}", path.display()))?;

    if settings.agent_id.trim().is_empty() {
        anyhow::bail!("agent_id is required");
    }
    if settings.command_server_addr.trim().is_empty() {
        anyhow::bail!("command_server_addr is required");
    }
    Ok(settings)
}

pub fn load_templates(path: &Path) -> anyhow::Result<HashMap<String, Template>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read templates file {}", path.display()))?;
    let catalog: TemplateCatalog = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse templates yaml {}", path.display()))?;

    if catalog.templates.is_empty() {
        anyhow::bail!("templates config contains no templates");
    }
    for (name, template) in &catalog.templates {
        if name.trim().is_empty() {
            anyhow::bail!("template name cannot be empty");
        }
        if template.command.trim().is_empty() {
            anyhow::bail!("template {name:?} missing command");
        }
        convert_stop(&template.stop)
            .with_context(|| format!("template {name:?} stop config"))?;
    }
    Ok(catalog.templates)
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

pub fn agent_config_path() -> PathBuf {
    env_path("WARDEN_AGENT_CONFIG", "configs/agent.yaml")
}

pub fn templates_path() -> PathBuf {
    env_path("WARDEN_TEMPLATES_CONFIG", "configs/server-templates.yaml")
}

pub fn instances_path() -> PathBuf {
    env_path("WARDEN_INSTANCES_PATH", "configs/instances.yaml")
}

pub fn instances_dir() -> PathBuf {
    env_path("WARDEN_INSTANCES_DIR", "data/instances")
}

pub fn log_dir() -> PathBuf {
    env_path("WARDEN_LOG_DIR", "logs")
}
