//! Daemon configuration: structs, parsing, and validation.
//!
//! - `common`: shared helpers and `ConfigError`
//! - `network`: per-network desired state

mod common;
mod network;

pub use common::ConfigError;
pub use network::{NetworkConfig, UidPolicyConfig};

use std::collections::BTreeMap;
use std::path::Path;

use domain::network::entity::{NetId, NetworkSpec};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_IP_BINARY, DEFAULT_SS_BINARY, MAX_NETWORKS};
use common::{check_limit, validation, warn_if_world_writable};

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentInfo,

    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

impl AgentConfig {
    /// Load config from a YAML file.
    ///
    /// On Unix, logs a warning if the config file is world-writable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        warn_if_world_writable(path, "config file");
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config after deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.ip_binary.is_empty() {
            return Err(validation("agent.ip_binary", "must not be empty"));
        }
        if self.agent.ss_binary.is_empty() {
            return Err(validation("agent.ss_binary", "must not be empty"));
        }

        check_limit("networks", self.networks.len(), MAX_NETWORKS)?;

        let mut ids: BTreeMap<NetId, usize> = BTreeMap::new();
        let mut owners: BTreeMap<&str, usize> = BTreeMap::new();
        let mut default = None;
        for (idx, network) in self.networks.iter().enumerate() {
            network.validate(idx)?;

            let net_id = network.resolved_id(idx)?;
            if let Some(first) = ids.insert(net_id, idx) {
                let message = if network.local {
                    format!("only one local network is allowed (see networks[{first}])")
                } else {
                    format!("net_id {net_id} is already used by networks[{first}]")
                };
                return Err(validation(format!("networks[{idx}].net_id"), message));
            }

            if network.default
                && let Some(first) = default.replace(idx)
            {
                return Err(validation(
                    format!("networks[{idx}].default"),
                    format!("networks[{first}] is already the default network"),
                ));
            }

            for (i, interface) in network.interfaces.iter().enumerate() {
                if let Some(first) = owners.insert(interface.as_str(), idx) {
                    return Err(validation(
                        format!("networks[{idx}].interfaces[{i}]"),
                        format!("'{interface}' already belongs to networks[{first}]"),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Desired state of every configured network.
    pub fn network_specs(&self) -> Result<Vec<NetworkSpec>, ConfigError> {
        self.networks
            .iter()
            .enumerate()
            .map(|(idx, network)| network.to_domain(idx))
            .collect()
    }
}

// ── Agent section ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentInfo {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    #[serde(default)]
    pub backend: Backend,

    /// Path to the iproute2 `ip` binary.
    #[serde(default = "default_ip_binary")]
    pub ip_binary: String,

    /// Path to the iproute2 `ss` binary.
    #[serde(default = "default_ss_binary")]
    pub ss_binary: String,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            backend: Backend::default(),
            ip_binary: default_ip_binary(),
            ss_binary: default_ss_binary(),
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_format() -> LogFormat {
    LogFormat::Json
}
fn default_ip_binary() -> String {
    DEFAULT_IP_BINARY.to_string()
}
fn default_ss_binary() -> String {
    DEFAULT_SS_BINARY.to_string()
}

// ── Backend ────────────────────────────────────────────────────────

/// Which kernel collaborators the daemon drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Program the kernel through `ip` and `ss`.
    #[default]
    Iproute2,
    /// Log every kernel call without touching the system.
    DryRun,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Iproute2 => "iproute2",
            Self::DryRun => "dry_run",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "iproute2" => Ok(Self::Iproute2),
            "dry_run" => Ok(Self::DryRun),
            _ => Err(ConfigError::InvalidValue {
                field: "agent.backend".to_string(),
                value: s.to_string(),
                expected: "iproute2, dry_run".to_string(),
            }),
        }
    }
}

// ── Log level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(format!(
                "invalid log level '{s}': expected error|warn|info|debug|trace"
            )),
        }
    }
}

// ── Log format ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            _ => Err(format!("invalid log format '{s}': expected json|text")),
        }
    }
}
