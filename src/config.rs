//! Configuration loading for parley.
//!
//! All settings live in `parley.toml`. A parsed [`ParleyConfig`] is immutable;
//! runtime "reload" builds a fresh snapshot and atomically swaps the `Arc`
//! inside [`ConfigHandle`], so readers holding the old snapshot are never
//! affected mid-operation.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub const DEFAULT_CONFIG_FILE: &str = "parley.toml";

/// Where a service gets its port from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// `port = { fixed = 8082 }`
    Fixed { fixed: u16 },
    /// `port = { range = [8030, 8035] }` — first free port wins.
    Range { range: (u16, u16) },
}

impl PortSpec {
    pub fn fixed(&self) -> Option<u16> {
        match self {
            PortSpec::Fixed { fixed } => Some(*fixed),
            PortSpec::Range { .. } => None,
        }
    }
}

/// One supervised service. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub port: PortSpec,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Env vars that must be present for an optional service to be considered
    /// configured. Ignored for required services.
    #[serde(default)]
    pub requires_env: Vec<String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_ms: u64,
}

impl ServiceSpec {
    /// True when every env var the service declares is set and non-empty.
    pub fn is_configured(&self) -> bool {
        self.requires_env
            .iter()
            .all(|var| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false))
    }
}

fn default_health_path() -> String {
    "/".to_string()
}
fn default_startup_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    500
}
fn default_max_restarts() -> u32 {
    2
}
fn default_restart_backoff() -> u64 {
    1000
}

/// The bridge's own listen settings (used when run under the supervisor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    #[serde(default = "default_bridge_health_path")]
    pub health_path: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_bridge_port(),
            health_path: default_bridge_health_path(),
        }
    }
}

fn default_bridge_port() -> u16 {
    8082
}
fn default_bridge_health_path() -> String {
    "/health".to_string()
}

/// Endpoint settings for the utterance-producing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Explicit base URL. When empty, the port is looked up in the service
    /// registry under `service`.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_generator_service")]
    pub service: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_generator_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service: default_generator_service(),
            chat_path: default_chat_path(),
            request_timeout_secs: default_generator_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_generator_service() -> String {
    "gateway".to_string()
}
fn default_chat_path() -> String {
    "/api/chat".to_string()
}
fn default_generator_timeout() -> u64 {
    60
}
fn default_probe_timeout() -> u64 {
    5
}

/// Endpoint settings for the service under training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub url: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_target_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_target_timeout() -> u64 {
    30
}

/// Training-loop defaults that are not part of the per-session request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Flush the exchange log every N appends; 0 flushes only at termination.
    #[serde(default)]
    pub flush_every: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Upstream connectivity probe interval for the bridge status snapshot.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            history_window: default_history_window(),
            failure_threshold: default_failure_threshold(),
            flush_every: 0,
            log_dir: default_log_dir(),
            monitor_interval_secs: default_monitor_interval(),
        }
    }
}

fn default_history_window() -> usize {
    6
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("training_logs")
}
fn default_monitor_interval() -> u64 {
    5
}

/// Full parsed configuration. Never mutated after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSpec>,
}

impl ParleyConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ParleyConfig = toml::from_str(text).context("Failed to parse parley.toml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Structural validation. Dependency cycles are detected later by the
    /// supervisor's graph build, before any process is spawned.
    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                bail!("Service with empty name");
            }
            if !seen.insert(service.name.as_str()) {
                bail!("Duplicate service name: {}", service.name);
            }
            if service.command.is_empty() {
                bail!("Service '{}' has an empty command", service.name);
            }
            if let PortSpec::Range { range: (start, end) } = service.port
                && start > end
            {
                bail!(
                    "Service '{}' has an inverted port range {}-{}",
                    service.name,
                    start,
                    end
                );
            }
            if service.startup_timeout_secs == 0 {
                bail!("Service '{}' has a zero startup timeout", service.name);
            }
            if service.poll_interval_ms == 0 {
                bail!("Service '{}' has a zero poll interval", service.name);
            }
        }
        for service in &self.services {
            for dep in &service.depends_on {
                if !seen.contains(dep.as_str()) {
                    bail!(
                        "Service '{}' depends on unknown service '{}'",
                        service.name,
                        dep
                    );
                }
            }
        }
        if self.target.url.is_empty() {
            bail!("target.url must be set");
        }
        Ok(())
    }
}

/// Shared handle to the current configuration snapshot.
///
/// Reload parses and validates a whole new `ParleyConfig` before swapping the
/// inner `Arc`; a failed reload leaves the previous snapshot in place.
pub struct ConfigHandle {
    inner: RwLock<Arc<ParleyConfig>>,
}

impl ConfigHandle {
    pub fn new(config: ParleyConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(ParleyConfig::load(path)?))
    }

    /// The current snapshot. Cheap: clones an `Arc`.
    pub fn current(&self) -> Arc<ParleyConfig> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Parse `path` into a fresh snapshot and swap it in.
    pub fn reload(&self, path: &Path) -> Result<Arc<ParleyConfig>> {
        let fresh = Arc::new(ParleyConfig::load(path)?);
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = fresh.clone();
        Ok(fresh)
    }
}
