//! Process supervision: bring a set of services to a health-confirmed state
//! in dependency order, keep them alive, and tear them down cleanly.

pub mod graph;
pub mod health;
pub mod ports;
pub mod process;

use crate::config::{PortSpec, ServiceSpec};
use crate::errors::SupervisorError;
use crate::registry::{RegistryEntry, ServiceRegistry};
use graph::{ServiceGraph, ServiceIndex};
use health::HealthProbe;
use ports::find_free_port;
use process::{ProcessHandle, ProcessLauncher, ServiceStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Per-probe deadline during gating and liveness checks.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor-wide knobs that are not per-service.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How long to wait between SIGTERM and SIGKILL at shutdown.
    pub grace_period: Duration,
    /// Liveness poll interval for the monitor loop.
    pub monitor_interval: Duration,
    /// Directory holding `.parley/registry.json`.
    pub base_dir: PathBuf,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(5),
            base_dir: PathBuf::from("."),
        }
    }
}

/// Why a service was not started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Optional service missing its `requires_env` vars.
    Unconfigured,
    /// A (transitive) dependency was skipped or failed.
    Dependency(String),
    /// The service itself failed its startup gate (optional services only;
    /// for required services this aborts the bring-up instead).
    GateFailed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Unconfigured => write!(f, "not configured"),
            SkipReason::Dependency(dep) => write!(f, "dependency '{dep}' unavailable"),
            SkipReason::GateFailed => write!(f, "failed startup health check"),
        }
    }
}

/// Outcome of `start_all` when it does not abort.
#[derive(Debug, Default)]
pub struct StartupReport {
    pub started: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
}

/// What the monitor loop observed in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A dead service was respawned and passed its gate again.
    Restarted { service: String },
    /// A dead service exhausted its restart budget.
    Crashed { service: String, required: bool },
}

/// Operator-facing view of one service.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceReport {
    pub name: String,
    pub status: ServiceStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub restarts_used: u32,
}

pub struct ProcessSupervisor {
    graph: ServiceGraph,
    options: SupervisorOptions,
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthProbe>,
    handles: HashMap<ServiceIndex, ProcessHandle>,
    skipped: HashMap<ServiceIndex, SkipReason>,
    registry: ServiceRegistry,
    registry_path: PathBuf,
}

impl ProcessSupervisor {
    /// Build the dependency graph (rejecting cycles and unknown references
    /// before anything is spawned) and prepare an empty registry.
    pub fn new(
        services: Vec<ServiceSpec>,
        options: SupervisorOptions,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, SupervisorError> {
        let graph = ServiceGraph::build(services)?;
        let registry_path = ServiceRegistry::default_path(&options.base_dir);
        Ok(Self {
            graph,
            options,
            launcher,
            probe,
            handles: HashMap::new(),
            skipped: HashMap::new(),
            registry: ServiceRegistry::new(),
            registry_path,
        })
    }

    fn health_url(spec: &ServiceSpec, port: u16) -> String {
        format!("http://127.0.0.1:{}{}", port, spec.health_path)
    }

    fn save_registry(&self) -> Result<(), SupervisorError> {
        self.registry
            .save(&self.registry_path)
            .map_err(SupervisorError::Other)
    }

    /// Start every startable service in dependency order, gating each on its
    /// health check. Aborts (stopping whatever already started, in reverse
    /// order) when a required service cannot come up.
    pub async fn start_all(&mut self) -> Result<StartupReport, SupervisorError> {
        let mut report = StartupReport::default();
        let order: Vec<ServiceIndex> = self.graph.startup_order().to_vec();

        for index in order {
            let spec = self.graph.service(index).clone();

            // Cascade: anything downstream of a skipped or failed service
            // cannot be gated, so it must not be spawned.
            if let Some(dep) = self
                .graph
                .dependencies_of(index)
                .iter()
                .find(|dep| self.skipped.contains_key(*dep))
            {
                let dep_name = self.graph.service(*dep).name.clone();
                if spec.required {
                    tracing::error!(
                        service = %spec.name,
                        dependency = %dep_name,
                        "required service depends on a skipped service"
                    );
                    self.shutdown_all().await;
                    return Err(SupervisorError::RequiredDependsOnSkipped {
                        service: spec.name,
                        dependency: dep_name,
                    });
                }
                let reason = SkipReason::Dependency(dep_name);
                tracing::warn!(service = %spec.name, %reason, "skipping service");
                self.skipped.insert(index, reason.clone());
                report.skipped.push((spec.name, reason));
                continue;
            }

            if !spec.required && !spec.is_configured() {
                tracing::info!(service = %spec.name, "optional service not configured, skipping");
                self.skipped.insert(index, SkipReason::Unconfigured);
                report
                    .skipped
                    .push((spec.name, SkipReason::Unconfigured));
                continue;
            }

            // Port exhaustion is fatal at startup regardless of the
            // required flag: it means the machine is misconfigured.
            let port = match spec.port {
                PortSpec::Fixed { fixed } => fixed,
                PortSpec::Range { range: (start, end) } => match find_free_port(start, end) {
                    Ok(port) => port,
                    Err(err) => {
                        self.shutdown_all().await;
                        return Err(err);
                    }
                },
            };

            self.registry.insert(
                &spec.name,
                RegistryEntry {
                    port,
                    health_path: spec.health_path.clone(),
                    required: spec.required,
                },
            );
            self.save_registry()?;

            tracing::info!(service = %spec.name, port, "starting service");
            let process = match self.launcher.launch(&spec, port).await {
                Ok(process) => process,
                Err(err) => {
                    if spec.required {
                        self.registry.remove(&spec.name);
                        let _ = self.save_registry();
                        self.shutdown_all().await;
                        return Err(err);
                    }
                    tracing::warn!(service = %spec.name, error = %err, "optional service failed to spawn");
                    self.registry.remove(&spec.name);
                    self.save_registry()?;
                    self.skipped.insert(index, SkipReason::GateFailed);
                    report.skipped.push((spec.name, SkipReason::GateFailed));
                    continue;
                }
            };

            let mut handle = ProcessHandle::new(&spec.name, port, process);

            match self.gate(&spec, &mut handle).await {
                Ok(()) => {
                    handle.transition(ServiceStatus::Healthy);
                    tracing::info!(service = %spec.name, port, pid = ?handle.pid(), "service healthy");
                    self.handles.insert(index, handle);
                    report.started.push(spec.name);
                }
                Err(err) => {
                    handle.stop(self.options.grace_period).await;
                    self.registry.remove(&spec.name);
                    self.save_registry()?;
                    if spec.required {
                        tracing::error!(service = %spec.name, error = %err, "required service failed to start");
                        self.shutdown_all().await;
                        return Err(err);
                    }
                    tracing::warn!(service = %spec.name, error = %err, "optional service failed to start");
                    self.skipped.insert(index, SkipReason::GateFailed);
                    report.skipped.push((spec.name, SkipReason::GateFailed));
                }
            }
        }

        Ok(report)
    }

    /// Poll the service's health endpoint until Healthy or the startup
    /// timeout elapses. The per-attempt probe is single-shot; the retry
    /// budget lives here, off the hot path, bounded by the overall timeout.
    async fn gate(
        &self,
        spec: &ServiceSpec,
        handle: &mut ProcessHandle,
    ) -> Result<(), SupervisorError> {
        let url = Self::health_url(spec, handle.port);
        let poll_interval = Duration::from_millis(spec.poll_interval_ms);
        let deadline = Instant::now() + Duration::from_secs(spec.startup_timeout_secs);

        loop {
            if !handle.is_alive() {
                return Err(SupervisorError::ExitedDuringStartup {
                    service: spec.name.clone(),
                    exit_code: handle.exit_code(),
                });
            }

            if self.probe.check(&url, PROBE_TIMEOUT).await.is_healthy() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(SupervisorError::StartTimeout {
                    service: spec.name.clone(),
                    timeout_secs: spec.startup_timeout_secs,
                });
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// One pass of the monitor loop: OS-level liveness only. Dead services
    /// are respawned while their restart budget lasts, then marked Crashed.
    pub async fn monitor_once(&mut self) -> Result<Vec<MonitorEvent>, SupervisorError> {
        let mut events = Vec::new();
        let indices: Vec<ServiceIndex> = self.handles.keys().copied().collect();

        for index in indices {
            let spec = self.graph.service(index).clone();
            let Some(handle) = self.handles.get_mut(&index) else {
                continue;
            };
            if handle.status().is_terminal() || handle.is_alive() {
                continue;
            }

            let exit_code = handle.exit_code();
            tracing::warn!(service = %spec.name, ?exit_code, "service process died");

            if handle.restarts_used < spec.max_restarts {
                handle.transition(ServiceStatus::Crashed);
                tokio::time::sleep(Duration::from_millis(spec.restart_backoff_ms)).await;

                let process = self.launcher.launch(&spec, handle.port).await?;
                handle.respawned(process);

                let Some(mut handle) = self.handles.remove(&index) else {
                    continue;
                };
                let gated = self.gate(&spec, &mut handle).await;
                match gated {
                    Ok(()) => {
                        handle.transition(ServiceStatus::Healthy);
                        tracing::info!(service = %spec.name, "service restarted");
                        self.handles.insert(index, handle);
                        events.push(MonitorEvent::Restarted {
                            service: spec.name.clone(),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(service = %spec.name, error = %err, "restart failed its health gate");
                        // Kill the failed attempt but keep it non-terminal:
                        // the next pass spends another restart or exhausts
                        // the budget.
                        handle.kill_now().await;
                        self.handles.insert(index, handle);
                    }
                }
            } else {
                handle.transition(ServiceStatus::Crashed);
                self.registry.remove(&spec.name);
                self.save_registry()?;
                tracing::error!(
                    service = %spec.name,
                    required = spec.required,
                    "service crashed, restart budget exhausted"
                );
                events.push(MonitorEvent::Crashed {
                    service: spec.name.clone(),
                    required: spec.required,
                });
            }
        }

        Ok(events)
    }

    /// Terminate everything in reverse dependency order: dependents first so
    /// they don't observe their dependencies vanishing mid-flight.
    pub async fn shutdown_all(&mut self) {
        for index in self.graph.shutdown_order() {
            if let Some(mut handle) = self.handles.remove(&index) {
                tracing::info!(service = %handle.name, "stopping service");
                handle.stop(self.options.grace_period).await;
                self.registry.remove(&handle.name);
                if let Err(err) = self.save_registry() {
                    tracing::warn!(error = %err, "failed to update registry during shutdown");
                }
            }
        }
    }

    /// Snapshot of every known service for the operator-facing status view.
    pub fn reports(&self) -> Vec<ServiceReport> {
        let mut out = Vec::new();
        for &index in self.graph.startup_order() {
            let name = self.graph.service(index).name.clone();
            if let Some(handle) = self.handles.get(&index) {
                out.push(ServiceReport {
                    name,
                    status: handle.status(),
                    port: Some(handle.port),
                    pid: handle.pid(),
                    restarts_used: handle.restarts_used,
                });
            } else if self.skipped.contains_key(&index) {
                out.push(ServiceReport {
                    name,
                    status: ServiceStatus::Skipped,
                    port: None,
                    pid: None,
                    restarts_used: 0,
                });
            }
        }
        out
    }

    /// True when any required service has crashed unrecoverably.
    pub fn has_fatal_crash(&self) -> bool {
        self.handles.iter().any(|(index, handle)| {
            handle.status() == ServiceStatus::Crashed && self.graph.service(*index).required
        })
    }

    pub fn monitor_interval(&self) -> Duration {
        self.options.monitor_interval
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }
}
