//! Typed error hierarchy for parley.
//!
//! Two top-level enums cover the two subsystems:
//! - `SupervisorError` — port allocation, dependency graph, and process
//!   lifecycle failures
//! - `TrainingError` — control API and exchange-loop failures

use thiserror::Error;

/// Errors from the process supervisor subsystem.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No free port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Cycle detected in service dependencies. Involved services: {services:?}")]
    CyclicDependency { services: Vec<String> },

    #[error("Unknown dependency '{dependency}' for service '{service}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    #[error("Failed to spawn service '{service}': {source}")]
    SpawnFailed {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service '{service}' did not become healthy within {timeout_secs}s")]
    StartTimeout { service: String, timeout_secs: u64 },

    #[error("Service '{service}' exited during startup (exit code {exit_code:?})")]
    ExitedDuringStartup {
        service: String,
        exit_code: Option<i32>,
    },

    #[error("Required service '{service}' depends on '{dependency}', which was skipped")]
    RequiredDependsOnSkipped { service: String, dependency: String },

    #[error("Service '{service}' crashed and its restart budget is exhausted")]
    RestartBudgetExhausted { service: String },

    #[error("Failed to write service registry at {path}: {source}")]
    RegistryWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the training orchestrator and its control API.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("A training session is already running")]
    SessionConflict,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Upstream '{upstream}' is not reachable")]
    UpstreamUnavailable { upstream: String },

    #[error("{upstream} call failed: {message}")]
    UpstreamCallFailed { upstream: String, message: String },

    #[error("Exchange {seq} already recorded")]
    DuplicateExchange { seq: u64 },

    #[error("Exchange {seq} would leave a gap (next expected {expected})")]
    ExchangeGap { seq: u64, expected: u64 },

    #[error("Failed to flush exchange log to {path}: {source}")]
    FlushFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
