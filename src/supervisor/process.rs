//! Process lifecycle: the spawn seam, the handle the supervisor owns, and
//! the status machine it moves through.
//!
//! `ProcessLauncher`/`ServiceProcess` abstract the OS so supervisor logic is
//! testable with fake processes; `OsLauncher` is the real implementation on
//! top of `tokio::process`.

use crate::config::ServiceSpec;
use crate::errors::SupervisorError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Lifecycle status of one supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Spawned, not yet past its health gate.
    Starting,
    Healthy,
    /// Alive but last known to be failing its health check.
    Unhealthy,
    /// Exited with no restart budget left.
    Crashed,
    Stopped,
    /// Never started: unconfigured optional service or cascade from one.
    Skipped,
}

impl ServiceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Crashed | ServiceStatus::Stopped | ServiceStatus::Skipped
        )
    }

    /// Allowed edges of the lifecycle machine.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, next),
            (Starting, Healthy)
                | (Starting, Crashed)
                | (Starting, Stopped)
                | (Healthy, Unhealthy)
                | (Healthy, Crashed)
                | (Healthy, Stopped)
                | (Unhealthy, Healthy)
                | (Unhealthy, Crashed)
                | (Unhealthy, Stopped)
                | (Crashed, Starting)
        )
    }
}

/// A running (or exited) OS process as the supervisor sees it.
#[async_trait]
pub trait ServiceProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness poll. `Ok(Some(code))` once the process has
    /// exited.
    fn poll_exit(&mut self) -> std::io::Result<Option<i32>>;

    /// Ask the process to shut down (SIGTERM on unix). Does not wait.
    fn terminate(&mut self);

    /// Wait up to `grace` for exit; true if it exited in time.
    async fn wait_exit(&mut self, grace: Duration) -> bool;

    /// Force-kill and reap.
    async fn kill(&mut self);
}

/// Real process backed by `tokio::process::Child`.
pub struct OsProcess {
    child: Child,
}

#[async_trait]
impl ServiceProcess for OsProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn poll_exit(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: plain signal send to a pid we own.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            return;
        }
        // Non-unix (or already-reaped child): fall through to a hard kill
        // signal without waiting.
        let _ = self.child.start_kill();
    }

    async fn wait_exit(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.child.wait()).await.is_ok()
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

/// Spawn seam. The supervisor only ever goes through this trait.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(
        &self,
        spec: &ServiceSpec,
        port: u16,
    ) -> Result<Box<dyn ServiceProcess>, SupervisorError>;
}

/// Launches real OS processes with the allocated port exported as `PORT`.
pub struct OsLauncher;

#[async_trait]
impl ProcessLauncher for OsLauncher {
    async fn launch(
        &self,
        spec: &ServiceSpec,
        port: u16,
    ) -> Result<Box<dyn ServiceProcess>, SupervisorError> {
        let mut cmd = Command::new(&spec.command[0]);
        cmd.args(&spec.command[1..])
            .env("PORT", port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            service: spec.name.clone(),
            source,
        })?;

        Ok(Box::new(OsProcess { child }))
    }
}

/// One supervised process. Created on spawn, destroyed on confirmed stop.
/// Exclusively owned and mutated by the supervisor.
pub struct ProcessHandle {
    pub name: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub restarts_used: u32,
    status: ServiceStatus,
    process: Box<dyn ServiceProcess>,
}

impl ProcessHandle {
    pub fn new(name: &str, port: u16, process: Box<dyn ServiceProcess>) -> Self {
        Self {
            name: name.to_string(),
            port,
            started_at: Utc::now(),
            restarts_used: 0,
            status: ServiceStatus::Starting,
            process,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Apply a lifecycle transition; invalid edges are refused.
    pub fn transition(&mut self, next: ServiceStatus) -> bool {
        if self.status.can_transition_to(next) {
            tracing::debug!(service = %self.name, from = ?self.status, to = ?next, "status transition");
            self.status = next;
            true
        } else {
            tracing::warn!(
                service = %self.name,
                from = ?self.status,
                to = ?next,
                "refused invalid status transition"
            );
            false
        }
    }

    /// Replace the dead process after a restart and reset the clock.
    pub fn respawned(&mut self, process: Box<dyn ServiceProcess>) {
        self.process = process;
        self.started_at = Utc::now();
        self.restarts_used += 1;
        self.status = ServiceStatus::Starting;
    }

    /// OS-level liveness only, no health check.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.process.poll_exit(), Ok(None))
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        self.process.poll_exit().ok().flatten()
    }

    /// Graceful-terminate, bounded wait, then force-kill.
    pub async fn stop(&mut self, grace: Duration) {
        if !self.is_alive() {
            if !self.status.is_terminal() {
                self.transition(ServiceStatus::Stopped);
            }
            return;
        }
        self.process.terminate();
        if !self.process.wait_exit(grace).await {
            tracing::warn!(service = %self.name, "grace period expired, force killing");
            self.process.kill().await;
        }
        self.transition(ServiceStatus::Stopped);
    }

    /// Force-kill without marking the handle Stopped. Used when a restart
    /// attempt fails its gate and the monitor's budget bookkeeping must
    /// keep running.
    pub async fn kill_now(&mut self) {
        self.process.kill().await;
    }
}
