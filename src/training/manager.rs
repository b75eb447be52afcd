//! Session ownership and control.
//!
//! The manager is what the control handlers talk to. It enforces the
//! one-active-session rule, spawns the loop worker, and exposes reads that
//! never touch the worker's I/O path: `status` borrows the latest watch
//! snapshot, `stop` flips a flag and returns.

use crate::errors::TrainingError;
use crate::training::log::{Exchange, ExchangeLog};
use crate::training::session::{SessionParams, SessionSnapshot, TrainingSession};
use crate::training::upstream::{Generator, Target};
use crate::training::worker::{self, LoopSettings, WorkerContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock, watch};
use uuid::Uuid;

/// Handle to the current (or most recent) session's worker.
struct SessionHandle {
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    stop_tx: watch::Sender<bool>,
    log: Arc<RwLock<ExchangeLog>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// Result of a `stop` request. Stopping a non-running session is an
/// idempotent success, flagged so callers can report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub was_running: bool,
    pub exchanges_completed: u64,
}

pub struct SessionManager {
    generator: Arc<dyn Generator>,
    target: Arc<dyn Target>,
    settings: LoopSettings,
    current: Mutex<Option<SessionHandle>>,
    /// Written by the connectivity monitor, read by `start`.
    generator_reachable: AtomicBool,
    target_reachable: AtomicBool,
}

impl SessionManager {
    pub fn new(
        generator: Arc<dyn Generator>,
        target: Arc<dyn Target>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            generator,
            target,
            settings,
            current: Mutex::new(None),
            // Optimistic until the first monitor tick reports otherwise.
            generator_reachable: AtomicBool::new(true),
            target_reachable: AtomicBool::new(true),
        }
    }

    /// Called by the connectivity monitor; never from a request handler.
    pub fn set_reachability(&self, generator: bool, target: bool) {
        self.generator_reachable.store(generator, Ordering::Relaxed);
        self.target_reachable.store(target, Ordering::Relaxed);
    }

    /// One bounded probe per upstream, feeding the in-memory snapshot the
    /// status and start paths read. Runs in the monitor task only.
    pub async fn probe_upstreams(&self) {
        let generator = self.generator.is_reachable().await;
        let target = self.target.is_reachable().await;
        self.set_reachability(generator, target);
    }

    pub fn reachability(&self) -> (bool, bool) {
        (
            self.generator_reachable.load(Ordering::Relaxed),
            self.target_reachable.load(Ordering::Relaxed),
        )
    }

    /// Start a new session. Rejected while one is Running or Stopping, on
    /// invalid parameters, or while an upstream is known to be down. All
    /// checks happen before any state is created.
    pub async fn start(&self, params: SessionParams) -> Result<Uuid, TrainingError> {
        params.validate()?;

        if !self.generator_reachable.load(Ordering::Relaxed) {
            return Err(TrainingError::UpstreamUnavailable {
                upstream: "generator".to_string(),
            });
        }
        if !self.target_reachable.load(Ordering::Relaxed) {
            return Err(TrainingError::UpstreamUnavailable {
                upstream: "target".to_string(),
            });
        }

        let mut current = self.current.lock().await;
        if let Some(handle) = current.as_ref()
            && handle.snapshot_rx.borrow().state.is_active()
        {
            return Err(TrainingError::SessionConflict);
        }

        let session = TrainingSession::new(params);
        let session_id = session.id;

        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let (stop_tx, stop_rx) = watch::channel(false);
        let log = Arc::new(RwLock::new(ExchangeLog::new()));

        let ctx = WorkerContext {
            generator: self.generator.clone(),
            target: self.target.clone(),
            log: log.clone(),
            snapshot_tx,
            stop_rx,
            settings: self.settings.clone(),
        };
        let task = tokio::spawn(worker::run_session(session, ctx));

        *current = Some(SessionHandle {
            snapshot_rx,
            stop_tx,
            log,
            task: Some(task),
        });
        tracing::info!(session = %session_id, "training session started");
        Ok(session_id)
    }

    /// Flip the cooperative stop flag. Does not wait for the loop to exit;
    /// see [`SessionManager::wait_until_stopped`] for that.
    pub async fn stop(&self) -> StopOutcome {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(handle) => {
                let snapshot = handle.snapshot_rx.borrow().clone();
                if snapshot.state.is_active() {
                    handle.stop_tx.send_replace(true);
                    tracing::info!("training stop requested");
                    StopOutcome {
                        was_running: true,
                        exchanges_completed: snapshot.exchanges_completed,
                    }
                } else {
                    StopOutcome {
                        was_running: false,
                        exchanges_completed: snapshot.exchanges_completed,
                    }
                }
            }
            None => StopOutcome {
                was_running: false,
                exchanges_completed: 0,
            },
        }
    }

    /// Constant-time snapshot read; no I/O, no waiting on the worker.
    pub async fn status(&self) -> SessionSnapshot {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(handle) => handle.snapshot_rx.borrow().clone(),
            None => SessionSnapshot::idle(),
        }
    }

    /// The most recent `limit` exchanges plus the total count.
    pub async fn read_log(&self, limit: usize) -> (u64, Vec<Exchange>) {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(handle) => {
                let log = handle.log.read().await;
                (log.len() as u64, log.read_last(limit).to_vec())
            }
            None => (0, Vec::new()),
        }
    }

    /// Await the worker's exit. Distinct from `stop`: stop only requests.
    pub async fn wait_until_stopped(&self) {
        let task = {
            let mut current = self.current.lock().await;
            current.as_mut().and_then(|handle| handle.task.take())
        };
        if let Some(task) = task
            && let Err(err) = task.await
        {
            tracing::error!(error = %err, "training worker task panicked");
        }
    }
}
