//! The exchange loop worker.
//!
//! One background task per session, and the only writer of that session's
//! state. Control traffic reaches it through two watch channels: it reads a
//! stop flag and publishes [`SessionSnapshot`]s, so `status` and `stop`
//! handlers never touch the loop's I/O path.

use crate::training::log::{Exchange, ExchangeLog, SessionHeader};
use crate::training::session::{SessionSnapshot, SessionState, TrainingSession};
use crate::training::upstream::{Generator, HistoryTurn, Target};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};

/// Loop behavior that is configuration, not per-session request.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// How many prior exchanges to send to the generator as context.
    pub history_window: usize,
    /// Consecutive upstream failures before the session fails.
    pub failure_threshold: u32,
    /// Flush the log every N exchanges; 0 means only at termination.
    pub flush_every: u64,
    pub log_dir: PathBuf,
}

/// Everything the worker task needs, bundled for the spawn call.
pub struct WorkerContext {
    pub generator: Arc<dyn Generator>,
    pub target: Arc<dyn Target>,
    pub log: Arc<RwLock<ExchangeLog>>,
    pub snapshot_tx: watch::Sender<SessionSnapshot>,
    pub stop_rx: watch::Receiver<bool>,
    pub settings: LoopSettings,
}

/// Sleep for `delay` unless the stop flag trips first. Returns false when
/// the loop should exit instead of continuing.
async fn sleep_or_stop(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *stop_rx.borrow() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = stop_rx.changed() => match changed {
            Ok(()) => !*stop_rx.borrow(),
            // Control side is gone; treat as stop.
            Err(_) => false,
        },
    }
}

/// One retry on a transient generator failure, then give up for this
/// iteration. The failure counter, not endless retries, decides the
/// session's fate.
async fn generator_step(
    generator: &dyn Generator,
    prompt: &str,
    history: &[HistoryTurn],
) -> Option<String> {
    match generator.next_utterance(prompt, history).await {
        Ok(utterance) => Some(utterance),
        Err(first) => {
            tracing::warn!(error = %first, "generator call failed, retrying once");
            match generator.next_utterance(prompt, history).await {
                Ok(utterance) => Some(utterance),
                Err(second) => {
                    tracing::warn!(error = %second, "generator retry failed");
                    None
                }
            }
        }
    }
}

/// Run one session to a terminal state.
pub async fn run_session(mut session: TrainingSession, mut ctx: WorkerContext) {
    let delay = Duration::from_secs_f64(session.params.delay);
    let max_exchanges = session.params.max_exchanges;
    let threshold = ctx.settings.failure_threshold;

    let mut history: Vec<HistoryTurn> = Vec::new();
    let mut last_reply: Option<String> = None;
    let mut prev_topic_index: Option<usize> = None;

    tracing::info!(
        session = %session.id,
        max_exchanges,
        delay_secs = session.params.delay,
        topic_switch_interval = session.params.topic_switch_interval,
        "training loop started"
    );
    ctx.snapshot_tx.send_replace(session.snapshot());

    loop {
        if *ctx.stop_rx.borrow() {
            session.state = SessionState::Stopping;
            ctx.snapshot_tx.send_replace(session.snapshot());
            break;
        }

        let next_seq = session.exchanges_completed + 1;
        let topic_index = ((next_seq - 1) / session.params.topic_switch_interval) as usize
            % session.params.topics.len();

        // Steer the conversation with the topic whenever it rotates (and on
        // the very first exchange); otherwise continue from the target's
        // last reply.
        let prompt = match (&last_reply, prev_topic_index) {
            (Some(reply), Some(prev)) if prev == topic_index => reply.clone(),
            _ => {
                let topic = session.params.topic_for(next_seq).to_string();
                tracing::info!(session = %session.id, %topic, "rotating to topic");
                topic
            }
        };
        prev_topic_index = Some(topic_index);

        let step =
            match generator_step(ctx.generator.as_ref(), &prompt, &history).await {
                Some(utterance) => match ctx.target.deliver(&utterance).await {
                    Ok(reply) => Some((utterance, reply)),
                    Err(err) => {
                        tracing::warn!(session = %session.id, error = %err, "target call failed");
                        None
                    }
                },
                None => None,
            };

        match step {
            Some((utterance, reply)) => {
                let exchange = Exchange {
                    seq: next_seq,
                    timestamp: Utc::now(),
                    generator_message: utterance.clone(),
                    target_response: reply.response.clone(),
                    metadata: reply.metadata,
                };
                if let Err(err) = ctx.log.write().await.append(exchange) {
                    tracing::error!(session = %session.id, error = %err, "exchange append rejected");
                }
                session.exchanges_completed = next_seq;
                session.consecutive_failures = 0;

                history.push(HistoryTurn {
                    user: utterance,
                    assistant: reply.response.clone(),
                });
                if history.len() > ctx.settings.history_window {
                    let excess = history.len() - ctx.settings.history_window;
                    history.drain(..excess);
                }
                last_reply = Some(reply.response);

                if ctx.settings.flush_every > 0 && next_seq % ctx.settings.flush_every == 0 {
                    flush_log(&session, &ctx).await;
                }
            }
            None => {
                session.consecutive_failures += 1;
                tracing::warn!(
                    session = %session.id,
                    consecutive_failures = session.consecutive_failures,
                    threshold,
                    "iteration failed, no exchange recorded"
                );
                if session.consecutive_failures >= threshold {
                    session.state = SessionState::Failed;
                    session.failure_reason = Some(format!(
                        "{} consecutive upstream failures",
                        session.consecutive_failures
                    ));
                    ctx.snapshot_tx.send_replace(session.snapshot());
                    break;
                }
            }
        }

        ctx.snapshot_tx.send_replace(session.snapshot());

        if session.exchanges_completed >= max_exchanges {
            session.state = SessionState::Stopped;
            break;
        }

        if !sleep_or_stop(&mut ctx.stop_rx, delay).await {
            session.state = SessionState::Stopping;
            ctx.snapshot_tx.send_replace(session.snapshot());
            break;
        }
    }

    if !session.state.is_terminal() {
        session.state = SessionState::Stopped;
    }

    flush_log(&session, &ctx).await;
    ctx.snapshot_tx.send_replace(session.snapshot());
    tracing::info!(
        session = %session.id,
        state = ?session.state,
        exchanges_completed = session.exchanges_completed,
        "training loop finished"
    );
}

async fn flush_log(session: &TrainingSession, ctx: &WorkerContext) {
    let header = SessionHeader {
        session_id: session.id,
        started_at: session.started_at,
        exchanges_completed: session.exchanges_completed,
        final_state: session.state,
        failure_reason: session.failure_reason.clone(),
    };
    match ctx.log.read().await.flush(&ctx.settings.log_dir, &header) {
        Ok(Some(path)) => {
            tracing::debug!(session = %session.id, path = %path.display(), "exchange log flushed");
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(session = %session.id, error = %err, "failed to flush exchange log");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::stubs::{FlakyGenerator, PermitGenerator, StubTarget};
    use super::*;
    use crate::training::session::SessionParams;
    use std::sync::atomic::Ordering;

    fn params(max_exchanges: u64, delay: f64) -> SessionParams {
        SessionParams {
            max_exchanges,
            delay,
            topic_switch_interval: 2,
            topics: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        }
    }

    fn settings(dir: &std::path::Path) -> LoopSettings {
        LoopSettings {
            history_window: 4,
            failure_threshold: 3,
            flush_every: 0,
            log_dir: dir.to_path_buf(),
        }
    }

    struct Harness {
        snapshot_rx: watch::Receiver<SessionSnapshot>,
        stop_tx: watch::Sender<bool>,
        log: Arc<RwLock<ExchangeLog>>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_session(
        params: SessionParams,
        settings: LoopSettings,
        generator: Arc<dyn Generator>,
        target: Arc<dyn Target>,
    ) -> Harness {
        let session = TrainingSession::new(params);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::idle());
        let (stop_tx, stop_rx) = watch::channel(false);
        let log = Arc::new(RwLock::new(ExchangeLog::new()));

        let ctx = WorkerContext {
            generator,
            target,
            log: log.clone(),
            snapshot_tx,
            stop_rx,
            settings,
        };
        let task = tokio::spawn(run_session(session, ctx));
        Harness {
            snapshot_rx,
            stop_tx,
            log,
            task,
        }
    }

    async fn wait_terminal(harness: &mut Harness) -> SessionSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if harness.snapshot_rx.borrow().state.is_terminal() {
                    return harness.snapshot_rx.borrow().clone();
                }
                harness.snapshot_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("session did not reach a terminal state in time")
    }

    #[tokio::test]
    async fn completes_exactly_max_exchanges() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, permits) = PermitGenerator::new();
        for i in 0..10 {
            permits.send(format!("utterance {i}")).unwrap();
        }
        let generator = Arc::new(generator);

        let mut harness = spawn_session(
            params(5, 0.0),
            settings(dir.path()),
            generator.clone(),
            Arc::new(StubTarget::default()),
        );

        let snapshot = wait_terminal(&mut harness).await;
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert_eq!(snapshot.exchanges_completed, 5);
        // Exactly five: surplus permits were never consumed.
        assert_eq!(harness.log.read().await.len(), 5);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn topic_rotation_follows_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, permits) = PermitGenerator::new();
        for i in 0..5 {
            permits.send(format!("u{i}")).unwrap();
        }
        let generator = Arc::new(generator);

        let mut harness = spawn_session(
            params(5, 0.0),
            settings(dir.path()),
            generator.clone(),
            Arc::new(StubTarget::default()),
        );
        wait_terminal(&mut harness).await;

        // Interval 2 over [a,b,c]: the generator is prompted with the topic
        // on rotation (exchanges 1, 3, 5) and with the target's last reply
        // in between.
        let prompts = generator.prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 5);
        assert_eq!(prompts[0], "a");
        assert_eq!(prompts[1], "echo: u0");
        assert_eq!(prompts[2], "b");
        assert_eq!(prompts[3], "echo: u2");
        assert_eq!(prompts[4], "c");
    }

    #[tokio::test]
    async fn stop_freezes_counter_after_observed_exchanges() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, permits) = PermitGenerator::new();
        permits.send("one".to_string()).unwrap();
        permits.send("two".to_string()).unwrap();
        let generator = Arc::new(generator);

        let mut harness = spawn_session(
            params(100, 0.0),
            settings(dir.path()),
            generator,
            Arc::new(StubTarget::default()),
        );

        // Wait for exactly two completed exchanges; the worker then blocks
        // on the third permit.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if harness.snapshot_rx.borrow().exchanges_completed >= 2 {
                    break;
                }
                harness.snapshot_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        // Flip the stop flag, then fail the pending generator call by
        // closing the permit channel.
        harness.stop_tx.send_replace(true);
        drop(permits);

        let snapshot = wait_terminal(&mut harness).await;
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert_eq!(snapshot.exchanges_completed, 2);
        assert_eq!(harness.log.read().await.len(), 2);
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_delay() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, permits) = PermitGenerator::new();
        permits.send("only".to_string()).unwrap();

        let mut harness = spawn_session(
            // 30s delay: finishing promptly proves the sleep is interruptible.
            params(100, 30.0),
            settings(dir.path()),
            Arc::new(generator),
            Arc::new(StubTarget::default()),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if harness.snapshot_rx.borrow().exchanges_completed >= 1 {
                    break;
                }
                harness.snapshot_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let stopped_at = std::time::Instant::now();
        harness.stop_tx.send_replace(true);
        let snapshot = wait_terminal(&mut harness).await;

        assert_eq!(snapshot.state, SessionState::Stopped);
        assert_eq!(snapshot.exchanges_completed, 1);
        assert!(
            stopped_at.elapsed() < Duration::from_secs(5),
            "stop had to wait out the delay"
        );
    }

    #[tokio::test]
    async fn consecutive_failures_fail_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, permits) = PermitGenerator::new();
        for i in 0..10 {
            permits.send(format!("u{i}")).unwrap();
        }
        let target = Arc::new(StubTarget {
            fail_always: true,
            ..Default::default()
        });

        let mut harness = spawn_session(
            params(100, 0.0),
            settings(dir.path()),
            Arc::new(generator),
            target.clone(),
        );

        let snapshot = wait_terminal(&mut harness).await;
        assert_eq!(snapshot.state, SessionState::Failed);
        assert_eq!(snapshot.exchanges_completed, 0);
        assert!(snapshot.failure_reason.unwrap().contains("3 consecutive"));
        // Failed iterations recorded nothing.
        assert!(harness.log.read().await.is_empty());
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn one_transient_generator_failure_is_retried_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(FlakyGenerator {
            fail_first: 1,
            calls: std::sync::atomic::AtomicU32::new(0),
        });

        let mut harness = spawn_session(
            params(1, 0.0),
            settings(dir.path()),
            generator.clone(),
            Arc::new(StubTarget::default()),
        );

        let snapshot = wait_terminal(&mut harness).await;
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert_eq!(snapshot.exchanges_completed, 1);
        assert!(snapshot.failure_reason.is_none());
        // First call failed, the in-iteration retry succeeded.
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn snapshot_reads_stay_instant_while_target_is_slow() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, permits) = PermitGenerator::new();
        permits.send("slow one".to_string()).unwrap();

        let mut harness = spawn_session(
            params(1, 0.0),
            settings(dir.path()),
            Arc::new(generator),
            Arc::new(StubTarget {
                stall: Some(Duration::from_secs(2)),
                ..Default::default()
            }),
        );

        // Give the worker a moment to get stuck inside the target call.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let snapshot = harness.snapshot_rx.borrow().clone();
        assert!(
            started.elapsed() < Duration::from_millis(50),
            "status read blocked on the loop"
        );
        assert_eq!(snapshot.state, SessionState::Running);
        assert_eq!(snapshot.exchanges_completed, 0);

        wait_terminal(&mut harness).await;
    }

    #[tokio::test]
    async fn final_flush_writes_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, permits) = PermitGenerator::new();
        permits.send("a1".to_string()).unwrap();
        permits.send("a2".to_string()).unwrap();

        let mut harness = spawn_session(
            params(2, 0.0),
            settings(dir.path()),
            Arc::new(generator),
            Arc::new(StubTarget::default()),
        );
        let snapshot = wait_terminal(&mut harness).await;
        harness.task.await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 1);
        let text = std::fs::read_to_string(files[0].path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["session"]["exchanges_completed"], 2);
        assert_eq!(
            value["session"]["session_id"],
            snapshot.session_id.unwrap().to_string()
        );
        assert_eq!(value["exchanges"].as_array().unwrap().len(), 2);
    }
}
