//! Training session state: parameters, the session machine, and the
//! snapshot that serves every status read.
//!
//! The loop worker is the only writer of a live [`TrainingSession`]; all
//! other parties see it through [`SessionSnapshot`] values published on a
//! watch channel.

use crate::errors::TrainingError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifecycle.
///
/// `Idle --start--> Running --stop--> Stopping --> Stopped`;
/// `Running` also exits to `Stopped` on reaching `max_exchanges` and to
/// `Failed` on hitting the consecutive-failure threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    /// A new session may only start once the previous one is out of the way.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Stopping)
    }
}

/// Validated per-session parameters from the `start` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub max_exchanges: u64,
    /// Inter-exchange pause in seconds.
    pub delay: f64,
    pub topic_switch_interval: u64,
    pub topics: Vec<String>,
}

impl SessionParams {
    /// Reject bad parameters before any state is touched.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.max_exchanges == 0 {
            return Err(TrainingError::InvalidParameters(
                "max_exchanges must be > 0".to_string(),
            ));
        }
        if self.topic_switch_interval == 0 {
            return Err(TrainingError::InvalidParameters(
                "topic_switch_interval must be > 0".to_string(),
            ));
        }
        if !self.delay.is_finite() || self.delay < 0.0 {
            return Err(TrainingError::InvalidParameters(
                "delay must be a finite number >= 0".to_string(),
            ));
        }
        if self.topics.is_empty() {
            return Err(TrainingError::InvalidParameters(
                "topics must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Topic for the exchange numbered `seq` (1-based). Pure function of the
    /// counter, so the topic can never drift from the exchange count.
    pub fn topic_for(&self, seq: u64) -> &str {
        let index = ((seq - 1) / self.topic_switch_interval) as usize % self.topics.len();
        &self.topics[index]
    }

    /// Topic the *next* exchange will use, given how many completed so far.
    pub fn current_topic(&self, exchanges_completed: u64) -> &str {
        self.topic_for(exchanges_completed + 1)
    }
}

/// Live session state. Owned and mutated by exactly one loop worker.
#[derive(Debug)]
pub struct TrainingSession {
    pub id: Uuid,
    pub state: SessionState,
    pub exchanges_completed: u64,
    pub consecutive_failures: u32,
    pub started_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub params: SessionParams,
}

impl TrainingSession {
    pub fn new(params: SessionParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Running,
            exchanges_completed: 0,
            consecutive_failures: 0,
            started_at: Utc::now(),
            failure_reason: None,
            params,
        }
    }

    /// Point-in-time view for status reads.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: Some(self.id),
            state: self.state,
            exchanges_completed: self.exchanges_completed,
            max_exchanges: Some(self.params.max_exchanges),
            current_topic: Some(
                self.params
                    .current_topic(self.exchanges_completed)
                    .to_string(),
            ),
            started_at: Some(self.started_at),
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// What `status()` returns: a plain value, no locks, no I/O behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub exchanges_completed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_exchanges: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SessionSnapshot {
    /// The snapshot before any session has ever run.
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            exchanges_completed: 0,
            max_exchanges: None,
            current_topic: None,
            started_at: None,
            failure_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SessionParams {
        SessionParams {
            max_exchanges: 5,
            delay: 0.0,
            topic_switch_interval: 2,
            topics: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        }
    }

    #[test]
    fn valid_params_pass() {
        assert!(params().validate().is_ok());
    }

    #[test]
    fn zero_max_exchanges_rejected() {
        let mut p = params();
        p.max_exchanges = 0;
        assert!(matches!(
            p.validate(),
            Err(TrainingError::InvalidParameters(_))
        ));
    }

    #[test]
    fn zero_topic_interval_rejected() {
        let mut p = params();
        p.topic_switch_interval = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn negative_or_nan_delay_rejected() {
        let mut p = params();
        p.delay = -1.0;
        assert!(p.validate().is_err());
        p.delay = f64::NAN;
        assert!(p.validate().is_err());
    }

    #[test]
    fn empty_topics_rejected() {
        let mut p = params();
        p.topics.clear();
        assert!(p.validate().is_err());
    }

    #[test]
    fn topic_sequence_matches_interval_of_two() {
        // With interval 2 over [a, b, c], exchanges 1..=5 see a,a,b,b,c.
        let p = params();
        let seen: Vec<&str> = (1..=5).map(|n| p.topic_for(n)).collect();
        assert_eq!(seen, vec!["a", "a", "b", "b", "c"]);
    }

    #[test]
    fn topic_index_wraps_around() {
        let p = params();
        // Exchange 7 and 8 wrap back to "a" (index 3 mod 3 == 0).
        assert_eq!(p.topic_for(7), "a");
        assert_eq!(p.topic_for(8), "a");
    }

    #[test]
    fn topic_index_is_pure_function_of_counter() {
        let p = params();
        for completed in 0..20u64 {
            let expected_index =
                (completed / p.topic_switch_interval) as usize % p.topics.len();
            assert_eq!(p.current_topic(completed), p.topics[expected_index]);
        }
    }

    #[test]
    fn active_and_terminal_states() {
        assert!(SessionState::Running.is_active());
        assert!(SessionState::Stopping.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Running.is_terminal());
    }

    #[test]
    fn snapshot_reflects_session_fields() {
        let mut session = TrainingSession::new(params());
        session.exchanges_completed = 3;
        let snap = session.snapshot();
        assert_eq!(snap.state, SessionState::Running);
        assert_eq!(snap.exchanges_completed, 3);
        // After 3 completed with interval 2: next exchange is #4 -> "b".
        assert_eq!(snap.current_topic.as_deref(), Some("b"));
        assert_eq!(snap.session_id, Some(session.id));
    }

    #[test]
    fn idle_snapshot_is_empty() {
        let snap = SessionSnapshot::idle();
        assert_eq!(snap.state, SessionState::Idle);
        assert_eq!(snap.exchanges_completed, 0);
        assert!(snap.session_id.is_none());
        assert!(snap.started_at.is_none());
    }

    #[test]
    fn session_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionState::Running).unwrap(),
            r#""running""#
        );
        assert_eq!(
            serde_json::to_string(&SessionState::Failed).unwrap(),
            r#""failed""#
        );
    }
}
