//! Append-only record of conversation exchanges.
//!
//! Sequence numbers are 1-based and dense. Records are never mutated or
//! deleted; flushing writes the whole log (with a session header) to a JSON
//! file under the configured log directory.

use crate::errors::TrainingError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One generator→target round trip. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub generator_message: String,
    pub target_response: String,
    /// Opaque extras from the target (emotional/confidence tags and the
    /// like). Carried verbatim, never interpreted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The sequence number was already recorded; the first write stands.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct ExchangeLog {
    entries: Vec<Exchange>,
}

impl ExchangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_seq(&self) -> u64 {
        self.entries.last().map(|e| e.seq + 1).unwrap_or(1)
    }

    /// Append one exchange. Re-appending an existing sequence number is a
    /// deterministic no-op (`Duplicate`, first write wins); a sequence
    /// number beyond the next expected one is an error, since the log must
    /// stay dense.
    pub fn append(&mut self, exchange: Exchange) -> Result<AppendOutcome, TrainingError> {
        let expected = self.next_seq();
        if exchange.seq < expected {
            return Ok(AppendOutcome::Duplicate);
        }
        if exchange.seq > expected {
            return Err(TrainingError::ExchangeGap {
                seq: exchange.seq,
                expected,
            });
        }
        self.entries.push(exchange);
        Ok(AppendOutcome::Appended)
    }

    /// The most recent `n` exchanges, oldest first.
    pub fn read_last(&self, n: usize) -> &[Exchange] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exchange> {
        self.entries.iter()
    }

    /// Write the whole log to `<dir>/session_<id>.json`. Creates the
    /// directory if needed; returns the written path. An empty log is not
    /// flushed.
    pub fn flush(&self, dir: &Path, header: &SessionHeader) -> Result<Option<PathBuf>, TrainingError> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        std::fs::create_dir_all(dir).map_err(|source| TrainingError::FlushFailed {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = dir.join(format!("session_{}.json", header.session_id));
        let document = serde_json::json!({
            "session": header,
            "exchanges": self.entries,
        });
        let json = serde_json::to_string_pretty(&document)
            .map_err(|e| TrainingError::Other(e.into()))?;
        std::fs::write(&path, json).map_err(|source| TrainingError::FlushFailed {
            path: path.clone(),
            source,
        })?;
        Ok(Some(path))
    }
}

/// Session metadata written alongside the exchanges on flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub exchanges_completed: u64,
    pub final_state: crate::training::session::SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::session::SessionState;

    fn exchange(seq: u64) -> Exchange {
        Exchange {
            seq,
            timestamp: Utc::now(),
            generator_message: format!("hello {seq}"),
            target_response: format!("reply {seq}"),
            metadata: None,
        }
    }

    fn header(log: &ExchangeLog) -> SessionHeader {
        SessionHeader {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            exchanges_completed: log.len() as u64,
            final_state: SessionState::Stopped,
            failure_reason: None,
        }
    }

    #[test]
    fn appends_dense_sequence() {
        let mut log = ExchangeLog::new();
        for seq in 1..=3 {
            assert_eq!(log.append(exchange(seq)).unwrap(), AppendOutcome::Appended);
        }
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn duplicate_seq_is_rejected_first_write_wins() {
        let mut log = ExchangeLog::new();
        let mut first = exchange(1);
        first.generator_message = "original".to_string();
        log.append(first).unwrap();

        let mut dup = exchange(1);
        dup.generator_message = "impostor".to_string();
        assert_eq!(log.append(dup).unwrap(), AppendOutcome::Duplicate);

        assert_eq!(log.len(), 1);
        assert_eq!(log.read_last(1)[0].generator_message, "original");
    }

    #[test]
    fn gap_is_an_error() {
        let mut log = ExchangeLog::new();
        log.append(exchange(1)).unwrap();
        let err = log.append(exchange(3)).unwrap_err();
        assert!(matches!(
            err,
            TrainingError::ExchangeGap { seq: 3, expected: 2 }
        ));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn read_last_returns_most_recent_in_order() {
        let mut log = ExchangeLog::new();
        for seq in 1..=5 {
            log.append(exchange(seq)).unwrap();
        }
        let last = log.read_last(2);
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].seq, 4);
        assert_eq!(last[1].seq, 5);

        // Asking for more than exists returns everything.
        assert_eq!(log.read_last(100).len(), 5);
    }

    #[test]
    fn flush_writes_header_and_exchanges() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ExchangeLog::new();
        log.append(exchange(1)).unwrap();
        log.append(exchange(2)).unwrap();

        let header = header(&log);
        let path = log.flush(dir.path(), &header).unwrap().unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("session_"));

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["session"]["exchanges_completed"], 2);
        assert_eq!(value["session"]["final_state"], "stopped");
        assert_eq!(value["exchanges"].as_array().unwrap().len(), 2);
        assert_eq!(value["exchanges"][0]["seq"], 1);
    }

    #[test]
    fn empty_log_is_not_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExchangeLog::new();
        let header = header(&log);
        assert!(log.flush(dir.path(), &header).unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn metadata_round_trips() {
        let mut ex = exchange(1);
        ex.metadata = Some(serde_json::json!({"emotions": {"joy": 0.8}}));
        let json = serde_json::to_string(&ex).unwrap();
        let parsed: Exchange = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.metadata.unwrap()["emotions"]["joy"], 0.8);
    }
}
