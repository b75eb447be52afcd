//! Clients for the two conversation endpoints.
//!
//! `Generator` produces the next utterance; `Target` receives it and
//! answers. Both are traits so the exchange loop can be driven by stubs in
//! tests; the production implementations speak the JSON-over-HTTP contracts
//! of the external services, with a mandatory timeout on every call.

use crate::errors::TrainingError;
use crate::supervisor::health::HealthChecker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One past round trip, as context for the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub user: String,
    pub assistant: String,
}

/// The target's answer plus whatever extra fields it attached.
#[derive(Debug, Clone)]
pub struct TargetReply {
    pub response: String,
    pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce the next utterance in reply to `message`, with bounded
    /// latency. `history` is a short window of prior turns.
    async fn next_utterance(
        &self,
        message: &str,
        history: &[HistoryTurn],
    ) -> Result<String, TrainingError>;

    /// Single bounded reachability probe (no retries) for the connectivity
    /// snapshot.
    async fn is_reachable(&self) -> bool;
}

#[async_trait]
pub trait Target: Send + Sync {
    /// Deliver one utterance and collect the reply.
    async fn deliver(&self, message: &str) -> Result<TargetReply, TrainingError>;

    async fn is_reachable(&self) -> bool;
}

#[derive(Serialize)]
struct GeneratorRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    history: Option<&'a [HistoryTurn]>,
}

#[derive(Serialize)]
struct TargetRequest<'a> {
    message: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    response: String,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Reqwest-backed generator client.
pub struct HttpGenerator {
    client: reqwest::Client,
    checker: HealthChecker,
    base_url: String,
    chat_path: String,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpGenerator {
    pub fn new(
        base_url: &str,
        chat_path: &str,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            checker: HealthChecker::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_path: chat_path.to_string(),
            request_timeout,
            probe_timeout,
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn next_utterance(
        &self,
        message: &str,
        history: &[HistoryTurn],
    ) -> Result<String, TrainingError> {
        let url = format!("{}{}", self.base_url, self.chat_path);
        let body = GeneratorRequest {
            message,
            history: (!history.is_empty()).then_some(history),
        };

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| TrainingError::UpstreamCallFailed {
                upstream: "generator".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(TrainingError::UpstreamCallFailed {
                upstream: "generator".to_string(),
                message: format!("status {}", response.status()),
            });
        }

        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| TrainingError::UpstreamCallFailed {
                    upstream: "generator".to_string(),
                    message: format!("invalid response body: {e}"),
                })?;
        Ok(parsed.response)
    }

    async fn is_reachable(&self) -> bool {
        self.checker
            .check(&self.base_url, self.probe_timeout)
            .await
            .is_healthy()
    }
}

/// Reqwest-backed target client.
pub struct HttpTarget {
    client: reqwest::Client,
    checker: HealthChecker,
    base_url: String,
    chat_path: String,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpTarget {
    pub fn new(
        base_url: &str,
        chat_path: &str,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            checker: HealthChecker::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_path: chat_path.to_string(),
            request_timeout,
            probe_timeout,
        }
    }
}

#[async_trait]
impl Target for HttpTarget {
    async fn deliver(&self, message: &str) -> Result<TargetReply, TrainingError> {
        let url = format!("{}{}", self.base_url, self.chat_path);

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&TargetRequest { message })
            .send()
            .await
            .map_err(|e| TrainingError::UpstreamCallFailed {
                upstream: "target".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(TrainingError::UpstreamCallFailed {
                upstream: "target".to_string(),
                message: format!("status {}", response.status()),
            });
        }

        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| TrainingError::UpstreamCallFailed {
                    upstream: "target".to_string(),
                    message: format!("invalid response body: {e}"),
                })?;

        let metadata = (!parsed.extra.is_empty())
            .then(|| serde_json::Value::Object(parsed.extra));
        Ok(TargetReply {
            response: parsed.response,
            metadata,
        })
    }

    async fn is_reachable(&self) -> bool {
        self.checker
            .check(&self.base_url, self.probe_timeout)
            .await
            .is_healthy()
    }
}
