//! Single-attempt HTTP liveness probe.
//!
//! One request per call, bounded by the caller's deadline. Retry-with-backoff
//! belongs to startup gating only; a probe invoked from a status path must
//! return within `timeout` no matter what, so the checker itself never
//! retries.

use serde::Serialize;
use std::time::Duration;

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// The service answered with 2xx, or 404 (the server is up even if the
    /// probe path isn't routed).
    Healthy,
    /// The service is present but not well: error status, or the request
    /// timed out (listening but slow/hung).
    Unhealthy,
    /// Nothing is listening: connection refused or another transport error.
    Unreachable,
}

impl HealthStatus {
    /// Only `Healthy` passes a startup gate.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Probe seam so supervisor logic can be tested without a network.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, url: &str, timeout: Duration) -> HealthStatus;
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Probe `url` once, classifying the outcome. Never retries internally.
    pub async fn check(&self, url: &str, timeout: Duration) -> HealthStatus {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                }
            }
            Err(err) if err.is_timeout() => HealthStatus::Unhealthy,
            Err(_) => HealthStatus::Unreachable,
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for HealthChecker {
    async fn check(&self, url: &str, timeout: Duration) -> HealthStatus {
        HealthChecker::check(self, url, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};
    use std::time::Instant;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn ok_response_is_healthy() {
        let base = serve(Router::new().route("/health", get(|| async { "ok" }))).await;
        let checker = HealthChecker::new();
        let status = checker
            .check(&format!("{base}/health"), Duration::from_secs(2))
            .await;
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn missing_route_counts_as_healthy() {
        // A 404 means the listener is up; the original launcher gates on that.
        let base = serve(Router::new().route("/other", get(|| async { "ok" }))).await;
        let checker = HealthChecker::new();
        let status = checker
            .check(&format!("{base}/health"), Duration::from_secs(2))
            .await;
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn server_error_is_unhealthy() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let checker = HealthChecker::new();
        let status = checker
            .check(&format!("{base}/health"), Duration::from_secs(2))
            .await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let checker = HealthChecker::new();
        let status = checker
            .check(&format!("http://{addr}/health"), Duration::from_secs(2))
            .await;
        assert_eq!(status, HealthStatus::Unreachable);
    }

    #[tokio::test]
    async fn hung_server_is_unhealthy_within_deadline() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "too late"
            }),
        ))
        .await;

        let checker = HealthChecker::new();
        let started = Instant::now();
        let status = checker
            .check(&format!("{base}/health"), Duration::from_millis(200))
            .await;
        let elapsed = started.elapsed();

        assert_eq!(status, HealthStatus::Unhealthy);
        // One attempt, no internal retry: the call returns at the deadline,
        // not at a multiple of it.
        assert!(elapsed < Duration::from_secs(2), "probe took {elapsed:?}");
    }
}
