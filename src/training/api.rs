//! HTTP control API for the training orchestrator.
//!
//! The bridge binds locally, routes control calls to the
//! [`SessionManager`], and keeps an upstream-connectivity snapshot fresh
//! with a single background monitor task. Status reads are served entirely
//! from memory: the handlers never make a network call of their own.

use crate::errors::TrainingError;
use crate::training::manager::SessionManager;
use crate::training::session::{SessionParams, SessionSnapshot};
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub manager: Arc<SessionManager>,
    /// Fallback topic list for start requests that omit one.
    pub default_topics: Vec<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub max_exchanges: u64,
    #[serde(default = "default_delay")]
    pub delay: f64,
    pub topic_switch_interval: u64,
    /// Ordered topic list; falls back to the configured topics when absent.
    #[serde(default)]
    pub topics: Option<Vec<String>>,
}

fn default_delay() -> f64 {
    2.0
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub session_id: uuid::Uuid,
    pub max_exchanges: u64,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub was_running: bool,
    pub exchanges_completed: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub session: SessionSnapshot,
    pub generator_connected: bool,
    pub target_connected: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Conflict(String),
    Unprocessable(String),
    Unavailable(String),
    Internal(String),
}

impl From<TrainingError> for ApiError {
    fn from(err: TrainingError) -> Self {
        match err {
            TrainingError::SessionConflict => ApiError::Conflict(err.to_string()),
            TrainingError::InvalidParameters(_) => ApiError::Unprocessable(err.to_string()),
            TrainingError::UpstreamUnavailable { .. } => ApiError::Unavailable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(bridge_status_handler))
        .route("/api/training/start", post(start_handler))
        .route("/api/training/stop", post(stop_handler))
        .route("/api/training/status", get(training_status_handler))
        .route("/api/training/log", get(log_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "parley-bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

/// The supervisor's gate. Memory only.
async fn health_handler() -> &'static str {
    "ok"
}

async fn bridge_status_handler(State(state): State<SharedState>) -> Json<StatusResponse> {
    let (generator_connected, target_connected) = state.manager.reachability();
    Json(StatusResponse {
        session: state.manager.status().await,
        generator_connected,
        target_connected,
    })
}

async fn start_handler(
    State(state): State<SharedState>,
    Json(request): Json<StartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let topics = request
        .topics
        .filter(|topics| !topics.is_empty())
        .unwrap_or_else(|| state.default_topics.clone());

    let params = SessionParams {
        max_exchanges: request.max_exchanges,
        delay: request.delay,
        topic_switch_interval: request.topic_switch_interval,
        topics,
    };
    let session_id = state.manager.start(params).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            session_id,
            max_exchanges: request.max_exchanges,
        }),
    ))
}

async fn stop_handler(State(state): State<SharedState>) -> Json<StopResponse> {
    let outcome = state.manager.stop().await;
    Json(StopResponse {
        was_running: outcome.was_running,
        exchanges_completed: outcome.exchanges_completed,
    })
}

async fn training_status_handler(State(state): State<SharedState>) -> Json<SessionSnapshot> {
    Json(state.manager.status().await)
}

async fn log_handler(
    State(state): State<SharedState>,
    Query(query): Query<LogQuery>,
) -> Json<serde_json::Value> {
    let (total, exchanges) = state.manager.read_log(query.limit).await;
    Json(serde_json::json!({
        "total_exchanges": total,
        "showing": exchanges.len(),
        "exchanges": exchanges,
    }))
}

// ── Server ────────────────────────────────────────────────────────────

/// The bridge HTTP server. Owns the listener task and shuts it down
/// gracefully on `stop`.
pub struct BridgeServer {
    state: SharedState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    addr: Option<SocketAddr>,
    monitor: Option<tokio::task::JoinHandle<()>>,
}

impl BridgeServer {
    pub fn new(manager: Arc<SessionManager>, default_topics: Vec<String>) -> Self {
        Self {
            state: Arc::new(AppState {
                manager,
                default_topics,
            }),
            shutdown_tx: None,
            addr: None,
            monitor: None,
        }
    }

    /// Bind and serve. Also spawns the connectivity monitor that keeps the
    /// status snapshot's upstream flags current.
    pub async fn start(&mut self, port: u16, monitor_interval: Duration) -> Result<SocketAddr> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Failed to bind bridge on port {port}"))?;
        let addr = listener.local_addr().context("Failed to get bridge address")?;
        self.addr = Some(addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let app = build_router(self.state.clone());
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %err, "bridge server error");
            }
        });

        let manager = self.state.manager.clone();
        self.monitor = Some(tokio::spawn(async move {
            loop {
                manager.probe_upstreams().await;
                tokio::time::sleep(monitor_interval).await;
            }
        }));

        tracing::info!(%addr, "bridge listening");
        Ok(addr)
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        self.addr = None;
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }
}
