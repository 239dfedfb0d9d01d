//! Control plane
//!
//! Local axum surface for operating the pipeline: strategy listing and
//! toggles, status, recent opportunities and outcomes, a websocket event
//! stream ticking at >= 0.5 Hz, Prometheus metrics, and registry hot
//! reload. Errors come back structured as {kind, message, code}.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerStatsSnapshot};
use crate::clock;
use crate::config::MipConfig;
use crate::dispatch::{Dispatcher, SubscriberStats};
use crate::error::MipError;
use crate::executor::{BundleExecutor, ExecutorStatsSnapshot};
use crate::ingress::{Normalizer, NormalizerStatsSnapshot};
use crate::models::{DeviationFlag, Opportunity, OutcomeRecord, StrategyKind};
use crate::oracle::OracleMonitor;
use crate::outcome::{OutcomeStore, OutcomeTracker, RollingWindows, StrategyWindowSnapshot};
use crate::registry::Registry;
use crate::sandbox::{Sandbox, SandboxStatsSnapshot};
use crate::shutdown::ShutdownToken;
use crate::strategies::StrategySet;

#[derive(Clone)]
pub struct ControlState {
    pub registry: Arc<Registry>,
    pub config_path: PathBuf,
    pub broker: Arc<Broker>,
    pub strategies: StrategySet,
    pub normalizer: Arc<Normalizer>,
    pub dispatcher: Arc<Dispatcher>,
    pub sandbox: Arc<Sandbox>,
    pub oracle: Arc<OracleMonitor>,
    pub windows: Arc<RollingWindows>,
    pub store: OutcomeStore,
    pub executor: Arc<BundleExecutor>,
    pub tracker: Arc<OutcomeTracker>,
    pub metrics: PrometheusHandle,
    pub started_at: crate::clock::MonoTime,
    pub event_period: Duration,
}

/// Structured error payload, stable across releases.
#[derive(Debug, Serialize)]
struct ApiError {
    kind: &'static str,
    message: String,
    code: u16,
}

impl ApiError {
    fn from_mip(err: &MipError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            code: err.code(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: "not_found",
            message: message.into(),
            code: 404,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.kind {
            "not_found" => StatusCode::NOT_FOUND,
            "config_error" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    uptime_secs: f64,
    live_pending_txs: usize,
    published: u64,
    normalizer: NormalizerStatsSnapshot,
    dispatcher: Vec<SubscriberStats>,
    broker: BrokerStatsSnapshot,
    sandbox: SandboxStatsSnapshot,
    executor: ExecutorStatsSnapshot,
    tracked_bundles: usize,
    deviation_flags: Vec<DeviationFlag>,
    strategy_windows: Vec<StrategyWindowSnapshot>,
}

fn status_snapshot(state: &ControlState) -> StatusSnapshot {
    StatusSnapshot {
        uptime_secs: clock::elapsed_ms(state.started_at) / 1_000.0,
        live_pending_txs: state.normalizer.live_len(),
        published: state.dispatcher.published(),
        normalizer: state.normalizer.stats(),
        dispatcher: state.dispatcher.stats(),
        broker: state.broker.stats(),
        sandbox: state.sandbox.stats(),
        executor: state.executor.stats(),
        tracked_bundles: state.tracker.pending_bundles(),
        deviation_flags: state.oracle.flags(),
        strategy_windows: state.windows.snapshot(),
    }
}

async fn get_status(State(state): State<ControlState>) -> Json<StatusSnapshot> {
    Json(status_snapshot(&state))
}

async fn list_strategies(State(state): State<ControlState>) -> impl IntoResponse {
    Json(state.strategies.snapshot())
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_strategy(
    State(state): State<ControlState>,
    Path(kind): Path<String>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kind = StrategyKind::parse(&kind)
        .ok_or_else(|| ApiError::not_found(format!("unknown strategy `{kind}`")))?;
    if !state.strategies.toggle(kind, req.enabled) {
        return Err(ApiError::not_found(format!("strategy `{kind}` not running")));
    }
    Ok(Json(json!({ "strategy": kind, "enabled": req.enabled })))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn recent_opportunities(
    State(state): State<ControlState>,
    Query(q): Query<LimitQuery>,
) -> Json<Vec<Opportunity>> {
    Json(state.broker.recent(q.limit.unwrap_or(50).min(256)))
}

async fn recent_outcomes(
    State(state): State<ControlState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<OutcomeRecord>>, ApiError> {
    let store = state.store.clone();
    let limit = q.limit.unwrap_or(50).min(1_000);
    let rows = tokio::task::spawn_blocking(move || store.recent(limit))
        .await
        .map_err(|e| ApiError {
            kind: "internal",
            message: e.to_string(),
            code: 500,
        })?
        .map_err(|e| ApiError {
            kind: "internal",
            message: e.to_string(),
            code: 500,
        })?;
    Ok(Json(rows))
}

async fn reload_registry(
    State(state): State<ControlState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cfg = MipConfig::load(&state.config_path).map_err(|e| ApiError::from_mip(&e))?;
    state
        .registry
        .reload(&cfg)
        .map_err(|e| ApiError::from_mip(&e))?;
    info!("registry reloaded from {}", state.config_path.display());
    Ok(Json(json!({
        "chains": cfg.chains.len(),
        "protocols": cfg.protocols.len(),
    })))
}

async fn metrics_text(State(state): State<ControlState>) -> String {
    state.metrics.render()
}

/// Status snapshots over a websocket at the configured period (>= 0.5 Hz).
async fn subscribe_events(
    State(state): State<ControlState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| event_stream(socket, state))
}

async fn event_stream(mut socket: WebSocket, state: ControlState) {
    let mut tick = tokio::time::interval(state.event_period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let snapshot = status_snapshot(&state);
                let payload = match serde_json::to_string(&snapshot) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    return;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => return,
                Some(Err(_)) => return,
                _ => {}
            },
        }
    }
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/strategies", get(list_strategies))
        .route("/api/strategies/:kind/toggle", post(toggle_strategy))
        .route("/api/opportunities", get(recent_opportunities))
        .route("/api/outcomes", get(recent_outcomes))
        .route("/api/registry/reload", post(reload_registry))
        .route("/metrics", get(metrics_text))
        .route("/ws/events", get(subscribe_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control plane until shutdown.
pub async fn serve(
    listen: String,
    state: ControlState,
    mut shutdown: ShutdownToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&listen).await?;
    info!(addr = %listen, "control plane listening");
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
        .map_err(|e| {
            warn!(error = %e, "control plane exited");
            anyhow::anyhow!(e)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_shape_is_stable() {
        let err = ApiError::from_mip(&MipError::Config("bad key".into()));
        assert_eq!(err.kind, "config_error");
        assert_eq!(err.code, 100);
        let body = serde_json::to_value(&err).unwrap();
        assert!(body.get("kind").is_some());
        assert!(body.get("message").is_some());
        assert!(body.get("code").is_some());
    }
}
