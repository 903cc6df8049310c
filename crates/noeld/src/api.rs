//! Observer-facing HTTP surface: read-only queries plus the live
//! WebSocket feed.

use crate::broadcast::{BroadcastHub, ObserverSubscription};
use crate::pipeline::{CounterSnapshot, Counters};
use crate::transport::ConnectionStatus;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use noel_core::{Clock, SnapshotReader, StateSnapshot};
use noel_store::{CheckinStore, IdentityRegistry, StorageError, StoredCheckin};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tower_http::cors::CorsLayer;

pub const DEFAULT_CHECKIN_LIMIT: usize = 20;
pub const MAX_CHECKIN_LIMIT: usize = 500;

/// Everything the handlers read. Nothing here can mutate the snapshot.
#[derive(Clone)]
pub struct ApiState {
    pub reader: SnapshotReader,
    pub hub: Arc<BroadcastHub>,
    pub checkins: Arc<dyn CheckinStore>,
    pub registry: Arc<dyn IdentityRegistry>,
    pub transport: Arc<dyn ConnectionStatus>,
    pub counters: Arc<Counters>,
    pub clock: Arc<dyn Clock>,
    pub started: Instant,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("storage query failed: {0}")]
    Storage(#[from] StorageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "query failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "query failed" })),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/state", get(state_snapshot))
        .route("/api/checkins", get(recent_checkins))
        .route("/api/stats", get(stats))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Queries ─────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub connected: bool,
    pub uptime_seconds: u64,
    pub timestamp: i64,
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        connected: state.transport.is_connected(),
        uptime_seconds: state.started.elapsed().as_secs(),
        timestamp: state.clock.now().timestamp_millis(),
    })
}

async fn state_snapshot(State(state): State<ApiState>) -> Json<StateSnapshot> {
    Json(state.reader.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct CheckinsQuery {
    pub limit: Option<usize>,
}

/// `None` or `0` means the default; anything above the cap is clamped.
fn effective_limit(requested: Option<usize>) -> usize {
    match requested {
        None | Some(0) => DEFAULT_CHECKIN_LIMIT,
        Some(n) => n.min(MAX_CHECKIN_LIMIT),
    }
}

async fn recent_checkins(
    State(state): State<ApiState>,
    Query(query): Query<CheckinsQuery>,
) -> Result<Json<Vec<StoredCheckin>>, ApiError> {
    let limit = effective_limit(query.limit);
    Ok(Json(state.checkins.recent_checkins(limit).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_identities: u64,
    pub total_checkins: u64,
    pub people_count: u32,
    pub uptime_seconds: u64,
    pub observers: usize,
    pub dropped_observer_messages: u64,
    pub pipeline: CounterSnapshot,
}

async fn stats(State(state): State<ApiState>) -> Result<Json<StatsResponse>, ApiError> {
    let total_identities = state.registry.count_identities().await?;
    let total_checkins = state.checkins.count_checkins().await?;
    Ok(Json(StatsResponse {
        total_identities,
        total_checkins,
        people_count: state.reader.people_count(),
        uptime_seconds: state.started.elapsed().as_secs(),
        observers: state.hub.observer_count(),
        dropped_observer_messages: state.hub.dropped_messages(),
        pipeline: state.counters.snapshot(),
    }))
}

// ── Live feed ───────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| observe(socket, state.hub))
}

async fn observe(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let ObserverSubscription { id, mut rx } = hub.connect_observer();
    let (mut sender, mut receiver) = socket.split();

    // Forward hub messages; the first one is always the snapshot.
    let forward = async {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.as_ref().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    };

    // Incoming content is ignored; only a close or error ends the session.
    let drain = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        _ = forward => {},
        _ = drain => {},
    }
    hub.disconnect_observer(&id);
}
