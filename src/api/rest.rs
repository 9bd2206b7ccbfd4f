// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Read endpoints (health, stream list,
// stream detail, WebSocket feed) are public. Endpoints that change what is
// synchronized require a valid Bearer token checked via the `AuthBearer`
// extractor.
//
// CORS is configured permissively for development; tighten it in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::market_data::MarketSync;
use crate::types::{StreamKey, Timeframe};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS, tracing and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/streams", get(list_streams))
        .route("/api/v1/streams/:symbol/:timeframe", get(stream_detail))
        // ── Authenticated controls ──────────────────────────────────
        .route("/api/v1/streams", post(watch_stream))
        .route("/api/v1/streams/:symbol/:timeframe", delete(unwatch_stream))
        .route("/api/v1/streams/:symbol/:timeframe/refetch", post(refetch_stream))
        .route("/api/v1/streams/:symbol/:timeframe/reconnect", post(reconnect_stream))
        .route("/api/v1/streams/:symbol/:timeframe/disconnect", post(disconnect_stream))
        // ── WebSocket feed ──────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotWatched(StreamKey),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotWatched(key) => (StatusCode::NOT_FOUND, format!("{key} is not watched")),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn parse_key(symbol: &str, timeframe: &str) -> Result<StreamKey, ApiError> {
    if symbol.trim().is_empty() {
        return Err(ApiError::BadRequest("symbol must not be empty".into()));
    }
    let timeframe: Timeframe = timeframe
        .parse()
        .map_err(|e: crate::error::SyncError| ApiError::BadRequest(e.to_string()))?;
    Ok(StreamKey::new(symbol, timeframe))
}

fn lookup(state: &AppState, symbol: &str, timeframe: &str) -> Result<Arc<MarketSync>, ApiError> {
    let key = parse_key(symbol, timeframe)?;
    state.get(&key).ok_or(ApiError::NotWatched(key))
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    watched: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        watched: state.watched().len(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Streams (public reads)
// =============================================================================

async fn list_streams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.summaries())
}

async fn stream_detail(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let sync = lookup(&state, &symbol, &timeframe)?;
    Ok(Json(sync.snapshot()))
}

// =============================================================================
// Stream controls (authenticated)
// =============================================================================

#[derive(Debug, Deserialize)]
struct WatchRequest {
    symbol: String,
    timeframe: String,
}

async fn watch_stream(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<WatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&req.symbol, &req.timeframe)?;
    let (sync, created) = state.watch(key);
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(sync.snapshot().summary())))
}

async fn unwatch_stream(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&symbol, &timeframe)?;
    if state.unwatch(&key).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotWatched(key))
    }
}

fn accepted(key: StreamKey, action: &'static str) -> impl IntoResponse {
    info!(key = %key, action, "stream control accepted");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted", "key": key.to_string(), "action": action })),
    )
}

async fn refetch_stream(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let sync = lookup(&state, &symbol, &timeframe)?;
    sync.refetch();
    Ok(accepted(sync.key(), "refetch"))
}

async fn reconnect_stream(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let sync = lookup(&state, &symbol, &timeframe)?;
    sync.reconnect();
    Ok(accepted(sync.key(), "reconnect"))
}

async fn disconnect_stream(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let sync = lookup(&state, &symbol, &timeframe)?;
    sync.disconnect();
    Ok(accepted(sync.key(), "disconnect"))
}

// =============================================================================
// Tests
// =============================================================================
