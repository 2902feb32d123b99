// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// Thin glue over `AppState`. All endpoints live under `/api/v1/` and carry no
// logic of their own beyond parameter defaults and error-to-status mapping.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::stream_controller::SessionError;
use crate::types::{SessionStatus, DAY_MS, HOUR_MS};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        // ── Session control ─────────────────────────────────────────
        .route("/api/v1/stream/start", post(stream_start))
        .route("/api/v1/stream/stop", post(stream_stop))
        .route("/api/v1/stream/status", get(stream_status))
        // ── Read path ───────────────────────────────────────────────
        .route("/api/v1/candles/recent", get(recent_candles))
        .route("/api/v1/candles/:symbol", get(candles_for_symbol))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/prices", get(prices))
        .route("/api/v1/prices/:symbol", get(price_for_symbol))
        // ── Live feed ───────────────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        error!(error = %message, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::AlreadyRunning | SessionError::NotRunning => StatusCode::CONFLICT,
            SessionError::Feed(_) => StatusCode::BAD_GATEWAY,
            SessionError::Flush(_) | SessionError::Pipeline(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    session: SessionStatus,
    subscribers: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        session: state.session_status(),
        subscribers: state.broadcaster.subscriber_count(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Session control
// =============================================================================

async fn stream_start(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.start_session().await.map_err(|e| {
        warn!(error = %e, "start request refused");
        ApiError::from(e)
    })?;
    info!("streaming started via API");
    Ok(Json(serde_json::json!({ "status": SessionStatus::Running })))
}

async fn stream_stop(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let flushed = state.stop_session().await.map_err(|e| {
        warn!(error = %e, "stop request refused");
        ApiError::from(e)
    })?;
    info!(flushed, "streaming stopped via API");
    Ok(Json(serde_json::json!({
        "status": SessionStatus::Stopped,
        "flushed": flushed,
    })))
}

async fn stream_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": state.session_status(),
        "last_error": state.controller.last_error(),
        "symbols": state.config.symbols,
    }))
}

// =============================================================================
// Candles
// =============================================================================

#[derive(Deserialize)]
struct DaysQuery {
    days: Option<i64>,
}

async fn candles_for_symbol(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<DaysQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let days = query
        .days
        .unwrap_or(state.config.default_query_days)
        .clamp(1, state.config.max_query_days.max(1));
    let since = chrono::Utc::now()
        .timestamp_millis()
        .saturating_sub(days.saturating_mul(DAY_MS));

    let candles = state
        .query_range(&symbol, since)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(candles))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn recent_candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(state.config.recent_limit).max(1);
    let recent = state
        .recent_candles(limit)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(recent))
}

#[derive(Deserialize)]
struct HoursQuery {
    hours: Option<i64>,
}

async fn stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HoursQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let since = stats_window_start(
        chrono::Utc::now().timestamp_millis(),
        query.hours,
        state.config.max_query_days,
    );
    let stats = state
        .symbol_stats(since)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(stats))
}

/// Start of the `?hours=` window, bounded by the same day limit as range
/// queries.
fn stats_window_start(now_ms: i64, hours: Option<i64>, max_days: i64) -> i64 {
    let max_hours = max_days.max(1).saturating_mul(24);
    let hours = hours.unwrap_or(24).clamp(1, max_hours);
    now_ms.saturating_sub(hours.saturating_mul(HOUR_MS))
}

async fn prices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.latest_prices())
}

async fn price_for_symbol(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .latest_price(&symbol)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no trade seen for {symbol}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_statuses() {
        assert_eq!(ApiError::from(SessionError::AlreadyRunning).status, StatusCode::CONFLICT);
        assert_eq!(ApiError::from(SessionError::NotRunning).status, StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(SessionError::Feed(anyhow::anyhow!("refused"))).status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(SessionError::Pipeline("panicked".into())).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn stats_window_is_clamped() {
        let now = 1_700_000_000_000;
        assert_eq!(stats_window_start(now, None, 30), now - 24 * HOUR_MS);
        assert_eq!(stats_window_start(now, Some(0), 30), now - HOUR_MS);
        assert_eq!(stats_window_start(now, Some(-5), 30), now - HOUR_MS);
        assert_eq!(
            stats_window_start(now, Some(10_000_000_000_000), 30),
            now - 30 * DAY_MS
        );
        assert_eq!(
            stats_window_start(now, Some(i64::MAX), i64::MAX),
            now.saturating_sub(i64::MAX)
        );
    }

    #[test]
    fn error_message_survives() {
        let err = ApiError::from(SessionError::NotRunning);
        assert_eq!(err.message, "streaming not started");
    }
}
