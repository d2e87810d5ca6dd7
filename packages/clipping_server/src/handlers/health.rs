use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chunk_reassembly::UploadStatus;
use realtime_mux::ConnectionState;

use crate::AppState;
use crate::error::ApiError;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.metrics.snapshot();
    let connection_state = state.multiplexer.connection_state();

    let realtime_ok = !matches!(
        connection_state,
        Some(ConnectionState::Closing | ConnectionState::Closed)
    );
    let status = if realtime_ok && snapshot.cleanup.failed == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Ok(Json(metrics::HealthStatus {
        status: status.to_string(),
        realtime: metrics::RealtimeHealth {
            channels: state.multiplexer.active_subscriptions().len(),
            connection_state: connection_state.map(|s| s.to_string()),
        },
        sessions: metrics::SessionHealth {
            processing: state
                .repository
                .count_by_status(UploadStatus::Processing)
                .await?,
            failed: state.repository.count_by_status(UploadStatus::Failed).await?,
            pending_cleanups: state.reassembler.pending_cleanups(),
        },
        uptime_secs: snapshot.uptime_secs,
    }))
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - returns 200 if the database is reachable
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let db_ok = state.db.pool.acquire().await.is_ok();

    if db_ok {
        Json(serde_json::json!({
            "status": "ready",
            "database": "connected"
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected"
            })),
        )
            .into_response()
    }
}
