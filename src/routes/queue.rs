use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::ErrorResponse;
use crate::services::status::QueueSnapshot;

/// GET /queue/status: Broker depth plus in-memory task counts.
pub async fn queue_status(
    State(state): State<AppState>,
) -> Result<Json<QueueSnapshot>, (StatusCode, Json<ErrorResponse>)> {
    state.status.queue_status().await.map(Json).map_err(|e| {
        tracing::error!(error = %e, "Failed to get queue status");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(e.to_string())),
        )
    })
}
