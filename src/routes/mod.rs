use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod health;
pub mod metrics;
pub mod queue;
pub mod tasks;

/// Task submission and status API.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/health", get(health::health_check))
        .route("/detect/async", post(tasks::submit_url))
        .route("/detect/async/upload", post(tasks::submit_upload))
        .route(
            "/task/{task_id}",
            get(tasks::get_task_status).delete(tasks::cancel_task),
        )
        .route("/queue/status", get(queue::queue_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
