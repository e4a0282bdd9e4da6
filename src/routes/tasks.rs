use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::api::{
    AsyncDetectionRequest, CancelResponse, DetectionParams, ErrorResponse, TaskSubmittedResponse,
};
use crate::models::status::TaskStatus;
use crate::models::task::{clamp_priority, ImageSource, TaskId, TextQueries};
use crate::services::status::CancelOutcome;
use crate::services::submitter::{SubmitError, SubmitRequest};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(error)))
}

fn submit_error(e: SubmitError) -> ApiError {
    match e {
        SubmitError::EmptyQueries => api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        SubmitError::Publish { .. } => api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        SubmitError::Serialize(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn submit(
    state: &AppState,
    image: ImageSource,
    params: DetectionParams,
) -> Result<Json<TaskSubmittedResponse>, ApiError> {
    params
        .validate()
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    let task_id = state
        .submitter
        .submit(SubmitRequest {
            image,
            text_queries: params.text_queries,
            box_threshold: params.box_threshold,
            text_threshold: params.text_threshold,
            return_visualization: params.return_visualization,
            priority: clamp_priority(params.priority),
        })
        .await
        .map_err(submit_error)?;

    Ok(Json(TaskSubmittedResponse {
        task_id,
        status: "submitted".to_string(),
        message: "Task submitted to queue".to_string(),
    }))
}

/// POST /detect/async: Queue detection for an image URL.
pub async fn submit_url(
    State(state): State<AppState>,
    Json(request): Json<AsyncDetectionRequest>,
) -> Result<Json<TaskSubmittedResponse>, ApiError> {
    request
        .validate()
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    submit(&state, ImageSource::Url(request.image_url), request.params).await
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, format!("invalid value for {name}")))
}

/// POST /detect/async/upload: Queue detection for an uploaded image.
pub async fn submit_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<TaskSubmittedResponse>, ApiError> {
    let mut image_data: Option<Vec<u8>> = None;
    let mut params = DetectionParams::with_queries(TextQueries::Many(Vec::new()));

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let data = field
                .bytes()
                .await
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

            // Validate image format using the `image` crate
            image::guess_format(&data).map_err(|_| {
                api_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unrecognized image format")
            })?;

            image_data = Some(data.to_vec());
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
        match name.as_str() {
            "text_queries" => params.text_queries = TextQueries::Single(value),
            "box_threshold" => params.box_threshold = parse_field(&name, &value)?,
            "text_threshold" => params.text_threshold = parse_field(&name, &value)?,
            "return_visualization" => params.return_visualization = parse_field(&name, &value)?,
            "priority" => params.priority = parse_field(&name, &value)?,
            _ => tracing::debug!(field = %name, "Ignoring unknown form field"),
        }
    }

    let image_data =
        image_data.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing file field"))?;
    if image_data.len() > state.max_upload_bytes {
        return Err(api_error(StatusCode::PAYLOAD_TOO_LARGE, "image too large"));
    }

    submit(&state, ImageSource::Bytes(image_data), params).await
}

/// GET /task/{task_id}: Current task status. Unknown ids report `not_found`.
pub async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Json<TaskStatus> {
    Json(state.status.get_status(&TaskId::from(task_id)))
}

/// DELETE /task/{task_id}: Mark a task as cancelled.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<CancelResponse>) {
    let task_id = TaskId::from(task_id);
    match state.status.cancel(&task_id) {
        CancelOutcome::Cancelled => (
            StatusCode::OK,
            Json(CancelResponse {
                task_id,
                status: "cancelled".to_string(),
                message: Some("Task marked as cancelled".to_string()),
                error: None,
            }),
        ),
        CancelOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(CancelResponse {
                task_id,
                status: "not_found".to_string(),
                message: None,
                error: Some("Task not found".to_string()),
            }),
        ),
    }
}
