use garde::Validate;
use serde::{Deserialize, Serialize};

use super::task::{TaskId, TextQueries, DEFAULT_PRIORITY};

fn default_box_threshold() -> f64 {
    0.4
}

fn default_text_threshold() -> f64 {
    0.3
}

fn default_visualization() -> bool {
    true
}

fn default_priority() -> i64 {
    DEFAULT_PRIORITY as i64
}

fn non_blank_queries(value: &TextQueries, _ctx: &()) -> garde::Result {
    if value.is_blank() {
        return Err(garde::Error::new("at least one non-empty text query is required"));
    }
    Ok(())
}

/// Detection parameters shared by the URL and upload submission paths.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DetectionParams {
    #[garde(custom(non_blank_queries))]
    pub text_queries: TextQueries,

    #[serde(default = "default_box_threshold")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub box_threshold: f64,

    #[serde(default = "default_text_threshold")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub text_threshold: f64,

    #[serde(default = "default_visualization")]
    #[garde(skip)]
    pub return_visualization: bool,

    #[serde(default = "default_priority")]
    #[garde(range(min = 0, max = 9))]
    pub priority: i64,
}

impl DetectionParams {
    /// Defaults for an upload whose form only carries `text_queries`.
    pub fn with_queries(text_queries: TextQueries) -> Self {
        Self {
            text_queries,
            box_threshold: default_box_threshold(),
            text_threshold: default_text_threshold(),
            return_visualization: default_visualization(),
            priority: default_priority(),
        }
    }
}

/// Body of `POST /detect/async`.
#[derive(Debug, Deserialize, Validate)]
pub struct AsyncDetectionRequest {
    #[garde(length(min = 1, max = 2048))]
    pub image_url: String,

    #[serde(flatten)]
    #[garde(dive)]
    pub params: DetectionParams,
}

/// Response after a task has been queued.
#[derive(Debug, Serialize)]
pub struct TaskSubmittedResponse {
    pub task_id: TaskId,
    pub status: String,
    pub message: String,
}

/// Response for `DELETE /task/{task_id}`.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: TaskId,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error body returned by the task routes.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: error.into(),
        }
    }
}
