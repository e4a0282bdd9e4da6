use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::task::TaskId;

/// Error text reported for ids that were never submitted.
pub const TASK_NOT_FOUND: &str = "Task not found";

/// Sub-label reported while a task is `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStage {
    LoadingModel,
    ProcessingImage,
}

/// Lifecycle state of a task. The payload-bearing variants make `result`
/// present only when completed and `error` only when failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Processing { stage: TaskStage },
    Completed { result: serde_json::Value },
    Failed { error: String },
    Cancelled,
    NotFound { error: String },
}

/// Payload-free status tag, used for counting and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StatusTag {
    Submitted,
    Processing,
    Completed,
    Failed,
    Cancelled,
    NotFound,
}

impl TaskState {
    pub fn tag(&self) -> StatusTag {
        match self {
            TaskState::Submitted => StatusTag::Submitted,
            TaskState::Processing { .. } => StatusTag::Processing,
            TaskState::Completed { .. } => StatusTag::Completed,
            TaskState::Failed { .. } => StatusTag::Failed,
            TaskState::Cancelled => StatusTag::Cancelled,
            TaskState::NotFound { .. } => StatusTag::NotFound,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed { .. } | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }
}

/// Queryable status record for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatus {
    /// Record a transition to `state` stamped with the current time.
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn submitted(task_id: TaskId) -> Self {
        Self::new(task_id, TaskState::Submitted)
    }

    pub fn processing(task_id: TaskId, stage: TaskStage) -> Self {
        Self::new(task_id, TaskState::Processing { stage })
    }

    pub fn completed(task_id: TaskId, result: serde_json::Value) -> Self {
        Self::new(task_id, TaskState::Completed { result })
    }

    pub fn failed(task_id: TaskId, error: impl Into<String>) -> Self {
        Self::new(
            task_id,
            TaskState::Failed {
                error: error.into(),
            },
        )
    }

    pub fn cancelled(task_id: TaskId) -> Self {
        Self::new(task_id, TaskState::Cancelled)
    }

    pub fn not_found(task_id: TaskId) -> Self {
        Self::new(
            task_id,
            TaskState::NotFound {
                error: TASK_NOT_FOUND.to_string(),
            },
        )
    }

    pub fn tag(&self) -> StatusTag {
        self.state.tag()
    }
}
