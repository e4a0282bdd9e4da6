use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::models::status::{StatusTag, TaskStatus};
use crate::models::task::TaskId;
use crate::services::broker::{BrokerChannel, BrokerError};
use crate::services::store::TaskStore;

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
}

/// Aggregate view of the queue and the tracked tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub status: String,
    pub active_tasks: usize,
    pub scheduled_tasks: u64,
    pub reserved_tasks: u64,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub workers: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Read side of the task lifecycle plus advisory cancellation.
#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn BrokerChannel>,
    workers: Vec<String>,
}

impl StatusService {
    pub fn new(store: Arc<dyn TaskStore>, broker: Arc<dyn BrokerChannel>, workers: Vec<String>) -> Self {
        Self {
            store,
            broker,
            workers,
        }
    }

    /// Current status, or a `not_found` record for ids never submitted in
    /// this process.
    pub fn get_status(&self, task_id: &TaskId) -> TaskStatus {
        self.store
            .get(task_id)
            .unwrap_or_else(|| TaskStatus::not_found(task_id.clone()))
    }

    /// Mark a known task as cancelled, whatever its current state.
    ///
    /// Advisory only: the queued message is not retracted and a running
    /// detection is not interrupted. If the consumer finishes afterwards its
    /// write replaces this one; the last write wins.
    pub fn cancel(&self, task_id: &TaskId) -> CancelOutcome {
        if self.store.replace_existing(TaskStatus::cancelled(task_id.clone())) {
            tracing::info!(task_id = %task_id, "Task marked as cancelled");
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::NotFound
        }
    }

    /// Queue depth from the broker combined with status counts from the store.
    pub async fn queue_status(&self) -> Result<QueueSnapshot, BrokerError> {
        let scheduled_tasks = self.broker.depth().await?;
        let reserved_tasks = self.broker.unacked().await?;
        metrics::gauge!("detection_queue_depth").set(scheduled_tasks as f64);

        let (mut active, mut completed, mut failed, mut cancelled) = (0, 0, 0, 0);
        self.store.scan(&mut |status| match status.tag() {
            StatusTag::Processing => active += 1,
            StatusTag::Completed => completed += 1,
            StatusTag::Failed => failed += 1,
            StatusTag::Cancelled => cancelled += 1,
            StatusTag::Submitted | StatusTag::NotFound => {}
        });

        Ok(QueueSnapshot {
            status: "ok".to_string(),
            active_tasks: active,
            scheduled_tasks,
            reserved_tasks,
            completed_tasks: completed,
            failed_tasks: failed,
            cancelled_tasks: cancelled,
            workers: self.workers.clone(),
            timestamp: Utc::now(),
        })
    }
}
