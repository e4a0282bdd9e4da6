use std::sync::Arc;

use crate::models::status::TaskStatus;
use crate::models::task::{ImageSource, Task, TaskId, TextQueries};
use crate::services::broker::{BrokerChannel, BrokerError, PublishOptions};
use crate::services::store::TaskStore;

/// Everything needed to queue one detection job.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub image: ImageSource,
    pub text_queries: TextQueries,
    pub box_threshold: f64,
    pub text_threshold: f64,
    pub return_visualization: bool,
    pub priority: u8,
}

/// Producer side: seeds the status record and publishes the task.
#[derive(Clone)]
pub struct TaskSubmitter {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn BrokerChannel>,
}

impl TaskSubmitter {
    pub fn new(store: Arc<dyn TaskStore>, broker: Arc<dyn BrokerChannel>) -> Self {
        Self { store, broker }
    }

    /// Queue a detection task and return its id.
    ///
    /// The `submitted` record is written before publishing, so a caller that
    /// polls right after this returns never sees `not_found`. If publishing
    /// fails the record is flipped to `failed` and the error is returned.
    #[tracing::instrument(skip(self, request), fields(image_type = %request.image.image_type(), priority = request.priority))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId, SubmitError> {
        if request.text_queries.is_blank() {
            return Err(SubmitError::EmptyQueries);
        }

        let task = Task::new(
            &request.image,
            request.text_queries,
            request.box_threshold,
            request.text_threshold,
            request.return_visualization,
            request.priority,
        );
        let body = task.to_body().map_err(SubmitError::Serialize)?;
        let task_id = task.task_id.clone();

        self.store.put(TaskStatus::submitted(task_id.clone()));

        if let Err(e) = self
            .broker
            .publish(&body, PublishOptions::persistent(task.priority))
            .await
        {
            tracing::error!(task_id = %task_id, error = %e, "Failed to publish task");
            self.store.put(TaskStatus::failed(task_id.clone(), e.to_string()));
            metrics::counter!("detection_tasks_failed_total").increment(1);
            return Err(SubmitError::Publish { task_id, source: e });
        }

        metrics::counter!("detection_tasks_submitted_total").increment(1);
        tracing::info!(task_id = %task_id, "Task submitted to queue");
        Ok(task_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("At least one non-empty text query is required")]
    EmptyQueries,

    #[error("Serialization error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to publish task {task_id}: {source}")]
    Publish {
        task_id: TaskId,
        #[source]
        source: BrokerError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::status::TaskState;
    use crate::services::broker::InMemoryBroker;
    use crate::services::store::InMemoryTaskStore;

    fn request(priority: u8) -> SubmitRequest {
        SubmitRequest {
            image: ImageSource::Url("https://example.com/cat.jpg".into()),
            text_queries: "cat".into(),
            box_threshold: 0.4,
            text_threshold: 0.3,
            return_visualization: true,
            priority,
        }
    }

    #[tokio::test]
    async fn test_submit_seeds_status_and_publishes() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let submitter = TaskSubmitter::new(store.clone(), broker.clone());

        let task_id = submitter.submit(request(5)).await.unwrap();
        assert_eq!(store.get(&task_id).unwrap().state, TaskState::Submitted);
        assert_eq!(broker.depth().await.unwrap(), 1);
        assert!(broker.all_persistent().await);

        let delivery = broker.receive().await.unwrap().unwrap();
        let task = Task::from_body(&delivery.body).unwrap();
        assert_eq!(task.task_id, task_id);
        assert_eq!(delivery.priority, 5);
    }

    #[tokio::test]
    async fn test_publish_failure_marks_failed() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        broker.sever().await;
        let submitter = TaskSubmitter::new(store.clone(), broker.clone());

        let err = submitter.submit(request(5)).await.unwrap_err();
        let SubmitError::Publish { task_id, .. } = err else {
            panic!("expected publish error, got {err:?}");
        };
        assert!(matches!(
            store.get(&task_id).unwrap().state,
            TaskState::Failed { .. }
        ));

        broker.restore().await;
        broker.connect().await.unwrap();
        assert_eq!(broker.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blank_queries_rejected_without_side_effects() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let submitter = TaskSubmitter::new(store.clone(), broker.clone());

        let mut req = request(5);
        req.text_queries = TextQueries::Many(vec![]);
        assert!(matches!(
            submitter.submit(req).await,
            Err(SubmitError::EmptyQueries)
        ));
        assert!(store.is_empty());
        assert_eq!(broker.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_task_ids_are_unique() {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let submitter = TaskSubmitter::new(store.clone(), broker);
        let a = submitter.submit(request(1)).await.unwrap();
        let b = submitter.submit(request(1)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }
}
