//! Single-worker consumer loop: receive one message, run detection, record the
//! outcome, then ack or reject.
//!
//! Prefetch is fixed at one unacknowledged delivery, so the model never sees
//! concurrent calls from this process. Stopping the loop lets the in-flight
//! message finish before the loop exits.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::models::status::{TaskStage, TaskStatus};
use crate::models::task::Task;
use crate::services::broker::{BrokerChannel, BrokerError, Delivery};
use crate::services::model::{DetectionOutcome, DetectionRequest, ModelError, ModelProvider};
use crate::services::store::TaskStore;

/// Outstanding deliveries allowed at once.
pub const PREFETCH: usize = 1;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub worker_name: String,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound for the reconnect backoff.
    pub reconnect_backoff_max: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            worker_name: "consumer-1".to_string(),
            poll_interval: Duration::from_millis(1000),
            reconnect_backoff_max: Duration::from_secs(30),
        }
    }
}

/// Exponential reconnect delay (1s, 2s, 4s, ...) capped at `max`.
pub(crate) fn reconnect_backoff(attempt: u32, max: Duration) -> Duration {
    Duration::from_secs(2_u64.saturating_pow(attempt.min(32))).min(max)
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Negative-acknowledge without requeue.
    Reject,
}

/// Failures while running a decoded task.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Image payload is not valid base64: {0}")]
    ImageDecode(#[from] base64::DecodeError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Detection panicked: {0}")]
    Panicked(String),
}

/// Result of handling one delivery.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Body could not be decoded into a task. No status was written.
    Undecodable(serde_json::Error),
    Completed,
    /// The model reported `success: false`.
    ModelFailed(String),
    /// Unexpected failure during decode or inference.
    Errored(ProcessError),
}

impl TaskOutcome {
    /// Model-level failures are acknowledged: the input was valid and a retry
    /// would fail the same way. Everything else that failed is rejected
    /// without requeue so a poison message cannot loop forever.
    pub fn disposition(&self) -> Disposition {
        match self {
            TaskOutcome::Completed | TaskOutcome::ModelFailed(_) => Disposition::Ack,
            TaskOutcome::Undecodable(_) | TaskOutcome::Errored(_) => Disposition::Reject,
        }
    }
}

pub struct TaskConsumer {
    broker: Arc<dyn BrokerChannel>,
    store: Arc<dyn TaskStore>,
    models: Arc<ModelProvider>,
    config: ConsumerConfig,
}

/// Running consumer loop. Dropping the handle closes the shutdown channel,
/// which stops the loop like [`ConsumerHandle::stop`] but without waiting
/// for it to finish.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Signal the loop to stop and wait for the in-flight message to settle.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Consumer task terminated abnormally");
        }
    }
}

impl TaskConsumer {
    pub fn new(
        broker: Arc<dyn BrokerChannel>,
        store: Arc<dyn TaskStore>,
        models: Arc<ModelProvider>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            models,
            config,
        }
    }

    /// Run the loop on a background task.
    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(rx).await });
        ConsumerHandle { shutdown, join }
    }

    /// Consume until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.config.worker_name, "Starting detection consumer");
        self.warm_up().await;

        if !self.reconnect(&mut shutdown).await {
            return;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.broker.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    if !self.dispatch(delivery, &mut shutdown).await {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::trace!("No tasks available, sleeping");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) if e.is_transport() => {
                    tracing::warn!(error = %e, "Broker connection lost while receiving");
                    if !self.reconnect(&mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to receive from task queue, will retry");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!(worker = %self.config.worker_name, "Detection consumer stopped");
    }

    /// Load the model before consuming. A failure is only logged; the next
    /// task retries the load.
    async fn warm_up(&self) {
        if let Err(e) = self.models.get().await {
            tracing::warn!(error = %e, "Model warm-up failed, will retry on first task");
        }
    }

    /// Connect (or reconnect) with backoff until it succeeds. Returns false
    /// if shutdown was requested first.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt = 0;
        loop {
            let connected = match self.broker.connect().await {
                Ok(()) => self.broker.qos(PREFETCH).await,
                Err(e) => Err(e),
            };
            match connected {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!(attempts = attempt + 1, "Reconnected to broker");
                    }
                    return true;
                }
                Err(e) => {
                    let delay = reconnect_backoff(attempt, self.config.reconnect_backoff_max);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Broker connection failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = shutdown.changed() => return false,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Handle one delivery and settle it. Returns false if shutdown was
    /// requested while reconnecting.
    async fn dispatch(&self, delivery: Delivery, shutdown: &mut watch::Receiver<bool>) -> bool {
        let outcome = self.handle(&delivery).await;
        let settled = match outcome.disposition() {
            Disposition::Ack => self.broker.ack(&delivery).await,
            Disposition::Reject => {
                metrics::counter!("detection_messages_rejected_total").increment(1);
                self.broker.nack(&delivery, false).await
            }
        };

        match settled {
            Ok(()) => true,
            Err(e) if e.is_transport() => {
                tracing::warn!(
                    error = %e,
                    "Broker connection lost before settling delivery, it will be redelivered"
                );
                self.reconnect(shutdown).await
            }
            Err(BrokerError::UnknownDelivery(tag)) => {
                tracing::warn!(tag = %tag, "Delivery was already settled or recovered");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to settle delivery");
                true
            }
        }
    }

    /// Decode and run one delivery, writing every status transition.
    pub async fn handle(&self, delivery: &Delivery) -> TaskOutcome {
        let task = match Task::from_body(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    body_len = delivery.body.len(),
                    "Discarding undecodable message"
                );
                return TaskOutcome::Undecodable(e);
            }
        };

        tracing::info!(
            task_id = %task.task_id,
            priority = task.priority,
            redelivered = delivery.redelivered,
            "Processing task"
        );

        let start = Instant::now();
        let outcome = match self.execute(&task).await {
            Ok(DetectionOutcome {
                success: true,
                result,
                ..
            }) => {
                self.store.put(TaskStatus::completed(
                    task.task_id.clone(),
                    result.unwrap_or(serde_json::Value::Null),
                ));
                metrics::counter!("detection_tasks_completed_total").increment(1);
                tracing::info!(task_id = %task.task_id, "Task completed successfully");
                TaskOutcome::Completed
            }
            Ok(DetectionOutcome { error, .. }) => {
                let error = error.unwrap_or_else(|| "Unknown error".to_string());
                self.store
                    .put(TaskStatus::failed(task.task_id.clone(), error.clone()));
                metrics::counter!("detection_tasks_failed_total").increment(1);
                tracing::error!(task_id = %task.task_id, error = %error, "Task failed");
                TaskOutcome::ModelFailed(error)
            }
            Err(e) => {
                self.store
                    .put(TaskStatus::failed(task.task_id.clone(), e.to_string()));
                metrics::counter!("detection_tasks_failed_total").increment(1);
                tracing::error!(task_id = %task.task_id, error = %e, "Task failed with error");
                TaskOutcome::Errored(e)
            }
        };
        metrics::histogram!("detection_processing_seconds").record(start.elapsed().as_secs_f64());
        outcome
    }

    async fn execute(&self, task: &Task) -> Result<DetectionOutcome, ProcessError> {
        self.store.put(TaskStatus::processing(
            task.task_id.clone(),
            TaskStage::LoadingModel,
        ));
        let model = self.models.get().await?;

        self.store.put(TaskStatus::processing(
            task.task_id.clone(),
            TaskStage::ProcessingImage,
        ));
        let request = DetectionRequest {
            image: task.image_source()?,
            text_queries: task.text_queries.clone(),
            box_threshold: task.box_threshold,
            text_threshold: task.text_threshold,
            return_visualization: task.return_visualization,
        };

        // Run on its own task so a panic inside the model is contained.
        match tokio::spawn(async move { model.process(request).await }).await {
            Ok(result) => Ok(result?),
            Err(join) if join.is_panic() => {
                let payload = join.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ProcessError::Panicked(message))
            }
            Err(join) => Err(ProcessError::Panicked(join.to_string())),
        }
    }
}
