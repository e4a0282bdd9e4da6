//! Test helpers: scripted detection models and a consumer harness wired to
//! the in-memory broker.

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

use detection_queue::models::status::TaskStatus;
use detection_queue::models::task::{ImageSource, TaskId};
use detection_queue::services::broker::InMemoryBroker;
use detection_queue::services::consumer::{ConsumerConfig, ConsumerHandle, TaskConsumer};
use detection_queue::services::model::{
    DetectionModel, DetectionOutcome, DetectionRequest, ModelError, ModelLoader, ModelProvider,
};
use detection_queue::services::store::{InMemoryTaskStore, TaskStore};
use detection_queue::services::submitter::{SubmitRequest, TaskSubmitter};

type Script = Box<dyn Fn(&DetectionRequest) -> Result<DetectionOutcome, ModelError> + Send + Sync>;

/// Detection model that answers from a closure and records every call.
pub struct ScriptedModel {
    script: Script,
    calls: Mutex<Vec<DetectionRequest>>,
    started: AtomicUsize,
    /// When set, the first call waits for a notification before answering.
    gate: Option<Arc<Notify>>,
}

impl ScriptedModel {
    pub fn new(
        script: impl Fn(&DetectionRequest) -> Result<DetectionOutcome, ModelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Always succeeds, echoing the queries back as the result.
    pub fn echo() -> Self {
        Self::new(|req| {
            Ok(DetectionOutcome::succeeded(serde_json::json!({
                "success": true,
                "queries": req.text_queries.as_slice(),
            })))
        })
    }

    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<DetectionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionModel for ScriptedModel {
    async fn process(&self, request: DetectionRequest) -> Result<DetectionOutcome, ModelError> {
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        if let (Some(gate), 0) = (&self.gate, n) {
            gate.notified().await;
        }
        self.calls.lock().unwrap().push(request.clone());
        (self.script)(&request)
    }
}

/// Loader that never succeeds.
pub struct BrokenLoader;

#[async_trait]
impl ModelLoader for BrokenLoader {
    async fn load(&self) -> Result<Arc<dyn DetectionModel>, ModelError> {
        Err(ModelError::Init("weights not found".into()))
    }
}

pub struct Harness {
    pub store: Arc<InMemoryTaskStore>,
    pub broker: Arc<InMemoryBroker>,
    pub submitter: TaskSubmitter,
    pub models: Arc<ModelProvider>,
}

impl Harness {
    pub fn new(models: ModelProvider) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let submitter = TaskSubmitter::new(store.clone(), broker.clone());
        Self {
            store,
            broker,
            submitter,
            models: Arc::new(models),
        }
    }

    pub fn with_model(model: Arc<ScriptedModel>) -> Self {
        Self::new(ModelProvider::ready(model))
    }

    pub fn start_consumer(&self) -> ConsumerHandle {
        let config = ConsumerConfig {
            worker_name: "test-consumer".to_string(),
            poll_interval: Duration::from_millis(10),
            reconnect_backoff_max: Duration::from_millis(20),
        };
        TaskConsumer::new(
            self.broker.clone(),
            self.store.clone(),
            self.models.clone(),
            config,
        )
        .spawn()
    }

    pub async fn submit_url(&self, url: &str, query: &str, priority: u8) -> TaskId {
        self.submitter
            .submit(request(ImageSource::Url(url.to_string()), query, priority))
            .await
            .expect("submit failed")
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.store.get(task_id)
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait_terminal(&self, task_id: &TaskId) -> TaskStatus {
        eventually(|| async {
            self.status(task_id)
                .map(|s| s.state.is_terminal())
                .unwrap_or(false)
        })
        .await;
        self.status(task_id).unwrap()
    }
}

pub fn request(image: ImageSource, query: &str, priority: u8) -> SubmitRequest {
    SubmitRequest {
        image,
        text_queries: query.into(),
        box_threshold: 0.4,
        text_threshold: 0.3,
        return_visualization: false,
        priority,
    }
}

/// Poll `check` every 10ms until it returns true, failing after 5 seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5 seconds");
}
