use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::models::task::{ImageSource, TextQueries};

/// Inputs for one detection call.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub image: ImageSource,
    pub text_queries: TextQueries,
    pub box_threshold: f64,
    pub text_threshold: f64,
    pub return_visualization: bool,
}

/// What the detection backend reports. `success == false` is a structured,
/// model-level failure, as opposed to a [`ModelError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutcome {
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DetectionOutcome {
    pub fn succeeded(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// The heavyweight detection model. Not assumed to be safe for concurrent
/// calls; the consumer loop only ever has one call in flight.
#[async_trait]
pub trait DetectionModel: Send + Sync {
    async fn process(&self, request: DetectionRequest) -> Result<DetectionOutcome, ModelError>;
}

/// Builds the model. Called at most once per successful initialization.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn DetectionModel>, ModelError>;
}

/// Lazily-initialized, memoized model handle.
///
/// The first successful [`ModelProvider::get`] caches the model for the rest
/// of the process lifetime. A failed load is not cached, so the next caller
/// retries it.
pub struct ModelProvider {
    loader: Arc<dyn ModelLoader>,
    model: OnceCell<Arc<dyn DetectionModel>>,
}

impl ModelProvider {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            model: OnceCell::new(),
        }
    }

    /// Wrap an already-built model.
    pub fn ready(model: Arc<dyn DetectionModel>) -> Self {
        Self {
            loader: Arc::new(Preloaded(Arc::clone(&model))),
            model: OnceCell::new_with(Some(model)),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn DetectionModel>, ModelError> {
        self.model
            .get_or_try_init(|| async {
                tracing::info!("Loading detection model");
                let model = self.loader.load().await?;
                tracing::info!("Detection model loaded");
                Ok::<_, ModelError>(model)
            })
            .await
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }
}

struct Preloaded(Arc<dyn DetectionModel>);

#[async_trait]
impl ModelLoader for Preloaded {
    async fn load(&self) -> Result<Arc<dyn DetectionModel>, ModelError> {
        Ok(Arc::clone(&self.0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model initialization failed: {0}")]
    Init(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Detection backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Malformed detection response: {0}")]
    Parse(#[from] serde_json::Error),
}
