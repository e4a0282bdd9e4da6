use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;

use crate::models::task::{ImageSource, TextQueries};
use crate::services::model::{
    DetectionModel, DetectionOutcome, DetectionRequest, ModelError, ModelLoader,
};

/// Client for the Grounding DINO detection backend.
pub struct DetectorClient {
    http: Client,
    base_url: String,
}

#[derive(Serialize)]
struct DetectUrlRequest<'a> {
    image_url: &'a str,
    text_queries: &'a TextQueries,
    box_threshold: f64,
    text_threshold: f64,
    return_visualization: bool,
}

impl DetectorClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// GET /health on the backend; succeeds once the model is being served.
    pub async fn health_check(&self) -> Result<(), ModelError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ModelError::Init(format!(
                "detection backend unhealthy: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn send(&self, request: &DetectionRequest) -> Result<reqwest::Response, ModelError> {
        let response = match &request.image {
            ImageSource::Url(url) => {
                let body = DetectUrlRequest {
                    image_url: url,
                    text_queries: &request.text_queries,
                    box_threshold: request.box_threshold,
                    text_threshold: request.text_threshold,
                    return_visualization: request.return_visualization,
                };
                self.http
                    .post(format!("{}/detect", self.base_url))
                    .json(&body)
                    .send()
                    .await?
            }
            ImageSource::Bytes(bytes) => {
                let form = Form::new()
                    .part("file", Part::bytes(bytes.clone()).file_name("image"))
                    .text("text_queries", request.text_queries.joined())
                    .text("box_threshold", request.box_threshold.to_string())
                    .text("text_threshold", request.text_threshold.to_string())
                    .text(
                        "return_visualization",
                        request.return_visualization.to_string(),
                    );
                self.http
                    .post(format!("{}/detect/upload", self.base_url))
                    .multipart(form)
                    .send()
                    .await?
            }
        };
        Ok(response)
    }
}

/// Interpret a backend response body. A missing `success` field counts as
/// success; the whole body becomes the result.
pub fn outcome_from_response(body: serde_json::Value) -> DetectionOutcome {
    let success = body
        .get("success")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(true);
    if success {
        DetectionOutcome::succeeded(body)
    } else {
        let error = body
            .get("error")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        DetectionOutcome {
            success: false,
            result: None,
            error,
        }
    }
}

#[async_trait]
impl DetectionModel for DetectorClient {
    async fn process(&self, request: DetectionRequest) -> Result<DetectionOutcome, ModelError> {
        let response = self.send(&request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Backend {
                status: status.as_u16(),
                body,
            });
        }
        let body: serde_json::Value = serde_json::from_slice(&response.bytes().await?)?;
        Ok(outcome_from_response(body))
    }
}

/// Loads a [`DetectorClient`] once the backend answers its health probe.
pub struct DetectorLoader {
    base_url: String,
}

impl DetectorLoader {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl ModelLoader for DetectorLoader {
    async fn load(&self) -> Result<Arc<dyn DetectionModel>, ModelError> {
        let client = DetectorClient::new(&self.base_url);
        client.health_check().await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_keeps_whole_body() {
        let body = json!({"success": true, "detections": [{"label": "cat", "score": 0.9}]});
        let outcome = outcome_from_response(body.clone());
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(body));
    }

    #[test]
    fn test_structured_failure() {
        let outcome = outcome_from_response(json!({"success": false, "error": "no objects found"}));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("no objects found"));
        assert!(outcome.result.is_none());
    }

    #[test]
    fn test_missing_success_flag_is_success() {
        assert!(outcome_from_response(json!({"boxes": []})).success);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = DetectorClient::new("http://grounding-dino:8000/");
        assert_eq!(client.base_url, "http://grounding-dino:8000");
    }
}
