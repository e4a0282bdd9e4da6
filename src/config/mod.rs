use serde::Deserialize;
use std::time::Duration;

use crate::services::consumer::ConsumerConfig;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the task broker
    pub redis_url: String,

    /// Durable task queue name
    #[serde(default = "default_task_queue")]
    pub task_queue: String,

    /// Result queue name (declared, not consumed)
    #[serde(default = "default_result_queue")]
    pub result_queue: String,

    /// Base URL of the Grounding DINO detection backend
    pub detector_url: String,

    /// Run the consumer loop inside this process
    #[serde(default = "default_true")]
    pub consumer_enabled: bool,

    /// Name reported in the queue status worker list
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// Idle poll interval for the consumer, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Cap for the broker reconnect backoff, in seconds
    #[serde(default = "default_reconnect_backoff_max_secs")]
    pub reconnect_backoff_max_secs: u64,

    /// Maximum accepted request body size
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_task_queue() -> String {
    "detection_tasks".to_string()
}

fn default_result_queue() -> String {
    "detection_results".to_string()
}

fn default_true() -> bool {
    true
}

fn default_worker_name() -> String {
    "consumer-1".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_reconnect_backoff_max_secs() -> u64 {
    30
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            worker_name: self.worker_name.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reconnect_backoff_max: Duration::from_secs(self.reconnect_backoff_max_secs),
        }
    }

    /// Worker names shown by the queue status endpoint.
    pub fn workers(&self) -> Vec<String> {
        if self.consumer_enabled {
            vec![self.worker_name.clone()]
        } else {
            Vec::new()
        }
    }
}
