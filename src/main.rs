use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use detection_queue::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        broker::{BrokerChannel, RedisBroker},
        consumer::TaskConsumer,
        detector::DetectorLoader,
        model::ModelProvider,
        store::{InMemoryTaskStore, TaskStore},
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing detection-queue server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "detection_tasks_submitted_total",
        "Total detection tasks published to the queue"
    );
    metrics::describe_counter!(
        "detection_tasks_completed_total",
        "Total detection tasks completed"
    );
    metrics::describe_counter!(
        "detection_tasks_failed_total",
        "Total detection tasks that failed"
    );
    metrics::describe_counter!(
        "detection_messages_rejected_total",
        "Messages rejected without requeue"
    );
    metrics::describe_histogram!(
        "detection_processing_seconds",
        "Time to process a detection task"
    );
    metrics::describe_gauge!(
        "detection_queue_depth",
        "Tasks waiting in the durable task queue"
    );

    // Connect to the Redis broker
    tracing::info!(task_queue = %config.task_queue, "Connecting to Redis broker");
    let broker: Arc<dyn BrokerChannel> = Arc::new(
        RedisBroker::new(&config.redis_url, &config.task_queue, &config.result_queue)
            .expect("Failed to initialize broker"),
    );
    broker.connect().await.expect("Failed to connect to broker");

    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());

    // Start the consumer loop in-process so it shares the status store
    let consumer = if config.consumer_enabled {
        let models = Arc::new(ModelProvider::new(Arc::new(DetectorLoader::new(
            &config.detector_url,
        ))));
        let consumer = TaskConsumer::new(
            Arc::clone(&broker),
            Arc::clone(&store),
            models,
            config.consumer_config(),
        );
        Some(consumer.spawn())
    } else {
        tracing::info!("Consumer disabled, running submission API only");
        None
    };

    let state = AppState::new(store, broker, config.workers(), config.max_upload_bytes);

    let app = routes::router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    if let Some(consumer) = consumer {
        consumer.stop().await;
    }
}
