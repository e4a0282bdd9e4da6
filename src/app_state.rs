use std::sync::Arc;

use crate::services::{
    broker::BrokerChannel, status::StatusService, store::TaskStore, submitter::TaskSubmitter,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub submitter: TaskSubmitter,
    pub status: StatusService,
    pub broker: Arc<dyn BrokerChannel>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn BrokerChannel>,
        workers: Vec<String>,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            submitter: TaskSubmitter::new(Arc::clone(&store), Arc::clone(&broker)),
            status: StatusService::new(store, Arc::clone(&broker), workers),
            broker,
            max_upload_bytes,
        }
    }
}
