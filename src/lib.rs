//! Detection task queue
//!
//! Routes long-running Grounding DINO detection jobs through a durable,
//! priority-aware broker. A submitter seeds an in-memory status record and
//! publishes the job, a single consumer loop runs the model one message at a
//! time, and callers poll status, cancel, or inspect the queue by task id.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
