pub mod broker;
pub mod consumer;
pub mod detector;
pub mod model;
pub mod status;
pub mod store;
pub mod submitter;
