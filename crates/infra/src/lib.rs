//! Infrastructure for the ingestion queue: job stores, workers, config.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, QueueConfig};
