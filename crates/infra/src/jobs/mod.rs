//! Background ingestion queue: one durable job per resource, claimed by
//! workers with exclusive leases and retried with capped exponential backoff.
//!
//! ## Lifecycle
//!
//! - `enqueue`: new job is `queued`; a `completed`/`failed` job is reset to `queued`
//! - `claim`: due `queued`/`retry` job becomes `processing` under a worker lease
//! - `complete`: `processing` becomes `completed`
//! - `retry`: becomes `retry` with backoff, or `failed` once attempts are exhausted
//!
//! A `processing` job whose lease outlives the TTL is returned to `retry` by
//! the [`LeaseSweeper`].
//!
//! ## Components
//!
//! - `Job`, `JobStatus`, `RetryPolicy`: job record and transitions
//! - `JobStore`: queue operations, with in-memory and Postgres backends
//! - `WorkerPool`: async workers that drive a `JobProcessor`
//! - `LeaseSweeper`: periodic reclaim of abandoned leases

pub mod executor;
pub mod in_memory;
pub mod notify;
pub mod postgres;
pub mod resource;
pub mod store;
pub mod sweeper;
pub mod types;

pub use executor::{
    run_once, CycleOutcome, FnProcessor, JobProcessor, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle, WorkerStats,
};
pub use in_memory::InMemoryJobStore;
pub use notify::{JobNotifier, PgJobListener};
pub use postgres::{PostgresJobStore, DEFAULT_NOTIFY_CHANNEL, SCHEMA_SQL};
pub use resource::{IngestionStatus, ResourceIngestion};
pub use store::{JobStats, JobStore, JobStoreError};
pub use sweeper::{LeaseSweeper, SweeperConfig, SweeperHandle};
pub use types::{
    truncate_error, Completion, IngestResult, Job, JobStatus, Lease, RetryOutcome, RetryPolicy,
    LAST_ERROR_MAX_CHARS,
};
