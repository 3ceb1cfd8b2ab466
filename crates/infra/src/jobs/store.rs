//! Job store abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use ingestq_core::{DomainError, JobId, ResourceId, WorkerId};

use super::notify::JobNotifier;
use super::resource::ResourceIngestion;
use super::types::{Completion, IngestResult, Job, JobStatus, RetryOutcome};

/// Persistent queue of ingestion jobs, one per resource.
///
/// Every mutating operation applies fully or not at all. Implementations must
/// guarantee that concurrent `claim` calls never hand the same job to two
/// workers and that concurrent `enqueue` calls for one resource leave exactly
/// one row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Ensure exactly one active job exists for `resource_id`.
    ///
    /// Inserts a queued job, revives a `completed`/`failed` one, or returns an
    /// in-flight job untouched.
    async fn enqueue(&self, resource_id: ResourceId) -> Result<Job, JobStoreError>;

    /// Lease the eligible job with the oldest `next_run_at` to `worker_id`.
    ///
    /// Returns `None` immediately when nothing is eligible.
    async fn claim(&self, worker_id: &WorkerId) -> Result<Option<Job>, JobStoreError>;

    /// Finish a `processing` job and apply `result` to its resource.
    ///
    /// Terminal and unclaimed jobs are returned unchanged as soft outcomes.
    async fn complete(
        &self,
        job_id: JobId,
        result: IngestResult,
    ) -> Result<Completion, JobStoreError>;

    /// Record a failed attempt on a `processing` job; reschedule with backoff
    /// or fail permanently.
    ///
    /// A repeated call after the job left `processing` charges nothing.
    async fn retry(&self, job_id: JobId, error: &str) -> Result<RetryOutcome, JobStoreError>;

    /// Return `processing` jobs whose lease is older than `lease_ttl` to `retry`.
    async fn reclaim_expired_leases(&self, lease_ttl: Duration) -> Result<Vec<Job>, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn find_by_resource(&self, resource_id: ResourceId) -> Result<Option<Job>, JobStoreError>;

    /// Ingestion indicator of the owning resource.
    async fn resource_ingestion(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceIngestion>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Wake-up signal fired when a job becomes claimable, if the store has one.
    fn notifier(&self) -> Option<JobNotifier> {
        None
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("invalid job record: {0}")]
    InvalidRecord(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        JobStoreError::InvalidRecord(err.to_string())
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub processing: u64,
    pub retry: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Retry => &mut self.retry,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.retry + self.completed + self.failed
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue(&self, resource_id: ResourceId) -> Result<Job, JobStoreError> {
        (**self).enqueue(resource_id).await
    }

    async fn claim(&self, worker_id: &WorkerId) -> Result<Option<Job>, JobStoreError> {
        (**self).claim(worker_id).await
    }

    async fn complete(
        &self,
        job_id: JobId,
        result: IngestResult,
    ) -> Result<Completion, JobStoreError> {
        (**self).complete(job_id, result).await
    }

    async fn retry(&self, job_id: JobId, error: &str) -> Result<RetryOutcome, JobStoreError> {
        (**self).retry(job_id, error).await
    }

    async fn reclaim_expired_leases(&self, lease_ttl: Duration) -> Result<Vec<Job>, JobStoreError> {
        (**self).reclaim_expired_leases(lease_ttl).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn find_by_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).find_by_resource(resource_id).await
    }

    async fn resource_ingestion(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceIngestion>, JobStoreError> {
        (**self).resource_ingestion(resource_id).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }

    fn notifier(&self) -> Option<JobNotifier> {
        (**self).notifier()
    }
}
