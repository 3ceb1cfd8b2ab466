use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use ingestq_core::{Clock, JobId, ResourceId, SystemClock, WorkerId};

use super::notify::JobNotifier;
use super::resource::ResourceIngestion;
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{
    Completion, IngestResult, Job, JobStatus, RetryOutcome, RetryPolicy, lease_cutoff,
};

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    by_resource: HashMap<ResourceId, JobId>,
    resources: HashMap<ResourceId, ResourceIngestion>,
}

impl QueueState {
    fn resource_mut(
        &mut self,
        resource_id: ResourceId,
        now: DateTime<Utc>,
    ) -> &mut ResourceIngestion {
        self.resources
            .entry(resource_id)
            .or_insert_with(|| ResourceIngestion::pending(resource_id, now))
    }
}

/// In-memory job store.
///
/// Intended for tests/dev and single-process deployments. Every operation runs
/// inside one critical section, which gives the same atomicity the Postgres
/// store gets from row locks.
pub struct InMemoryJobStore {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    notifier: JobNotifier,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
            notifier: JobNotifier::new(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::StorageUnavailable("job store lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, resource_id: ResourceId) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let existing = state.by_resource.get(&resource_id).copied();
        let (job, changed) = match existing {
            Some(job_id) => {
                let job = state
                    .jobs
                    .get_mut(&job_id)
                    .ok_or(JobStoreError::NotFound(job_id))?;
                if job.status.is_terminal() {
                    job.reset(now);
                    (job.clone(), true)
                } else {
                    (job.clone(), false)
                }
            }
            None => {
                let job = Job::new(resource_id, now);
                state.by_resource.insert(resource_id, job.id);
                state.jobs.insert(job.id, job.clone());
                (job, true)
            }
        };

        if changed {
            state.resource_mut(resource_id, now).mark_pending(now);
        }
        drop(guard);

        if changed {
            debug!(job_id = %job.id, resource_id = %resource_id, "job enqueued");
            self.notifier.notify();
        } else {
            debug!(
                job_id = %job.id,
                status = %job.status,
                "job already in flight; enqueue ignored"
            );
        }

        Ok(job)
    }

    async fn claim(&self, worker_id: &WorkerId) -> Result<Option<Job>, JobStoreError> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let next = state
            .jobs
            .values()
            .filter(|j| j.is_eligible(now))
            .min_by_key(|j| (j.next_run_at, j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        job.mark_claimed(worker_id.clone(), now);
        let claimed = job.clone();
        state.resource_mut(claimed.resource_id, now).mark_processing(now);

        debug!(
            job_id = %claimed.id,
            worker_id = %worker_id,
            attempts = claimed.attempts,
            "job claimed"
        );
        Ok(Some(claimed))
    }

    async fn complete(
        &self,
        job_id: JobId,
        result: IngestResult,
    ) -> Result<Completion, JobStoreError> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "complete on terminal job ignored");
            return Ok(Completion::AlreadyTerminal(job.clone()));
        }
        if job.status != JobStatus::Processing {
            debug!(job_id = %job_id, status = %job.status, "complete on unclaimed job ignored");
            return Ok(Completion::NotClaimed(job.clone()));
        }

        job.mark_completed(now);
        let job = job.clone();
        state.resource_mut(job.resource_id, now).mark_completed(result, now);

        debug!(job_id = %job_id, resource_id = %job.resource_id, "job completed");
        Ok(Completion::Completed(job))
    }

    async fn retry(&self, job_id: JobId, error: &str) -> Result<RetryOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "retry on terminal job ignored");
            return Ok(RetryOutcome::AlreadyTerminal(job.clone()));
        }
        if job.status != JobStatus::Processing {
            debug!(job_id = %job_id, status = %job.status, "retry on unclaimed job ignored");
            return Ok(RetryOutcome::NotClaimed(job.clone()));
        }

        let status = job.record_failure(error, &self.policy, now);
        let job = job.clone();
        let resource = state.resource_mut(job.resource_id, now);

        if status == JobStatus::Failed {
            resource.mark_failed(job.last_error.clone(), now);
            warn!(
                job_id = %job_id,
                attempts = job.attempts,
                error = %error,
                "job failed permanently"
            );
            Ok(RetryOutcome::Failed(job))
        } else {
            resource.mark_processing(now);
            debug!(
                job_id = %job_id,
                attempts = job.attempts,
                next_run_at = %job.next_run_at,
                "job scheduled for retry"
            );
            Ok(RetryOutcome::Scheduled(job))
        }
    }

    async fn reclaim_expired_leases(
        &self,
        lease_ttl: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        let now = self.clock.now();
        let Some(cutoff) = lease_cutoff(now, lease_ttl) else {
            return Ok(Vec::new());
        };

        let mut reclaimed = Vec::new();
        {
            let mut state = self.lock()?;
            for job in state.jobs.values_mut().filter(|j| j.is_lease_expired(cutoff)) {
                job.release_expired_lease(now);
                reclaimed.push(job.clone());
            }
        }

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "expired job leases reclaimed");
            self.notifier.notify();
        }
        Ok(reclaimed)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn find_by_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<Job>, JobStoreError> {
        let state = self.lock()?;
        Ok(state
            .by_resource
            .get(&resource_id)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn resource_ingestion(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceIngestion>, JobStoreError> {
        Ok(self.lock()?.resources.get(&resource_id).cloned())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.lock()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }

    fn notifier(&self) -> Option<JobNotifier> {
        Some(self.notifier.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::resource::IngestionStatus;
    use ingestq_core::ManualClock;

    fn test_worker(name: &str) -> WorkerId {
        WorkerId::new(name).unwrap()
    }

    fn store_with_clock() -> (InMemoryJobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryJobStore::new().with_clock(clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let (store, _clock) = store_with_clock();
        let resource = ResourceId::new();

        let job = store.enqueue(resource).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);

        let claimed = store.claim(&test_worker("w1")).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.locked_by(), Some(&test_worker("w1")));

        // No more jobs
        assert!(store.claim(&test_worker("w2")).await.unwrap().is_none());

        let ingestion = store.resource_ingestion(resource).await.unwrap().unwrap();
        assert_eq!(ingestion.status, IngestionStatus::Processing);
    }

    #[tokio::test]
    async fn enqueue_leaves_in_flight_job_untouched() {
        let (store, clock) = store_with_clock();
        let resource = ResourceId::new();

        let job = store.enqueue(resource).await.unwrap();
        store.claim(&test_worker("w1")).await.unwrap().unwrap();
        store.retry(job.id, "timeout").await.unwrap();
        clock.advance(chrono::Duration::seconds(5));

        let again = store.enqueue(resource).await.unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.status, JobStatus::Retry);
        assert_eq!(again.attempts, 1);
        assert_eq!(again.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn claim_prefers_oldest_next_run_at() {
        let (store, clock) = store_with_clock();

        let first = store.enqueue(ResourceId::new()).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let second = store.enqueue(ResourceId::new()).await.unwrap();

        // Fail the first job so it is rescheduled behind the second.
        store.claim(&test_worker("w1")).await.unwrap().unwrap();
        store.retry(first.id, "flaky").await.unwrap();

        let claimed = store.claim(&test_worker("w2")).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        clock.advance(chrono::Duration::seconds(61));
        let claimed = store.claim(&test_worker("w3")).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn complete_and_retry_report_missing_jobs() {
        let store = InMemoryJobStore::new();
        let missing = JobId::new();

        assert!(matches!(
            store.complete(missing, IngestResult::default()).await,
            Err(JobStoreError::NotFound(id)) if id == missing
        ));
        assert!(matches!(
            store.retry(missing, "boom").await,
            Err(JobStoreError::NotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn retry_on_completed_job_is_a_no_op() {
        let (store, _clock) = store_with_clock();
        let job = store.enqueue(ResourceId::new()).await.unwrap();
        store.claim(&test_worker("w1")).await.unwrap();
        store.complete(job.id, IngestResult::default()).await.unwrap();

        let outcome = store.retry(job.id, "late failure").await.unwrap();
        assert!(matches!(outcome, RetryOutcome::AlreadyTerminal(_)));

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn unclaimed_jobs_ignore_complete_and_retry() {
        let (store, _clock) = store_with_clock();
        let resource = ResourceId::new();
        let job = store.enqueue(resource).await.unwrap();

        let outcome = store.retry(job.id, "stray failure").await.unwrap();
        assert!(matches!(outcome, RetryOutcome::NotClaimed(_)));
        assert!(!outcome.is_applied());

        let completion = store.complete(job.id, IngestResult::default()).await.unwrap();
        assert!(matches!(completion, Completion::NotClaimed(_)));
        assert!(!completion.is_applied());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored, job);
        let ingestion = store.resource_ingestion(resource).await.unwrap().unwrap();
        assert_eq!(ingestion.status, IngestionStatus::Pending);
    }

    #[tokio::test]
    async fn redelivered_retry_does_not_charge_another_attempt() {
        let (store, clock) = store_with_clock();
        let job = store.enqueue(ResourceId::new()).await.unwrap();
        store.claim(&test_worker("w1")).await.unwrap().unwrap();

        let first = store.retry(job.id, "timeout").await.unwrap();
        let RetryOutcome::Scheduled(scheduled) = first else {
            panic!("expected scheduled retry, got {first:?}");
        };
        assert_eq!(scheduled.attempts, 1);

        clock.advance(chrono::Duration::seconds(5));
        let again = store.retry(job.id, "timeout").await.unwrap();
        assert!(matches!(again, RetryOutcome::NotClaimed(ref j) if j == &scheduled));

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.next_run_at, scheduled.next_run_at);
    }

    #[tokio::test]
    async fn reclaim_expired_leases_only_touches_stale_leases() {
        let (store, clock) = store_with_clock();
        let ttl = Duration::from_secs(600);

        let stale = store.enqueue(ResourceId::new()).await.unwrap();
        store.claim(&test_worker("crashed")).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(500));
        let fresh = store.enqueue(ResourceId::new()).await.unwrap();
        store.claim(&test_worker("alive")).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(200));
        let reclaimed = store.reclaim_expired_leases(ttl).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, stale.id);
        assert_eq!(reclaimed[0].status, JobStatus::Retry);
        assert_eq!(reclaimed[0].attempts, 0);

        let fresh = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, JobStatus::Processing);

        let again = store.claim(&test_worker("rescuer")).await.unwrap().unwrap();
        assert_eq!(again.id, stale.id);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let (store, _clock) = store_with_clock();

        for _ in 0..5 {
            store.enqueue(ResourceId::new()).await.unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 5);

        let a = store.claim(&test_worker("w1")).await.unwrap().unwrap();
        let b = store.claim(&test_worker("w2")).await.unwrap().unwrap();
        store.complete(a.id, IngestResult::default()).await.unwrap();
        store.retry(b.id, "boom").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.retry, 1);
        assert_eq!(stats.total(), 5);
    }

    #[tokio::test]
    async fn enqueue_signals_the_notifier() {
        let store = InMemoryJobStore::new();
        let notifier = store.notifier().unwrap();

        store.enqueue(ResourceId::new()).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_millis(100), notifier.notified())
            .await
            .expect("enqueue should leave a wake-up permit");
    }
}
