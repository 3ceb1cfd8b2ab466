//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ingestq_core::{DomainError, JobId, ResourceId, WorkerId};

/// Upper bound on the stored `last_error`, in characters.
pub const LAST_ERROR_MAX_CHARS: usize = 1024;

/// Truncate a failure description to [`LAST_ERROR_MAX_CHARS`] on a char boundary.
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(LAST_ERROR_MAX_CHARS) {
        Some((idx, _)) => error[..idx].to_string(),
        None => error.to_string(),
    }
}

/// Error text recorded when the lease sweep takes a job away from a worker.
pub fn lease_expired_message(worker_id: &WorkerId) -> String {
    format!("lease expired (held by {worker_id})")
}

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Leases acquired at or before the returned instant are expired.
///
/// `None` when the TTL is too large to represent, in which case nothing expires.
pub fn lease_cutoff(now: DateTime<Utc>, lease_ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(lease_ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its first claim
    Queued,
    /// Leased to a worker
    Processing,
    /// Failed at least once, waiting for `next_run_at`
    Retry,
    /// Finished successfully
    Completed,
    /// Exhausted its attempts
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Retry,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Retry => "retry",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses a worker may claim from (subject to `next_run_at`).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retry)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("job status", s))
    }
}

/// Retry policy configuration.
///
/// The delay after the n-th failed attempt is `base_delay * 2^(n-1)`, capped at
/// `max_delay`. Once `attempts >= max_attempts` the job fails permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before the job is marked failed
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Calculate the backoff for a given attempt count (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// True once no further attempts are allowed.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// A worker's hold on a job (`locked_by` + `locked_at`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: WorkerId,
    pub locked_at: DateTime<Utc>,
}

/// One schedulable unit of ingestion work, tied to exactly one resource.
///
/// The transition methods below are shared by every store so the state machine
/// lives in one place; stores are responsible for applying them atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub resource_id: ResourceId,
    pub status: JobStatus,
    /// Failed claim-and-process cycles so far
    pub attempts: u32,
    /// Not claimable before this instant
    pub next_run_at: DateTime<Utc>,
    /// Present only while `status == Processing`
    pub lease: Option<Lease>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a freshly queued job, claimable immediately.
    pub fn new(resource_id: ResourceId, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            resource_id,
            status: JobStatus::Queued,
            attempts: 0,
            next_run_at: now,
            lease: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn locked_by(&self) -> Option<&WorkerId> {
        self.lease.as_ref().map(|l| &l.worker_id)
    }

    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|l| l.locked_at)
    }

    /// Claimable status and due.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_run_at <= now
    }

    /// Processing with a lease acquired at or before `cutoff`.
    pub fn is_lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.locked_at().is_some_and(|locked_at| locked_at <= cutoff)
    }

    /// Revive a terminal job for another round of processing.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.attempts = 0;
        self.next_run_at = now;
        self.lease = None;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Lease the job to `worker_id`.
    pub fn mark_claimed(&mut self, worker_id: WorkerId, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.lease = Some(Lease {
            worker_id,
            locked_at: now,
        });
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.lease = None;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Record a failed attempt: schedule a retry with backoff or fail permanently.
    ///
    /// Returns the resulting status (`Retry` or `Failed`).
    pub fn record_failure(
        &mut self,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> JobStatus {
        self.attempts = self.attempts.saturating_add(1);
        self.status = if policy.is_exhausted(self.attempts) {
            JobStatus::Failed
        } else {
            JobStatus::Retry
        };
        self.next_run_at = add_delay(now, policy.delay_for_attempt(self.attempts));
        self.last_error = Some(truncate_error(error));
        self.lease = None;
        self.updated_at = now;
        self.status
    }

    /// Hand an abandoned job back to the queue without charging an attempt.
    pub fn release_expired_lease(&mut self, now: DateTime<Utc>) {
        if let Some(lease) = self.lease.take() {
            self.last_error = Some(truncate_error(&lease_expired_message(&lease.worker_id)));
        }
        self.status = JobStatus::Retry;
        self.next_run_at = now;
        self.updated_at = now;
    }
}

/// Output of a successful ingestion, applied to the owning resource on completion.
///
/// Known fields are typed; anything else a processor produces goes in `extra`,
/// which is flattened on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl IngestResult {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_canonical_url(mut self, url: impl Into<String>) -> Self {
        self.canonical_url = Some(url.into());
        self
    }

    pub fn with_thumbnail_url(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Outcome of `complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The job transitioned to `completed`.
    Completed(Job),
    /// The job was already `completed` or `failed`; nothing changed.
    AlreadyTerminal(Job),
    /// The job is `queued` or `retry` and no worker holds it; nothing changed.
    NotClaimed(Job),
}

impl Completion {
    pub fn job(&self) -> &Job {
        match self {
            Completion::Completed(job)
            | Completion::AlreadyTerminal(job)
            | Completion::NotClaimed(job) => job,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Completion::Completed(_))
    }
}

/// Outcome of `retry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Rescheduled for `next_run_at`.
    Scheduled(Job),
    /// Attempts exhausted; the job is now `failed`.
    Failed(Job),
    /// The job was already `completed` or `failed`; nothing changed.
    AlreadyTerminal(Job),
    /// The job is `queued` or `retry` and no worker holds it; nothing changed.
    NotClaimed(Job),
}

impl RetryOutcome {
    pub fn job(&self) -> &Job {
        match self {
            RetryOutcome::Scheduled(job)
            | RetryOutcome::Failed(job)
            | RetryOutcome::AlreadyTerminal(job)
            | RetryOutcome::NotClaimed(job) => job,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, RetryOutcome::Scheduled(_) | RetryOutcome::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_worker() -> WorkerId {
        WorkerId::new("worker-1").unwrap()
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(1920));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(3600));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(3600));
    }

    #[test]
    fn exhaustion_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn status_parses_its_own_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn job_lifecycle() {
        let now = Utc::now();
        let mut job = Job::new(ResourceId::new(), now);

        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.is_eligible(now));

        job.mark_claimed(test_worker(), now);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.locked_by(), Some(&test_worker()));
        assert_eq!(job.locked_at(), Some(now));
        assert!(!job.is_eligible(now));

        job.mark_completed(now);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.lease.is_none());
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn job_failure_and_retry() {
        let now = Utc::now();
        let policy = RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let mut job = Job::new(ResourceId::new(), now);

        job.mark_claimed(test_worker(), now);
        assert_eq!(job.record_failure("error 1", &policy, now), JobStatus::Retry);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.next_run_at, now + chrono::Duration::seconds(60));
        assert!(job.lease.is_none());
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(job.next_run_at));

        job.mark_claimed(test_worker(), job.next_run_at);
        assert_eq!(job.record_failure("error 2", &policy, now), JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("error 2"));
    }

    #[test]
    fn reset_clears_progress() {
        let now = Utc::now();
        let mut job = Job::new(ResourceId::new(), now);
        let policy = RetryPolicy::new(1, Duration::from_secs(1), Duration::from_secs(1));
        job.mark_claimed(test_worker(), now);
        job.record_failure("boom", &policy, now);
        assert_eq!(job.status, JobStatus::Failed);

        let later = now + chrono::Duration::minutes(5);
        job.reset(later);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.next_run_at, later);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn expired_lease_is_released_without_charging_an_attempt() {
        let now = Utc::now();
        let mut job = Job::new(ResourceId::new(), now);
        job.mark_claimed(test_worker(), now);

        let cutoff =
            lease_cutoff(now + chrono::Duration::minutes(20), Duration::from_secs(900)).unwrap();
        assert!(job.is_lease_expired(cutoff));
        assert!(!job.is_lease_expired(now - chrono::Duration::seconds(1)));

        job.release_expired_lease(now);
        assert_eq!(job.status, JobStatus::Retry);
        assert_eq!(job.attempts, 0);
        assert!(job.lease.is_none());
        assert_eq!(
            job.last_error.as_deref(),
            Some("lease expired (held by worker-1)")
        );
    }

    #[test]
    fn ingest_result_flattens_extension_fields() {
        let result = IngestResult::default()
            .with_title("Rust 2024")
            .with_extra("reading_minutes", serde_json::json!(7));

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, serde_json::json!({"title": "Rust 2024", "reading_minutes": 7}));

        let back: IngestResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: backoff never decreases and never exceeds the cap.
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_secs in 1u64..600,
            cap_secs in 600u64..10_000,
            attempt in 1u32..64,
        ) {
            let policy = RetryPolicy::new(
                5,
                Duration::from_secs(base_secs),
                Duration::from_secs(cap_secs),
            );
            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);

            prop_assert!(next >= current);
            prop_assert!(next <= policy.max_delay);
            if next < policy.max_delay {
                prop_assert!(next > current);
            }
        }

        /// Property: truncation is bounded and keeps short messages intact.
        #[test]
        fn truncated_errors_are_bounded(msg in ".{0,2048}") {
            let truncated = truncate_error(&msg);
            prop_assert!(truncated.chars().count() <= LAST_ERROR_MAX_CHARS);
            prop_assert!(msg.starts_with(&truncated));
            if msg.chars().count() <= LAST_ERROR_MAX_CHARS {
                prop_assert_eq!(truncated, msg);
            }
        }
    }
}
