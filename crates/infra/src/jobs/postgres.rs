//! Postgres-backed job store implementation.
//!
//! All scheduling decisions use the store's [`Clock`], bound as a query
//! parameter, so the database and the in-memory store agree on "now".
//!
//! ## Concurrency
//!
//! - `enqueue` is one `INSERT ... ON CONFLICT (resource_id) DO UPDATE ... WHERE
//!   status IN ('completed', 'failed')`, so concurrent callers converge on one
//!   row and never reset an in-flight job.
//! - `claim` selects its candidate with `FOR UPDATE SKIP LOCKED`: a row being
//!   claimed by another transaction is skipped, not waited on.
//! - `complete` and `retry` lock the single row with `SELECT ... FOR UPDATE`
//!   and apply the shared transitions from [`Job`]. Only a `processing` row
//!   changes; anything else is reported back untouched.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls`, `WorkerCrashed` | `StorageUnavailable` |
//! | `ColumnDecode`, `Decode`, `ColumnNotFound` | `InvalidRecord` |
//! | anything else | `Database` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use ingestq_core::{Clock, JobId, ResourceId, SystemClock, WorkerId};

use super::notify::{JobNotifier, PgJobListener};
use super::resource::ResourceIngestion;
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{
    Completion, IngestResult, Job, JobStatus, LAST_ERROR_MAX_CHARS, Lease, RetryOutcome,
    RetryPolicy, lease_cutoff, truncate_error,
};

/// Schema applied by [`PostgresJobStore::ensure_schema`].
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_ingest_jobs.sql");

/// Advisory lock key guarding schema creation.
const SCHEMA_LOCK_KEY: i64 = 0x696e_6765_7374_71;

/// Default `LISTEN/NOTIFY` channel for claimable-job notifications.
pub const DEFAULT_NOTIFY_CHANNEL: &str = "ingest_jobs";

/// Postgres-backed job store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; every mutating
/// operation runs in its own transaction.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    notify_channel: Option<String>,
    notifier: Option<JobNotifier>,
}

impl PostgresJobStore {
    /// Create a store with the system clock and the default retry policy.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            clock: Arc::new(SystemClock),
            policy: RetryPolicy::default(),
            notify_channel: None,
            notifier: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Emit `pg_notify(channel, job_id)` whenever a job becomes claimable.
    pub fn with_notify_channel(mut self, channel: impl Into<String>) -> Self {
        self.notify_channel = Some(channel.into());
        self
    }

    /// Notifier handed to workers; fed by [`PostgresJobStore::spawn_listener`].
    pub fn with_notifier(mut self, notifier: JobNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue tables and indexes if they do not exist.
    ///
    /// Serialized with an advisory lock: concurrent `CREATE TABLE IF NOT EXISTS`
    /// can still collide on the catalog.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        let mut tx = self.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema_lock", e))?;
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    /// Relay `NOTIFY` messages into this store's notifier.
    ///
    /// Returns `None` unless both a notify channel and a notifier are configured.
    pub async fn spawn_listener(&self) -> Result<Option<JoinHandle<()>>, JobStoreError> {
        match (&self.notify_channel, &self.notifier) {
            (Some(channel), Some(notifier)) => {
                let handle = PgJobListener::spawn(&self.pool, channel, notifier.clone()).await?;
                Ok(Some(handle))
            }
            _ => Ok(None),
        }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn notify_claimable(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<(), JobStoreError> {
        if let Some(channel) = &self.notify_channel {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(channel)
                .bind(job_id.to_string())
                .execute(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("pg_notify", e))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("policy", &self.policy)
            .field("notify_channel", &self.notify_channel)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), fields(resource_id = %resource_id), err)]
    async fn enqueue(&self, resource_id: ResourceId) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let upserted = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO ingest_jobs (
                id,
                resource_id,
                status,
                attempts,
                next_run_at,
                created_at,
                updated_at
            )
            VALUES ($1, $2, 'queued', 0, $3, $3, $3)
            ON CONFLICT (resource_id) DO UPDATE SET
                status = 'queued',
                attempts = 0,
                next_run_at = EXCLUDED.next_run_at,
                locked_by = NULL,
                locked_at = NULL,
                last_error = NULL,
                updated_at = EXCLUDED.updated_at
            WHERE ingest_jobs.status IN ('completed', 'failed')
            RETURNING
                id,
                resource_id,
                status,
                attempts,
                next_run_at,
                locked_by,
                locked_at,
                last_error,
                created_at,
                updated_at
            "#,
        )
        .bind(Uuid::from(JobId::new()))
        .bind(resource_id.as_uuid())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue_upsert", e))?;

        let job = match upserted {
            Some(row) => {
                let job = Job::try_from(row)?;
                update_resource(&mut tx, resource_id, ResourceUpdate::Pending, now).await?;
                self.notify_claimable(&mut tx, job.id).await?;
                debug!(job_id = %job.id, "job enqueued");
                job
            }
            None => {
                let row = sqlx::query_as::<_, JobRow>(
                    r#"
                    SELECT
                        id,
                        resource_id,
                        status,
                        attempts,
                        next_run_at,
                        locked_by,
                        locked_at,
                        last_error,
                        created_at,
                        updated_at
                    FROM ingest_jobs
                    WHERE resource_id = $1
                    "#,
                )
                .bind(resource_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("enqueue_existing", e))?;
                let job = Job::try_from(row)?;
                debug!(
                    job_id = %job.id,
                    status = %job.status,
                    "job already in flight; enqueue ignored"
                );
                job
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn claim(&self, worker_id: &WorkerId) -> Result<Option<Job>, JobStoreError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            WITH candidate AS (
                SELECT id
                FROM ingest_jobs
                WHERE status IN ('queued', 'retry')
                  AND next_run_at <= $2
                ORDER BY next_run_at ASC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ingest_jobs AS j
            SET
                status = 'processing',
                locked_by = $1,
                locked_at = $2,
                updated_at = $2
            FROM candidate
            WHERE j.id = candidate.id
            RETURNING
                j.id,
                j.resource_id,
                j.status,
                j.attempts,
                j.next_run_at,
                j.locked_by,
                j.locked_at,
                j.last_error,
                j.created_at,
                j.updated_at
            "#,
        )
        .bind(worker_id.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let job = Job::try_from(row)?;
        update_resource(&mut tx, job.resource_id, ResourceUpdate::Processing, now).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(job_id = %job.id, attempts = job.attempts, "job claimed");
        Ok(Some(job))
    }

    #[instrument(skip(self, result), fields(job_id = %job_id), err)]
    async fn complete(
        &self,
        job_id: JobId,
        result: IngestResult,
    ) -> Result<Completion, JobStoreError> {
        let now = self.clock.now();
        let payload = serde_json::to_value(&result).map_err(|e| {
            JobStoreError::InvalidRecord(format!("result serialization failed: {e}"))
        })?;

        let mut tx = self.begin().await?;
        let Some(mut job) = lock_job(&mut tx, job_id).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::NotFound(job_id));
        };

        if job.status.is_terminal() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(status = %job.status, "complete on terminal job ignored");
            return Ok(Completion::AlreadyTerminal(job));
        }
        if job.status != JobStatus::Processing {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(status = %job.status, "complete on unclaimed job ignored");
            return Ok(Completion::NotClaimed(job));
        }

        job.mark_completed(now);
        write_job(&mut tx, &job).await?;
        update_resource(
            &mut tx,
            job.resource_id,
            ResourceUpdate::Completed(&payload),
            now,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(resource_id = %job.resource_id, "job completed");
        Ok(Completion::Completed(job))
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn retry(&self, job_id: JobId, error: &str) -> Result<RetryOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut tx = self.begin().await?;

        let Some(mut job) = lock_job(&mut tx, job_id).await? else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::NotFound(job_id));
        };

        if job.status.is_terminal() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(status = %job.status, "retry on terminal job ignored");
            return Ok(RetryOutcome::AlreadyTerminal(job));
        }
        if job.status != JobStatus::Processing {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(status = %job.status, "retry on unclaimed job ignored");
            return Ok(RetryOutcome::NotClaimed(job));
        }

        let status = job.record_failure(error, &self.policy, now);
        write_job(&mut tx, &job).await?;

        let update = if status == JobStatus::Failed {
            ResourceUpdate::Failed(job.last_error.as_deref())
        } else {
            ResourceUpdate::Processing
        };
        update_resource(&mut tx, job.resource_id, update, now).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if status == JobStatus::Failed {
            warn!(attempts = job.attempts, error = %error, "job failed permanently");
            Ok(RetryOutcome::Failed(job))
        } else {
            debug!(
                attempts = job.attempts,
                next_run_at = %job.next_run_at,
                "job scheduled for retry"
            );
            Ok(RetryOutcome::Scheduled(job))
        }
    }

    #[instrument(skip(self), err)]
    async fn reclaim_expired_leases(
        &self,
        lease_ttl: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        let now = self.clock.now();
        let Some(cutoff) = lease_cutoff(now, lease_ttl) else {
            return Ok(Vec::new());
        };

        let mut tx = self.begin().await?;
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE ingest_jobs AS j
            SET
                status = 'retry',
                next_run_at = $1,
                last_error = LEFT('lease expired (held by ' || j.locked_by || ')', $3),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $1
            FROM (
                SELECT id
                FROM ingest_jobs
                WHERE status = 'processing'
                  AND locked_at <= $2
                FOR UPDATE SKIP LOCKED
            ) AS expired
            WHERE j.id = expired.id
            RETURNING
                j.id,
                j.resource_id,
                j.status,
                j.attempts,
                j.next_run_at,
                j.locked_by,
                j.locked_at,
                j.last_error,
                j.created_at,
                j.updated_at
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .bind(LAST_ERROR_MAX_CHARS as i32)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reclaim_expired_leases", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let job = Job::try_from(row)?;
            self.notify_claimable(&mut tx, job.id).await?;
            reclaimed.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "expired job leases reclaimed");
        }
        Ok(reclaimed)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT
                id,
                resource_id,
                status,
                attempts,
                next_run_at,
                locked_by,
                locked_at,
                last_error,
                created_at,
                updated_at
            FROM ingest_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(Job::try_from).transpose()
    }

    async fn find_by_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT
                id,
                resource_id,
                status,
                attempts,
                next_run_at,
                locked_by,
                locked_at,
                last_error,
                created_at,
                updated_at
            FROM ingest_jobs
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_resource", e))?;

        row.map(Job::try_from).transpose()
    }

    async fn resource_ingestion(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceIngestion>, JobStoreError> {
        let row = sqlx::query_as::<_, ResourceIngestionRow>(
            r#"
            SELECT
                resource_id,
                status,
                result,
                error,
                completed_at,
                updated_at
            FROM resource_ingestion
            WHERE resource_id = $1
            "#,
        )
        .bind(resource_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resource_ingestion", e))?;

        row.map(ResourceIngestion::try_from).transpose()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM ingest_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::InvalidRecord(format!("failed to read status: {e}")))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| JobStoreError::InvalidRecord(format!("failed to read count: {e}")))?;
            stats.record(status.parse()?, u64::try_from(total).unwrap_or(0));
        }
        Ok(stats)
    }

    fn notifier(&self) -> Option<JobNotifier> {
        self.notifier.clone()
    }
}

/// Load a job and hold its row lock for the rest of the transaction.
async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
) -> Result<Option<Job>, JobStoreError> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT
            id,
            resource_id,
            status,
            attempts,
            next_run_at,
            locked_by,
            locked_at,
            last_error,
            created_at,
            updated_at
        FROM ingest_jobs
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(job_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?;

    row.map(Job::try_from).transpose()
}

/// Persist every mutable column of `job`.
async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE ingest_jobs
        SET
            status = $2,
            attempts = $3,
            next_run_at = $4,
            locked_by = $5,
            locked_at = $6,
            last_error = $7,
            updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(i32::try_from(job.attempts).unwrap_or(i32::MAX))
    .bind(job.next_run_at)
    .bind(job.locked_by().map(WorkerId::as_str))
    .bind(job.locked_at())
    .bind(job.last_error.as_deref())
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;

    Ok(())
}

/// Resource-side transition applied in the same transaction as the job change.
enum ResourceUpdate<'a> {
    Pending,
    Processing,
    Completed(&'a serde_json::Value),
    Failed(Option<&'a str>),
}

async fn update_resource(
    tx: &mut Transaction<'_, Postgres>,
    resource_id: ResourceId,
    update: ResourceUpdate<'_>,
    now: DateTime<Utc>,
) -> Result<(), JobStoreError> {
    let query = match update {
        ResourceUpdate::Pending => sqlx::query(
            r#"
            INSERT INTO resource_ingestion (resource_id, status, updated_at)
            VALUES ($1, 'pending', $2)
            ON CONFLICT (resource_id) DO UPDATE SET
                status = 'pending',
                error = NULL,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(resource_id.as_uuid())
        .bind(now),
        ResourceUpdate::Processing => sqlx::query(
            r#"
            INSERT INTO resource_ingestion (resource_id, status, updated_at)
            VALUES ($1, 'processing', $2)
            ON CONFLICT (resource_id) DO UPDATE SET
                status = 'processing',
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(resource_id.as_uuid())
        .bind(now),
        ResourceUpdate::Completed(result) => sqlx::query(
            r#"
            INSERT INTO resource_ingestion (resource_id, status, result, completed_at, updated_at)
            VALUES ($1, 'completed', $2, $3, $3)
            ON CONFLICT (resource_id) DO UPDATE SET
                status = 'completed',
                result = EXCLUDED.result,
                error = NULL,
                completed_at = EXCLUDED.completed_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(resource_id.as_uuid())
        .bind(result)
        .bind(now),
        ResourceUpdate::Failed(error) => sqlx::query(
            r#"
            INSERT INTO resource_ingestion (resource_id, status, error, updated_at)
            VALUES ($1, 'failed', $2, $3)
            ON CONFLICT (resource_id) DO UPDATE SET
                status = 'failed',
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(resource_id.as_uuid())
        .bind(error)
        .bind(now),
    };

    query
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_resource", e))?;
    Ok(())
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Database(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
            JobStoreError::StorageUnavailable(format!(
                "connection pool unavailable in {operation}: {err}"
            ))
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            JobStoreError::StorageUnavailable(format!("connection failed in {operation}: {err}"))
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            JobStoreError::InvalidRecord(format!("failed to decode row in {operation}: {err}"))
        }
        _ => JobStoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    resource_id: Uuid,
    status: String,
    attempts: i32,
    next_run_at: DateTime<Utc>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            resource_id: row.try_get("resource_id")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts).map_err(|_| {
            JobStoreError::InvalidRecord(format!("job {} has negative attempts", row.id))
        })?;

        let lease = match (row.locked_by, row.locked_at) {
            (Some(worker_id), Some(locked_at)) => Some(Lease {
                worker_id: WorkerId::new(worker_id)?,
                locked_at,
            }),
            (None, None) => None,
            _ => {
                return Err(JobStoreError::InvalidRecord(format!(
                    "job {} has a half-set lease",
                    row.id
                )));
            }
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            resource_id: ResourceId::from_uuid(row.resource_id),
            status: row.status.parse()?,
            attempts,
            next_run_at: row.next_run_at,
            lease,
            last_error: row.last_error.map(|e| truncate_error(&e)),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct ResourceIngestionRow {
    resource_id: Uuid,
    status: String,
    result: Option<serde_json::Value>,
    error: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ResourceIngestionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ResourceIngestionRow {
            resource_id: row.try_get("resource_id")?,
            status: row.try_get("status")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ResourceIngestionRow> for ResourceIngestion {
    type Error = JobStoreError;

    fn try_from(row: ResourceIngestionRow) -> Result<Self, Self::Error> {
        let result = row
            .result
            .map(serde_json::from_value::<IngestResult>)
            .transpose()
            .map_err(|e| {
                JobStoreError::InvalidRecord(format!(
                    "resource {} has an unreadable result: {e}",
                    row.resource_id
                ))
            })?;

        Ok(ResourceIngestion {
            resource_id: ResourceId::from_uuid(row.resource_id),
            status: row.status.parse()?,
            result,
            error: row.error,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}
