//! Worker pool that drains the queue through a [`JobProcessor`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ingestq_core::{DomainError, DomainResult, WorkerId};

use super::notify::JobNotifier;
use super::store::{JobStore, JobStoreError};
use super::types::{Completion, IngestResult, Job, RetryOutcome};

/// Performs the ingestion work for one claimed job.
///
/// An `Err` is recorded through `retry`; its full context chain becomes the
/// job's `last_error`. A panic is caught and recorded the same way.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<IngestResult>;
}

#[async_trait]
impl<P> JobProcessor for Arc<P>
where
    P: JobProcessor + ?Sized,
{
    async fn process(&self, job: &Job) -> anyhow::Result<IngestResult> {
        (**self).process(job).await
    }
}

/// Adapts a synchronous closure into a [`JobProcessor`].
#[derive(Clone)]
pub struct FnProcessor<F>(pub F);

#[async_trait]
impl<F> JobProcessor for FnProcessor<F>
where
    F: Fn(&Job) -> anyhow::Result<IngestResult> + Send + Sync,
{
    async fn process(&self, job: &Job) -> anyhow::Result<IngestResult> {
        (self.0)(job)
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Prefix for worker ids (`{name}-{index}`) and log fields
    pub name: String,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Idle wait when nothing is claimable
    pub poll_interval: Duration,
    /// Wait after a store error before claiming again
    pub error_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "ingest-worker".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    fn worker_id(&self, index: usize) -> DomainResult<WorkerId> {
        WorkerId::new(format!("{}-{}", self.name, index))
    }
}

/// What one claim/process/record cycle did.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(Job),
    /// Failed attempt rescheduled with backoff
    Retried(Job),
    /// Failed attempt that exhausted the retry budget
    Failed(Job),
    /// The job was terminal or no longer claimed when the outcome was recorded
    Stale(Job),
}

impl CycleOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CycleOutcome::Completed(job)
            | CycleOutcome::Retried(job)
            | CycleOutcome::Failed(job)
            | CycleOutcome::Stale(job) => job,
        }
    }
}

/// Claim one job for `worker_id`, process it, and record the outcome.
///
/// Returns `Ok(None)` when nothing was claimable. Processor failures are not
/// errors here; they end up in the outcome.
pub async fn run_once<S, P>(
    store: &S,
    processor: &P,
    worker_id: &WorkerId,
) -> Result<Option<CycleOutcome>, JobStoreError>
where
    S: JobStore + ?Sized,
    P: JobProcessor + ?Sized,
{
    let Some(job) = store.claim(worker_id).await? else {
        return Ok(None);
    };

    debug!(
        worker_id = %worker_id,
        job_id = %job.id,
        resource_id = %job.resource_id,
        attempts = job.attempts,
        "claimed job"
    );

    let processed = AssertUnwindSafe(processor.process(&job))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(&*panic);
            error!(
                worker_id = %worker_id,
                job_id = %job.id,
                panic = %message,
                "job processor panicked"
            );
            Err(anyhow!("processor panicked: {message}"))
        });

    let outcome = match processed {
        Ok(result) => match store.complete(job.id, result).await? {
            Completion::Completed(job) => CycleOutcome::Completed(job),
            Completion::AlreadyTerminal(job) | Completion::NotClaimed(job) => {
                CycleOutcome::Stale(job)
            }
        },
        Err(err) => {
            let message = format!("{err:#}");
            debug!(job_id = %job.id, error = %message, "job processing failed");
            match store.retry(job.id, &message).await? {
                RetryOutcome::Scheduled(job) => CycleOutcome::Retried(job),
                RetryOutcome::Failed(job) => CycleOutcome::Failed(job),
                RetryOutcome::AlreadyTerminal(job) | RetryOutcome::NotClaimed(job) => {
                    CycleOutcome::Stale(job)
                }
            }
        }
    };

    Ok(Some(outcome))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Worker pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_stale: u64,
    pub store_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
    store_errors: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &CycleOutcome) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
        let slot = match outcome {
            CycleOutcome::Completed(_) => &self.completed,
            CycleOutcome::Retried(_) => &self.retried,
            CycleOutcome::Failed(_) => &self.failed,
            CycleOutcome::Stale(_) => &self.stale,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_claimed: self.claimed.load(Ordering::Relaxed),
            jobs_completed: self.completed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_stale: self.stale.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle to control a running worker pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for in-flight jobs to be recorded.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        self.counters.snapshot()
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Fixed-size pool of async workers sharing one store.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.concurrency` workers on the current tokio runtime.
    ///
    /// Workers wake on the store's notifier when it has one and otherwise poll
    /// every `config.poll_interval`.
    pub fn spawn<S, P>(
        store: S,
        processor: P,
        config: WorkerPoolConfig,
    ) -> DomainResult<WorkerPoolHandle>
    where
        S: JobStore + Clone + 'static,
        P: JobProcessor + Clone + 'static,
    {
        if config.concurrency == 0 {
            return Err(DomainError::validation(
                "worker pool concurrency must be at least 1",
            ));
        }
        if config.poll_interval.is_zero() {
            return Err(DomainError::validation("worker poll interval must be positive"));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let notifier = store.notifier();

        let mut tasks = Vec::with_capacity(config.concurrency);
        for index in 0..config.concurrency {
            let worker = Worker {
                id: config.worker_id(index)?,
                store: store.clone(),
                processor: processor.clone(),
                notifier: notifier.clone(),
                shutdown: shutdown_rx.clone(),
                counters: counters.clone(),
                poll_interval: config.poll_interval,
                error_backoff: config.error_backoff,
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        info!(pool = %config.name, concurrency = config.concurrency, "worker pool started");

        Ok(WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
            counters,
        })
    }
}

struct Worker<S, P> {
    id: WorkerId,
    store: S,
    processor: P,
    notifier: Option<JobNotifier>,
    shutdown: watch::Receiver<bool>,
    counters: Arc<Counters>,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl<S, P> Worker<S, P>
where
    S: JobStore,
    P: JobProcessor,
{
    async fn run(mut self) {
        debug!(worker_id = %self.id, "worker started");

        while !*self.shutdown.borrow() {
            match run_once(&self.store, &self.processor, &self.id).await {
                Ok(Some(outcome)) => {
                    self.counters.record(&outcome);
                    if let CycleOutcome::Failed(job) = &outcome {
                        warn!(
                            worker_id = %self.id,
                            job_id = %job.id,
                            attempts = job.attempts,
                            "job failed permanently"
                        );
                    }
                }
                Ok(None) => {
                    if !self.idle(self.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    error!(worker_id = %self.id, error = %e, "job store error");
                    if !self.idle(self.error_backoff).await {
                        break;
                    }
                }
            }
        }

        debug!(worker_id = %self.id, "worker stopped");
    }

    /// Wait for a notification, the timeout, or shutdown.
    ///
    /// Returns `false` once the worker should stop.
    async fn idle(&mut self, timeout: Duration) -> bool {
        let notifier = self.notifier.clone();
        let notified = async move {
            match notifier {
                Some(notifier) => notifier.notified().await,
                None => std::future::pending::<()>().await,
            }
        };

        let stop = tokio::select! {
            changed = self.shutdown.changed() => changed.is_err(),
            _ = tokio::time::sleep(timeout) => false,
            _ = notified => false,
        };

        !stop && !*self.shutdown.borrow()
    }
}
