//! Periodic return of abandoned leases to the queue.
//!
//! A worker that crashes after `claim` leaves its job in `processing`. The
//! sweeper moves such jobs back to `retry` once their lease is older than the
//! TTL. No attempt is charged; the job keeps its current count.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::store::{JobStore, JobStoreError};
use super::types::Job;

/// Lease sweeper configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Age after which a `processing` lease counts as abandoned
    pub lease_ttl: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }
}

#[derive(Debug)]
pub struct LeaseSweeper<S> {
    store: S,
    config: SweeperConfig,
}

impl<S> LeaseSweeper<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: S, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    /// Run a single sweep.
    pub async fn sweep_once(&self) -> Result<Vec<Job>, JobStoreError> {
        let reclaimed = self.store.reclaim_expired_leases(self.config.lease_ttl).await?;
        for job in &reclaimed {
            warn!(
                job_id = %job.id,
                resource_id = %job.resource_id,
                attempts = job.attempts,
                "reclaimed job with expired lease"
            );
        }
        Ok(reclaimed)
    }

    /// Sweep immediately and then every `interval` until shut down.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let reclaimed = Arc::new(AtomicU64::new(0));
        let total = reclaimed.clone();
        let period = self.config.interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            info!(
                interval_secs = period.as_secs_f64(),
                lease_ttl_secs = self.config.lease_ttl.as_secs(),
                "lease sweeper started"
            );

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match self.sweep_once().await {
                    Ok(jobs) => {
                        total.fetch_add(jobs.len() as u64, Ordering::Relaxed);
                    }
                    Err(e) => error!(error = %e, "lease sweep failed"),
                }
            }

            info!("lease sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join,
            reclaimed,
        }
    }
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    reclaimed: Arc<AtomicU64>,
}

impl SweeperHandle {
    /// Number of jobs reclaimed since the sweeper started.
    pub fn total_reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Stop sweeping and wait for the task to finish.
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "lease sweeper task ended abnormally");
        }
        self.reclaimed.load(Ordering::Relaxed)
    }
}
