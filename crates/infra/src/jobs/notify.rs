//! Wake-up signal for idle workers.
//!
//! Purely an optimisation: workers always fall back to polling, so a lost
//! notification only costs latency.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::JobStoreError;

/// Cloneable handle that wakes one waiting worker per notification.
#[derive(Debug, Clone, Default)]
pub struct JobNotifier {
    inner: Arc<Notify>,
}

impl JobNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that a job became claimable.
    ///
    /// If no worker is waiting, the permit is kept for the next one.
    pub fn notify(&self) {
        self.inner.notify_one();
    }

    /// Wait for the next signal.
    pub async fn notified(&self) {
        self.inner.notified().await;
    }
}

/// Relays Postgres `NOTIFY` messages on a channel into a [`JobNotifier`].
#[derive(Debug)]
pub struct PgJobListener;

impl PgJobListener {
    /// Subscribe to `channel` and spawn the relay task.
    ///
    /// Fails only if the initial `LISTEN` cannot be established; later
    /// connection errors are logged and retried by the relay.
    pub async fn spawn(
        pool: &PgPool,
        channel: &str,
        notifier: JobNotifier,
    ) -> Result<JoinHandle<()>, JobStoreError> {
        let mut listener = PgListener::connect_with(pool).await.map_err(|e| {
            JobStoreError::StorageUnavailable(format!("listener connect failed: {e}"))
        })?;
        listener.listen(channel).await.map_err(|e| {
            JobStoreError::StorageUnavailable(format!("LISTEN {channel} failed: {e}"))
        })?;

        info!(channel = %channel, "listening for job notifications");

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        debug!(job_id = %notification.payload(), "job notification received");
                        notifier.notify();
                    }
                    Err(e) => {
                        warn!(error = %e, "job notification listener error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permit_is_kept_for_a_late_waiter() {
        let notifier = JobNotifier::new();
        notifier.notify();

        tokio::time::timeout(Duration::from_millis(100), notifier.notified())
            .await
            .expect("stored permit should wake the waiter");
    }

    #[tokio::test]
    async fn clones_share_the_signal() {
        let notifier = JobNotifier::new();
        let waiter = notifier.clone();

        let handle = tokio::spawn(async move { waiter.notified().await });
        tokio::task::yield_now().await;
        notifier.notify();

        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }
}
