//! Queue maintenance daemon: owns the schema, sweeps expired leases and
//! reports queue depth. Worker processes embed `ingestq_infra::jobs::WorkerPool`
//! against the same database.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use ingestq_infra::QueueConfig;
use ingestq_infra::jobs::{InMemoryJobStore, JobStore, LeaseSweeper, PostgresJobStore};

/// Build the store selected by `config`: Postgres when `DATABASE_URL` is set,
/// otherwise an in-memory store.
pub async fn connect_store(config: &QueueConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    let Some(url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; using in-memory job store (state is lost on exit)");
        return Ok(Arc::new(InMemoryJobStore::new().with_policy(config.retry.clone())));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool)
        .with_policy(config.retry.clone())
        .with_notify_channel(config.notify_channel.clone());
    store
        .ensure_schema()
        .await
        .context("failed to apply ingest queue schema")?;

    info!(
        max_connections = config.db_max_connections,
        notify_channel = %config.notify_channel,
        "connected to Postgres job store"
    );
    Ok(Arc::new(store))
}

/// Run until `shutdown` resolves.
pub async fn run<F>(config: QueueConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let store = connect_store(&config).await?;
    run_with_store(store, &config, shutdown).await
}

/// Run the sweeper and stats reporting against an existing store.
pub async fn run_with_store<F>(
    store: Arc<dyn JobStore>,
    config: &QueueConfig,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    config.validate()?;

    let sweeper = LeaseSweeper::new(store.clone(), config.sweeper()).spawn();
    let mut report = tokio::time::interval(config.sweep_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        max_attempts = config.retry.max_attempts,
        lease_ttl_secs = config.lease_ttl.as_secs(),
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "ingestq daemon started"
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = report.tick() => log_stats(store.as_ref()).await,
        }
    }

    let reclaimed = sweeper.shutdown().await;
    info!(reclaimed, "ingestq daemon stopped");
    Ok(())
}

async fn log_stats(store: &dyn JobStore) {
    match store.stats().await {
        Ok(stats) => info!(
            queued = stats.queued,
            processing = stats.processing,
            retry = stats.retry,
            completed = stats.completed,
            failed = stats.failed,
            "queue stats"
        ),
        Err(e) => warn!(error = %e, "failed to read queue stats"),
    }
}
