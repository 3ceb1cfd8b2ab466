use anyhow::Context;

use ingestq_infra::QueueConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ingestq_observability::init();

    let config = QueueConfig::from_env().context("invalid ingestq configuration")?;
    ingestq_daemon::run(config, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
