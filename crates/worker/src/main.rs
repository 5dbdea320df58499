mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::Result;
use procura_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.trim().to_ascii_lowercase()));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.worker.bind_address,
        app.config.worker.health_check_port,
        app.db_pool.clone(),
        app.engine.clone(),
    )
    .await?;

    tracing::info!(
        event_name = "system.worker.started",
        correlation_id = "bootstrap",
        resumed_delegations = app.resumed.delegations,
        resumed_approvals = app.resumed.approvals,
        "procura worker started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        event_name = "system.worker.stopping",
        correlation_id = "shutdown",
        "procura worker stopping"
    );

    app.engine.shutdown().await;
    let grace = Duration::from_secs(app.config.worker.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.db_pool.close()).await.is_err() {
        tracing::warn!(
            event_name = "system.worker.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = app.config.worker.graceful_shutdown_secs,
            "database pool did not close within the grace period"
        );
    }

    Ok(())
}
