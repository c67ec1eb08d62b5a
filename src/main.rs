use std::sync::Arc;

use anyhow::{Error, Result};
use event_reliability::{
    api::run_health_server, config::Config, context::AppContext, utils::init_tracing,
};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing()?;

    info!(
        subject_prefix = %config.dlq_subject_prefix,
        alert_error_types = ?config.alert_error_types(),
        "Starting DLQ monitor"
    );

    let ctx = AppContext::connect(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Arc::new(ctx.dlq_monitor());
    let monitor_task = Arc::clone(&monitor).spawn(shutdown_rx.clone());

    let health_task = tokio::spawn(run_health_server(
        config.server_port,
        ctx.health_checker(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    match monitor_task.await {
        Ok(Err(e)) => error!(error = %e, "DLQ monitor stopped with error"),
        Err(e) => error!(error = %e, "DLQ monitor task panicked"),
        Ok(Ok(())) => {}
    }

    match health_task.await {
        Ok(Err(e)) => error!(error = %e, "Health server stopped with error"),
        Err(e) => error!(error = %e, "Health server task panicked"),
        Ok(Ok(())) => {}
    }

    ctx.close().await?;
    info!("DLQ monitor shut down");

    Ok(())
}
