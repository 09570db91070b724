use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use warden_core::config::{AppConfig, LoadOptions};
use warden_worker::health::{self, HealthState};
use warden_worker::{bootstrap_with_config, ClassificationPoller, Classifier};

fn init_logging(config: &AppConfig) {
    use tracing::Level;
    use warden_core::config::LogFormat::*;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let worker = bootstrap_with_config(config).await?;
    let classifier: Arc<dyn Classifier> = worker.classifier.clone();

    health::spawn(
        &worker.config.server.bind_address,
        worker.config.server.health_check_port,
        HealthState::new(worker.db_pool.clone(), classifier.clone()),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut poller = ClassificationPoller::new(
        worker.event_log.clone(),
        classifier,
        worker.config.poller.polling_interval_minutes,
    );
    let poller_task = tokio::spawn(async move { poller.run(shutdown_rx).await });

    tracing::info!(event_name = "worker.started", "warden-worker started");
    tokio::signal::ctrl_c().await?;
    tracing::info!(event_name = "worker.stopping", "warden-worker stopping");

    // Receiver already gone means the poller has exited on its own.
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(worker.config.poller.shutdown_grace_secs);
    match tokio::time::timeout(grace, poller_task).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::warn!(event_name = "worker.poller.join_failed", error = %error, "poller task failed");
        }
        Err(_) => {
            tracing::warn!(
                event_name = "worker.poller.grace_elapsed",
                grace_secs = grace.as_secs(),
                "poller did not stop within the grace period"
            );
        }
    }

    worker.db_pool.close().await;
    tracing::info!(event_name = "worker.stopped", "warden-worker stopped");
    Ok(())
}
