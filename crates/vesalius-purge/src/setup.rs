//! Daemon setup and initialization

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use vesalius_core::{ConfigStore, DaemonConfig, JsonFileConfigStore};
use vesalius_db::{connect, listen_export_events, run_migrations, PgPurgeRepository};
use vesalius_infra::{init_telemetry, shutdown_signal, shutdown_telemetry};
use vesalius_purge::{ConfigHandle, ExportCompletionTrigger, PurgeContext, PurgeScheduler};
use vesalius_storage::DefaultStorageFactory;

const SERVICE_NAME: &str = "vesalius-purged";
const EXPORT_EVENT_BUFFER: usize = 64;

pub struct Daemon {
    pool: sqlx::PgPool,
    scheduler: Arc<PurgeScheduler>,
}

/// Initialize telemetry, the database and the purge engine.
pub async fn initialize_daemon(config: &DaemonConfig) -> Result<Daemon> {
    config.validate().context("Configuration validation failed")?;

    init_telemetry(config.log_format, SERVICE_NAME)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(
        environment = %config.environment,
        archive_config = %config.archive_config_path.display(),
        "Configuration loaded and validated successfully"
    );

    let pool = connect(config).await?;
    run_migrations(&pool).await?;

    let store: Arc<dyn ConfigStore> =
        Arc::new(JsonFileConfigStore::new(config.archive_config_path.clone()));
    let archive_config = ConfigHandle::load(store).await.with_context(|| {
        format!(
            "Failed to load archive configuration {}",
            config.archive_config_path.display()
        )
    })?;

    let ctx = PurgeContext::new(
        Arc::new(PgPurgeRepository::new(pool.clone())),
        Arc::new(DefaultStorageFactory::new()),
        Arc::new(archive_config),
    );

    Ok(Daemon {
        pool,
        scheduler: Arc::new(PurgeScheduler::new(ctx)),
    })
}

impl Daemon {
    /// Run the scheduler and the export trigger until a shutdown signal arrives.
    pub async fn run(self) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(EXPORT_EVENT_BUFFER);

        let listener = tokio::spawn(listen_export_events(self.pool.clone(), event_tx));
        let trigger =
            tokio::spawn(ExportCompletionTrigger::new(self.scheduler.clone()).run(event_rx));
        let scheduler = tokio::spawn(self.scheduler.clone().start(shutdown_rx));

        shutdown_signal().await;
        tracing::info!("Shutdown signal received");

        if let Err(e) = shutdown_tx.send(()).await {
            tracing::warn!(error = %e, "Failed to send shutdown signal to purge scheduler");
        }
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Purge scheduler task failed");
        }

        // Dropping the listener closes the event channel, which ends the trigger.
        listener.abort();
        let _ = trigger.await;

        self.pool.close().await;
        shutdown_telemetry().await;
        tracing::info!("Purge daemon stopped");
    }
}
