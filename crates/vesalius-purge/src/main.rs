mod setup;

use vesalius_core::DaemonConfig;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Load configuration
    let config = DaemonConfig::from_env()?;

    // Connect, migrate and wire the purge engine
    let daemon = setup::initialize_daemon(&config).await?;

    // Run until Ctrl+C / SIGTERM
    daemon.run().await;

    Ok(())
}
