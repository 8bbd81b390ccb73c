//! Export completion notifications over Postgres LISTEN/NOTIFY.
//!
//! The exporter publishes one JSON-encoded [`ExportCompleted`] per finished export on
//! [`EXPORT_COMPLETED_CHANNEL`].

use sqlx::postgres::{PgListener, PgNotification};
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use vesalius_core::{AppError, ExportCompleted};

pub const EXPORT_COMPLETED_CHANNEL: &str = "vesalius_export_completed";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Decode the payload of one notification.
pub fn parse_export_completed(payload: &str) -> Result<ExportCompleted, AppError> {
    serde_json::from_str(payload)
        .map_err(|e| AppError::InvalidData(format!("Invalid export notification: {}", e)))
}

/// Forward export notifications to `tx` until the receiving side is dropped.
///
/// Reconnects after connection failures. Notifications sent while disconnected are
/// lost; the scheduled purge cycle covers them.
pub async fn listen_export_events(pool: PgPool, tx: mpsc::Sender<ExportCompleted>) {
    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::warn!(error = %e, "PgListener connect failed, will retry");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        if let Err(e) = listener.listen(EXPORT_COMPLETED_CHANNEL).await {
            tracing::warn!(error = %e, "LISTEN failed, will retry");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        tracing::info!(channel = EXPORT_COMPLETED_CHANNEL, "Listening for export notifications");

        loop {
            match listener.recv().await {
                Ok(notification) => {
                    if !forward(&notification, &tx).await {
                        tracing::info!("Export notification receiver closed");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Export notification listener failed, reconnecting");
                    break;
                }
            }
        }
    }
}

/// Returns false once the receiver is gone.
async fn forward(notification: &PgNotification, tx: &mpsc::Sender<ExportCompleted>) -> bool {
    match parse_export_completed(notification.payload()) {
        Ok(event) => tx.send(event).await.is_ok(),
        Err(e) => {
            tracing::warn!(payload = notification.payload(), error = %e, "Dropping export notification");
            !tx.is_closed()
        }
    }
}
