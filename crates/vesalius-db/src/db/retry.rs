//! Bounded retry with linear back-off for transient database failures.

use std::future::Future;
use std::time::Duration;
use vesalius_core::{AppError, ErrorMetadata};

/// Run `f` until it succeeds, fails with an unrecoverable error, or `max_retries`
/// retries are used up. The delay before retry `n` is `base_delay * n`.
pub async fn retry_with_delay<T, F, Fut>(
    operation: &str,
    max_retries: u32,
    base_delay: Duration,
    mut f: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && e.is_recoverable() => {
                attempt += 1;
                let delay = base_delay * attempt;
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    max_retries = max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Database operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
