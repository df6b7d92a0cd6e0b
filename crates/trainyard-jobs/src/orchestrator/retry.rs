//! Retrying job state store writes.

use std::future::Future;

use tracing::warn;
use trainyard_core::config::RetryConfig;

use crate::storage::DatabaseError;

/// Whether a failed store write is worth repeating.
const fn is_transient(error: &DatabaseError) -> bool {
    matches!(error, DatabaseError::Connection(_) | DatabaseError::Query(_))
}

/// Run `op` until it succeeds, a non-transient error occurs, or
/// `config.max_retries` retries are used up, sleeping with exponential
/// backoff in between.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    mut op: F,
) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retry < config.max_retries && is_transient(&e) => {
                retry += 1;
                let delay = config.delay_for(retry);
                warn!(
                    operation,
                    retry,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Store write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
