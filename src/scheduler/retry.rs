use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;

const BASE_BACKOFF_MS: u64 = 10;

/// Jittered exponential backoff for the given (1-based) retry attempt.
pub fn conflict_backoff(attempt: u32) -> Duration {
    let ceiling = BASE_BACKOFF_MS << attempt.min(6);
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(ceiling / 2..=ceiling))
}

/// Runs `op` up to `attempts` times while it fails with a retryable error.
///
/// Any other outcome, success or a non-retryable error, is returned as is.
/// With `attempts` of 0 or 1 the operation runs exactly once.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < attempts => {
                let delay = conflict_backoff(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying after conflict");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}
