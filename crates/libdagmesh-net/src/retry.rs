use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::NetError;

/// Run `op` until it succeeds, fails with a non-conflict error, or has hit
/// `TransactionConflict` `max_attempts` times. The closure gets the attempt
/// number starting at 1 and must re-read any state it depends on.
pub async fn retry_on_conflict<T, F, Fut>(
    max_attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, NetError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, NetError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                debug!(attempt, max_attempts, error = %e, "conflict, retrying");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
