//! Retry policies for store operations.
//!
//! Two failure classes are retried, each differently:
//!
//! - `Conflict`: re-read and retry exactly once, then surface
//! - `Storage`: bounded exponential backoff
//!
//! `AccessDenied`, `Malformed` and everything else propagate immediately.
use crate::error::{SwarmError, SwarmResult};
use crate::types::OpContext;
use std::future::Future;
use std::time::Duration;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Run `op`, retrying once if it fails with `Conflict`.
pub fn retry_conflict_once<T, F>(partition: &str, key: &str, mut op: F) -> SwarmResult<T>
where
    F: FnMut() -> SwarmResult<T>,
{
    match op() {
        Err(SwarmError::Conflict {
            expected, actual, ..
        }) => {
            tracing::debug!(partition, key, expected, actual, "Version conflict, retrying once");
            op()
        }
        other => other,
    }
}

/// Run `op` up to `attempts` times while it fails with `Storage`.
///
/// Sleeps `initial`, `2 * initial`, `4 * initial`... between attempts,
/// capped at five seconds per sleep. The caller's deadline bounds the total:
/// once a sleep would overrun it the last error is returned.
pub async fn with_backoff<T, F, Fut>(
    ctx: &OpContext,
    attempts: u32,
    initial: Duration,
    mut op: F,
) -> SwarmResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SwarmResult<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = initial;
    let mut attempt = 1;

    loop {
        ctx.check_deadline("storage")?;
        match op().await {
            Err(SwarmError::Storage(reason)) if attempt < attempts => {
                if ctx.remaining().is_some_and(|left| left < delay) {
                    return Err(SwarmError::Storage(reason));
                }
                tracing::warn!(
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Storage operation failed, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
            other => return other,
        }
    }
}
