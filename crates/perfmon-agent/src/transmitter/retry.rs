//! Retrying delivery

use std::future::Future;

use perfmon_http::RetryConfig;
use tokio_util::sync::CancellationToken;

use crate::error::{PerfmonError, Result};

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Non-retryable errors end the loop at once. Backoff sleeps are cut short
/// by `cancel`.
pub(crate) async fn with_retry<F, Fut>(
    policy: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let attempts = policy.total_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= attempts {
            return Err(err);
        }

        let delay = policy.delay_for_retry(attempt);
        tracing::warn!(
            what = what,
            attempt = attempt,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err.sanitized_message(),
            "Delivery failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(PerfmonError::Runtime(format!(
                    "{} abandoned during shutdown after {} attempt(s): {}",
                    what,
                    attempt,
                    err.sanitized_message()
                )));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
