//! Exponential backoff for gateway requests: jitter-free doubling from a
//! per-error base (2 s network/timeout, 5 s rate-limit), three attempts.

use std::future::Future;

use tokio::time::sleep;
use tracing::warn;

use super::LlmError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Run `operation` until it succeeds, fails fatally, or attempts run out.
/// Only retryable errors (5xx, 429, timeouts, transport) sleep and loop.
pub async fn retry_llm<F, Fut, T>(policy: RetryPolicy, mut operation: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt + 1 < policy.max_attempts {
                    let delay = err.backoff_base() * 2u32.pow(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = policy.max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "gateway request failed, backing off"
                    );
                    platform::record_counter("gateway_retries_total", 1);
                    sleep(delay).await;
                }
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or(LlmError::EmptyResponse { provider: "gateway" }))
}
