//! Exponential-backoff retry driver with a classified retry predicate.
//!
//! Wraps outbound provider HTTP calls. Connection errors, timeouts, and
//! provider {429, 500, 502, 503, 504} are retried with `base × 2^attempt`
//! backoff up to `max_retries`; everything else propagates immediately.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::GatewayError;

/// Backoff ceiling; doubling stops here.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Run `op` with retries per `config`. `op` receives the attempt number
/// (0-based) so callers can log it.
pub async fn with_backoff<T, F, Fut>(
    target: &str,
    config: &RetryConfig,
    mut op: F,
) -> crate::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let base = Duration::from_millis(config.base_delay_ms);
    let mut attempt: u32 = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < config.max_retries => {
                let delay = backoff_delay(base, attempt);
                tracing::warn!(
                    target_id = %target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `base × 2^attempt`, capped.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    std::cmp::min(base.saturating_mul(factor), BACKOFF_MAX)
}

/// Classify a reqwest transport error into a gateway kind.
pub fn classify_transport(target: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(target.to_string())
    } else {
        GatewayError::Io(target.to_string(), err.to_string())
    }
}

/// Classify a non-success provider HTTP status into a gateway kind.
pub fn classify_status(status: u16, message: String) -> GatewayError {
    match status {
        401 | 403 => GatewayError::Auth(message),
        429 => GatewayError::RateLimited(message),
        400..=499 => GatewayError::Client { status, message },
        _ => GatewayError::Server { status, message },
    }
}
