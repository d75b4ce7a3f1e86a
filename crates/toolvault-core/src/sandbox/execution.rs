//! Launch controls: retry with exponential backoff for platform errors.
//!
//! Only `RuntimeError::Unavailable` is retried. Timeouts, cancellation and
//! anything the tool itself did are returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::runtime::RuntimeError;
use crate::config::EngineConfig;
use crate::metrics::METRICS;
use crate::obs::emit_platform_retry;

/// Retry settings for platform failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.platform_retries,
            backoff_base_ms: config.backoff_base_ms,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Result of a retried launch.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, RuntimeError>,
    /// Attempts made (1 = no retries used).
    pub attempts: u32,
}

/// Run `launch` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Cancellation during a backoff ends the loop.
pub async fn launch_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    tool_id: &str,
    cancel: &CancellationToken,
    mut launch: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempt = 1;
    loop {
        let result = launch().await;
        match result {
            Err(RuntimeError::Unavailable(ref reason)) if attempt < max_attempts => {
                let delay = policy.backoff_delay(attempt);
                emit_platform_retry(tool_id, attempt, delay.as_millis() as u64, reason);
                METRICS.inc_platform_retries();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Attempted {
                            result: Err(RuntimeError::Cancelled),
                            attempts: attempt,
                        };
                    }
                }
                attempt += 1;
            }
            result => {
                return Attempted {
                    result,
                    attempts: attempt,
                }
            }
        }
    }
}
