//! Exponential backoff for transient LLM and storage failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::LlmError;

/// Base delay before the first retry.
const BASE_DELAY: Duration = Duration::from_millis(500);
/// Each retry doubles the previous delay.
const BACKOFF_FACTOR: u32 = 2;

/// Run `op` up to `max_attempts` times, sleeping `0.5s * 2^n` between
/// attempts. Only transient errors are retried; schema and 4xx API errors
/// surface immediately.
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    max_attempts: u32,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut delay = BASE_DELAY;

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(%err, attempt, max_attempts, label, "transient failure, backing off");
                tokio::time::sleep(delay).await;
                delay *= BACKOFF_FACTOR;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop either returns a value or the final error")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", 5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LlmError::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn schema_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("test", 5, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Schema("bad json".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_returns_last_error() {
        let result: Result<(), _> = with_backoff("test", 3, || async {
            Err(LlmError::Transient("still down".into()))
        })
        .await;

        assert!(matches!(result, Err(LlmError::Transient(_))));
    }
}
