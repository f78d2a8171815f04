//! Bounded retry with a fixed backoff.
//!
//! Runners wrap their critical sections (plan-and-apply, test runs) with
//! [`retry`] so every backend retries the same way.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::RetryError;

/// Run `action` up to `max_retries + 1` times, sleeping `backoff` between attempts.
///
/// The attempt index handed to `action` is 0-based. No sleep happens after the
/// final attempt, and the action is not called again once retries are exhausted.
pub async fn retry<F, Fut, E>(
    description: &str,
    max_retries: u32,
    backoff: Duration,
    mut action: F,
) -> Result<(), RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        let err = match action(attempt).await {
            Ok(()) => {
                if attempt > 0 {
                    debug!(description, attempt, "Succeeded after retry");
                }
                return Ok(());
            }
            Err(err) => err,
        };

        if attempt >= max_retries {
            return Err(RetryError::MaxRetriesExceeded {
                description: description.to_string(),
                retries: max_retries,
                backoff,
                last_error: err.to_string(),
            });
        }

        warn!(
            description,
            attempt,
            max_retries,
            backoff_secs = backoff.as_secs_f64(),
            error = %err,
            "Attempt failed, retrying"
        );

        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry("noop", 3, Duration::ZERO, |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_calls_action_max_plus_one_times() {
        let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = attempts.clone();

        let result = retry("apply", 2, Duration::from_millis(1), |attempt| {
            let seen = seen.clone();
            async move {
                seen.lock().push(attempt);
                Err::<(), _>(format!("boom {attempt}"))
            }
        })
        .await;

        assert_eq!(*attempts.lock(), vec![0, 1, 2]);
        match result {
            Err(RetryError::MaxRetriesExceeded {
                description,
                retries,
                last_error,
                ..
            }) => {
                assert_eq!(description, "apply");
                assert_eq!(retries, 2);
                assert_eq!(last_error, "boom 2");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_on_later_attempt() {
        let result = retry("flaky", 3, Duration::ZERO, |attempt| async move {
            if attempt < 2 {
                Err("not yet")
            } else {
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_retry_zero_retries_does_not_sleep() {
        let start = std::time::Instant::now();
        let result = retry("once", 0, Duration::from_secs(5), |_| async {
            Err::<(), _>("failed")
        })
        .await;

        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
