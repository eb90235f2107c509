//! Polling primitive shared by every waiting helper
//!
//! `f` is invoked (immediately, if requested) and then once per interval until
//! it reports completion, returns an error, or the deadline elapses. `f` is
//! never re-entered concurrently.

use crate::error::{HarnessError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Poll `f` until it yields `Some`, fails, or `timeout` elapses.
///
/// `f` returns `Ok(Some(value))` when done, `Ok(None)` to keep polling, or
/// `Err` to abort. A timeout is reported as [`HarnessError::Timeout`] naming
/// `operation`.
pub async fn poll_until_timeout<T, F, Fut>(
    operation: &str,
    interval: Duration,
    timeout: Duration,
    immediate: bool,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempt = 0u64;

    if !immediate && !sleep_until_or_deadline(interval, deadline).await {
        return Err(HarnessError::timeout(operation, start.elapsed()));
    }

    loop {
        attempt += 1;
        trace!(operation = %operation, attempt = attempt, "Polling");

        match tokio::time::timeout_at(deadline, f()).await {
            Ok(Ok(Some(value))) => return Ok(value),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(HarnessError::timeout(operation, start.elapsed())),
        }

        if !sleep_until_or_deadline(interval, deadline).await {
            return Err(HarnessError::timeout(operation, start.elapsed()));
        }
    }
}

/// Sleep for `interval` unless that would pass `deadline`. Returns false when
/// the deadline was reached.
async fn sleep_until_or_deadline(interval: Duration, deadline: Instant) -> bool {
    let wake = Instant::now() + interval;
    if wake >= deadline {
        tokio::time::sleep_until(deadline).await;
        return false;
    }
    tokio::time::sleep_until(wake).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_does_not_sleep() {
        let start = Instant::now();
        let value = poll_until_timeout(
            "immediate",
            Duration::from_secs(10),
            Duration::from_secs(60),
            true,
            || async { Ok(Some(7)) },
        )
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_done() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let value = poll_until_timeout(
            "count to three",
            Duration::from_secs(1),
            Duration::from_secs(60),
            true,
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(if n == 3 { Some(n) } else { None })
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let result: Result<()> = poll_until_timeout(
            "never",
            Duration::from_secs(1),
            Duration::from_secs(5),
            true,
            || async { Ok(None) },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("never"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_aborts() {
        let result: Result<()> = poll_until_timeout(
            "abort",
            Duration::from_secs(1),
            Duration::from_secs(5),
            true,
            || async { Err(HarnessError::Contract("broken".into())) },
        )
        .await;

        assert!(matches!(result.unwrap_err(), HarnessError::Contract(_)));
    }
}
