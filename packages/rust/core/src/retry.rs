//! Retry policy for per-record pipelines.

use std::future::Future;

use reservoir_shared::Result;
use tracing::warn;

/// Run `op`, re-running it up to `retries` more times on a retryable error.
///
/// `op` receives the attempt number (0 for the first run) and must start from
/// scratch each time, e.g. in a fresh transaction. Non-retryable errors and
/// the error of the last attempt are returned as is.
pub async fn with_retry<T, F, Fut>(retries: usize, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retries && e.is_retryable() => {
                warn!(attempt, error = %e, "retrying after failure");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reservoir_shared::ReservoirError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn conflict_is_retried_once() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(1, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(ReservoirError::Conflict("duplicate".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_failure_surfaces() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry(1, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ReservoirError::Conflict("duplicate".into())) }
        })
        .await;
        assert!(matches!(result, Err(ReservoirError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn validation_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry(3, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ReservoirError::validation("no localId")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
