//! Retry of commands that lost an optimistic-lock race.

use super::metrics::record_conflict_retry;
use crate::error::SubscriptionError;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ConflictRetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for ConflictRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(200),
        }
    }
}

/// Re-run `operation` from scratch while it fails with `ConcurrentModification`.
///
/// Every other error, and the conflict once the budget is spent, is returned
/// as is.
pub async fn retry_on_conflict<T, F, Fut>(
    command: &'static str,
    config: ConflictRetryConfig,
    mut operation: F,
) -> Result<T, SubscriptionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SubscriptionError>>,
{
    let backoff = ExponentialBackoff {
        initial_interval: config.initial_interval,
        current_interval: config.initial_interval,
        max_interval: config.max_interval,
        max_elapsed_time: None,
        ..Default::default()
    };
    let mut attempts = 0u32;

    retry(backoff, || {
        attempts += 1;
        let attempt = attempts;
        let fut = operation();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e @ SubscriptionError::ConcurrentModification { .. })
                    if attempt <= config.max_retries =>
                {
                    tracing::debug!(command, attempt, error = %e, "Retrying after conflict");
                    record_conflict_retry(command);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn conflict() -> SubscriptionError {
        SubscriptionError::ConcurrentModification {
            id: Uuid::nil(),
            expected: 1,
            actual: 2,
        }
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict("test", ConflictRetryConfig::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let config = ConflictRetryConfig {
            max_retries: 2,
            ..Default::default()
        };
        let result: Result<(), _> = retry_on_conflict("test", config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(conflict())
        })
        .await;

        assert!(matches!(
            result,
            Err(SubscriptionError::ConcurrentModification { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_on_conflict("test", ConflictRetryConfig::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SubscriptionError::AlreadyCanceled(Uuid::nil()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
