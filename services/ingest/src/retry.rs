//! Catalog update submission with bounded exponential backoff.

use crate::catalog::{CatalogError, CatalogService, UpdateRequest, UpdateResponse};
use crate::config::RetryConfig;
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timing bounds for one retried update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Settle time before the first attempt
    pub initial_delay: Duration,
    /// Wait after the first failure; doubles after each further failure
    pub initial_wait: Duration,
    /// Total time spent retrying before the failure is returned
    pub max_wait: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay(),
            initial_wait: config.initial_wait(),
            max_wait: config.max_wait(),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_wait,
            initial_interval: self.initial_wait,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: self.max_wait.max(self.initial_wait),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns false when
/// interrupted.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Submit `request`, retrying failures until `policy.max_wait` has elapsed.
///
/// `on_success` runs once with the catalog's response before this returns.
/// An interrupted sleep abandons the submission and yields `Ok(None)`; the
/// last catalog error is returned once the retry budget is spent.
pub async fn submit_update_with_retry<F>(
    catalog: &dyn CatalogService,
    request: UpdateRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    on_success: F,
) -> Result<Option<UpdateResponse>, CatalogError>
where
    F: FnOnce(&UpdateResponse),
{
    if !pause(policy.initial_delay, cancel).await {
        debug!(record_id = %request.record.id, "Update abandoned before first attempt");
        return Ok(None);
    }

    let started = Instant::now();
    let mut backoff = policy.backoff();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match catalog.update(request.clone()).await {
            Ok(response) => {
                debug!(record_id = %request.record.id, attempts, "Update submitted");
                on_success(&response);
                return Ok(Some(response));
            }
            Err(e) => {
                let elapsed = started.elapsed();
                if elapsed >= policy.max_wait {
                    warn!(
                        record_id = %request.record.id,
                        attempts,
                        error = %e,
                        "Update retries exhausted"
                    );
                    return Err(e);
                }

                let remaining = policy.max_wait - elapsed;
                let wait = backoff
                    .next_backoff()
                    .unwrap_or(policy.max_wait)
                    .min(remaining);

                warn!(
                    record_id = %request.record.id,
                    attempt = attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "Update failed, retrying"
                );

                if !pause(wait, cancel).await {
                    debug!(record_id = %request.record.id, "Update retry interrupted");
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MockCatalogService, Update};
    use crate::record::Record;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn create_test_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::ZERO,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(60),
        }
    }

    fn create_test_request() -> UpdateRequest {
        UpdateRequest {
            record: Record::with_id("parent"),
        }
    }

    fn response_for(request: &UpdateRequest) -> UpdateResponse {
        UpdateResponse {
            updates: vec![Update {
                old: request.record.clone(),
                new: request.record.clone(),
            }],
        }
    }

    fn within(actual: Duration, expected: Duration) -> bool {
        actual >= expected && actual < expected + Duration::from_millis(50)
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_double_between_failures() {
        let attempts_at = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicU32::new(0));

        let mut catalog = MockCatalogService::new();
        {
            let attempts_at = attempts_at.clone();
            let calls = calls.clone();
            catalog.expect_update().returning(move |request| {
                attempts_at.lock().push(Instant::now());
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CatalogError::Unavailable("down".to_string()))
                } else {
                    Ok(response_for(&request))
                }
            });
        }

        let callbacks = AtomicU32::new(0);
        let result = submit_update_with_retry(
            &catalog,
            create_test_request(),
            &create_test_policy(),
            &CancellationToken::new(),
            |_| {
                callbacks.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert!(matches!(result, Ok(Some(_))));
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);

        let attempts_at = attempts_at.lock();
        assert_eq!(attempts_at.len(), 3);
        assert!(within(attempts_at[1] - attempts_at[0], Duration::from_secs(1)));
        assert!(within(attempts_at[2] - attempts_at[1], Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_propagates_after_max_wait() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut catalog = MockCatalogService::new();
        {
            let calls = calls.clone();
            catalog.expect_update().returning(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CatalogError::Unavailable("down".to_string()))
            });
        }

        let policy = RetryPolicy {
            max_wait: Duration::from_secs(5),
            ..create_test_policy()
        };
        let started = Instant::now();
        let result = submit_update_with_retry(
            &catalog,
            create_test_request(),
            &policy,
            &CancellationToken::new(),
            |_| panic!("callback must not run"),
        )
        .await;

        assert_eq!(
            result,
            Err(CatalogError::Unavailable("down".to_string()))
        );
        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_precedes_first_attempt() {
        let first_attempt = Arc::new(Mutex::new(None));
        let mut catalog = MockCatalogService::new();
        {
            let first_attempt = first_attempt.clone();
            catalog.expect_update().times(1).returning(move |request| {
                first_attempt.lock().get_or_insert(Instant::now());
                Ok(response_for(&request))
            });
        }

        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(2),
            ..create_test_policy()
        };
        let started = Instant::now();
        let result = submit_update_with_retry(
            &catalog,
            create_test_request(),
            &policy,
            &CancellationToken::new(),
            |_| {},
        )
        .await;

        assert!(matches!(result, Ok(Some(_))));
        let first = first_attempt.lock().expect("attempted");
        assert!(within(first - started, Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_sleep_gives_up_silently() {
        let mut catalog = MockCatalogService::new();
        catalog.expect_update().never();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            ..create_test_policy()
        };
        let result = submit_update_with_retry(
            &catalog,
            create_test_request(),
            &policy,
            &cancel,
            |_| panic!("callback must not run"),
        )
        .await;

        assert_eq!(result, Ok(None));
    }
}
